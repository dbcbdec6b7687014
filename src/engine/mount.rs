/*!
 * Filesystem source adapter for MTP/GVFS mounts
 *
 * MTP mounts lie about being a filesystem: directory reads can take
 * minutes, reads can stall forever and the whole mount can vanish between
 * two syscalls. The scanner therefore reads each directory on a detached
 * thread and drains entries against a deadline, and every copy runs under
 * stall supervision.
 */

use crate::cancel::CancelToken;
use crate::checksum::StreamingHasher;
use crate::config::{BackupConfig, PRIORITY_DIRS};
use crate::engine::adapter::{CopyOutput, FileJob, JobSink, SourceCopier, SourceScanner};
use crate::engine::copier::{supervise, Abort, SupervisorBudget};
use crate::error::{classify_root_stat, Result, SalvageError};
use crate::journal::{normalize_path, DirStatus, Journal};
use crossbeam_channel::{after, bounded, select, unbounded, Sender};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Concurrent descent width for non-priority directories. MTP transports
/// degrade quickly past a handful of outstanding requests.
const SCAN_THREADS: usize = 4;

const COPY_BUF_SIZE: usize = 64 * 1024;

struct EntryInfo {
    path: PathBuf,
    is_dir: bool,
    size: Option<u64>,
}

enum ReadDirEnd {
    Complete,
    TimedOut,
    Failed(std::io::Error),
    Cancelled,
}

pub struct MountAdapter {
    config: BackupConfig,
    root: PathBuf,
    journal: Arc<Journal>,
    scan_pool: rayon::ThreadPool,
}

impl MountAdapter {
    pub fn new(config: BackupConfig, journal: Arc<Journal>) -> Self {
        let scan_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(SCAN_THREADS)
            .thread_name(|i| format!("salvage-scan-{}", i))
            .build()
            .unwrap_or_else(|_| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .build()
                    .expect("single-thread pool")
            });
        let root = config.source_root.clone();
        Self {
            config,
            root,
            journal,
            scan_pool,
        }
    }

    /// Read a directory's entries on a detached thread, draining against
    /// the configured deadline. On timeout the entries that already
    /// arrived are returned; the reader thread dies quietly when its
    /// channel closes.
    fn read_dir_entries(&self, dir: &Path, token: &CancelToken) -> (Vec<EntryInfo>, ReadDirEnd) {
        let (tx, rx) = unbounded::<std::result::Result<EntryInfo, std::io::Error>>();
        let read_root = dir.to_path_buf();
        thread::spawn(move || {
            let iter = match fs::read_dir(&read_root) {
                Ok(iter) => iter,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            for entry in iter {
                let info = entry.and_then(|e| {
                    let file_type = e.file_type()?;
                    let size = if file_type.is_file() {
                        e.metadata().ok().map(|m| m.len())
                    } else {
                        None
                    };
                    Ok(EntryInfo {
                        path: e.path(),
                        is_dir: file_type.is_dir(),
                        size,
                    })
                });
                if tx.send(info).is_err() {
                    return;
                }
            }
        });

        let deadline = after(self.config.dir_read_timeout);
        let mut entries = Vec::new();
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(Ok(info)) => entries.push(info),
                    Ok(Err(e)) => return (entries, ReadDirEnd::Failed(e)),
                    Err(_) => return (entries, ReadDirEnd::Complete),
                },
                recv(deadline) -> _ => return (entries, ReadDirEnd::TimedOut),
                recv(token.watch()) -> _ => return (entries, ReadDirEnd::Cancelled),
            }
        }
    }

    fn priority_rank(&self, dir: &Path) -> Option<usize> {
        let rel = normalize_path(dir, &self.root);
        PRIORITY_DIRS.iter().position(|p| rel.ends_with(p))
    }

    fn scan_dir(&self, dir: &Path, token: &CancelToken, sink: &JobSink, errors: &Sender<SalvageError>) {
        if token.is_cancelled() {
            return;
        }
        if self.journal.can_skip_dir(dir, &self.root) {
            tracing::debug!("skipping completed directory {}", dir.display());
            return;
        }

        let (entries, end) = self.read_dir_entries(dir, token);
        let mut terminal = false;
        match end {
            ReadDirEnd::Cancelled => return,
            ReadDirEnd::Failed(e) => {
                terminal = true;
                let _ = self.journal.set_dir_status(dir, DirStatus::Error);
                let _ = errors.send(SalvageError::DirRead {
                    dir: dir.to_path_buf(),
                    source: e,
                });
            }
            ReadDirEnd::TimedOut => {
                terminal = true;
                let _ = self.journal.set_dir_status(dir, DirStatus::Timeout);
                let _ = errors.send(SalvageError::DirReadTimeout {
                    dir: dir.to_path_buf(),
                });
            }
            ReadDirEnd::Complete => {}
        }

        let mut subdirs = Vec::new();
        for info in entries {
            if info.is_dir {
                subdirs.push(info.path);
            } else {
                self.journal.note_discovered(dir, &info.path);
                let relative = info
                    .path
                    .strip_prefix(&self.root)
                    .unwrap_or(&info.path)
                    .to_path_buf();
                let pushed = sink.push(FileJob {
                    source: info.path,
                    relative,
                    size: info.size,
                });
                if !pushed {
                    return;
                }
            }
        }

        let mut priority: Vec<(usize, PathBuf)> = Vec::new();
        let mut rest: Vec<PathBuf> = Vec::new();
        for sub in subdirs {
            match self.priority_rank(&sub) {
                Some(rank) => priority.push((rank, sub)),
                None => rest.push(sub),
            }
        }
        priority.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        rayon::scope(|scope| {
            for (_, sub) in &priority {
                self.scan_dir(sub, token, sink, errors);
            }
            for sub in rest {
                scope.spawn(move |_| self.scan_dir(&sub, token, sink, errors));
            }
        });

        // A directory that timed out or errored keeps that status; anything
        // else completes only when every file seen under it is journalled.
        // Directories interrupted by cancellation are left partial so the
        // next run re-enters them.
        if !terminal {
            let status = if !token.is_cancelled()
                && self.journal.all_discovered_done(dir, &self.root)
            {
                DirStatus::Completed
            } else {
                DirStatus::Partial
            };
            let _ = self.journal.set_dir_status(dir, status);
        }
    }

    fn copy_loop(
        &self,
        source: &mut File,
        dest: &mut File,
        hasher: &mut StreamingHasher,
        bytes: &AtomicU64,
        abort: &Abort,
        progress: &Sender<u64>,
    ) -> Result<u64> {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut last_publish = Instant::now();
        loop {
            // Checked between reads so a stall or connection abort cannot
            // keep the worker in the loop past its budget.
            if let Some(err) = abort.take() {
                return Err(err);
            }
            let n = source.read(&mut buf)?;
            // Re-check after the read: a stall tripped while blocked above
            // must not let a late EOF pass as success.
            if let Some(err) = abort.take() {
                return Err(err);
            }
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            let total = bytes.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            if last_publish.elapsed() >= self.config.progress_interval {
                let _ = progress.try_send(total);
                last_publish = Instant::now();
            }
        }
        Ok(bytes.load(Ordering::Relaxed))
    }
}

impl SourceScanner for MountAdapter {
    fn scan(&self, token: &CancelToken, sink: &JobSink, errors: &Sender<SalvageError>) {
        self.scan_pool
            .install(|| self.scan_dir(&self.root, token, sink, errors));
    }
}

impl SourceCopier for MountAdapter {
    fn copy(
        &self,
        token: &CancelToken,
        job: &FileJob,
        dest: &Path,
        progress: &Sender<u64>,
    ) -> Result<CopyOutput> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut source = File::open(&job.source)?;
        let mut dest_file = File::create(dest)?;

        let mut hasher = StreamingHasher::new();
        let bytes = AtomicU64::new(0);
        let abort = Abort::new();
        let budget = SupervisorBudget {
            stall_timeout: self.config.stall_timeout,
            liveness_interval: self.config.copy_liveness_interval,
        };
        let (done_tx, done_rx) = bounded::<()>(0);

        let copied = thread::scope(|scope| {
            let bytes_ref = &bytes;
            let abort_ref = &abort;
            scope.spawn(move || {
                supervise(
                    token,
                    &job.source,
                    bytes_ref,
                    abort_ref,
                    &|| self.probe(),
                    budget,
                    done_rx,
                )
            });
            let result = self.copy_loop(
                &mut source,
                &mut dest_file,
                &mut hasher,
                &bytes,
                &abort,
                progress,
            );
            drop(done_tx);
            result
        });

        match copied.and_then(|n| {
            dest_file.sync_all()?;
            Ok(n)
        }) {
            Ok(n) => {
                if let Ok(meta) = fs::metadata(&job.source) {
                    if let Ok(mtime) = meta.modified() {
                        let _ = filetime::set_file_mtime(dest, FileTime::from_system_time(mtime));
                    }
                }
                let _ = progress.try_send(n);
                Ok(CopyOutput {
                    bytes: n,
                    digest: Some(hasher.finish()),
                })
            }
            Err(err) => {
                // Never leave a partial file behind.
                let _ = fs::remove_file(dest);
                Err(err)
            }
        }
    }

    fn probe(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(_) => Ok(()),
            Err(e) => Err(classify_root_stat(&self.root, e)),
        }
    }
}
