/*!
 * Worker pool and run statistics
 *
 * Workers consume file jobs, drive the copier, hash results and write the
 * journal. A separate aggregator folds per-job outcomes into the running
 * counters and publishes progress on the configured cadence.
 */

use crate::cancel::CancelToken;
use crate::checksum::hash_file;
use crate::config::{BackupConfig, Mode, MAX_FAILURES};
use crate::engine::adapter::{CopyOutput, FileJob, SourceCopier};
use crate::error::SalvageError;
use crate::journal::{normalize_path, Journal};
use crate::logging::ErrorLog;
use crate::reporter::{format_bytes, ProgressReporter, ProgressUpdate};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Sliding window over which the byte rate is computed
const RATE_WINDOW: Duration = Duration::from_secs(2);

/// Outcome of one job, as the aggregator sees it
#[derive(Debug, Clone, Copy)]
pub enum CopyStat {
    Success { bytes: u64 },
    Failure,
    Skipped,
    Timeout,
}

/// Final counters for a run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub timeouts: u64,
    pub bytes: u64,
}

impl RunStats {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

pub type StatusMap = Arc<Mutex<BTreeMap<usize, String>>>;

pub struct Worker {
    pub id: usize,
    pub token: CancelToken,
    pub config: BackupConfig,
    pub journal: Arc<Journal>,
    pub errlog: Arc<ErrorLog>,
    pub copier: Arc<dyn SourceCopier>,
    pub stats: Sender<CopyStat>,
    pub errors: Sender<SalvageError>,
    pub statuses: StatusMap,
    pub storage_root: PathBuf,
    pub done: Sender<usize>,
}

impl Worker {
    pub fn run(self, jobs: Receiver<FileJob>) {
        self.set_status("Idle");
        loop {
            let job = select! {
                recv(self.token.watch()) -> _ => break,
                recv(jobs) -> msg => match msg {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };
            self.process(job);
        }
        self.set_status("Idle");
        let _ = self.done.send(self.id);
    }

    fn process(&self, job: FileJob) {
        let dest = self
            .storage_root
            .join(normalize_path(&job.source, &self.config.source_root));

        // Resume fast-path: the journal says done and the bytes are there.
        if self.journal.is_done(&job.source, &self.config.source_root) {
            if dest.exists() {
                self.send_stat(CopyStat::Skipped);
                return;
            }
            self.errlog.note(&format!(
                "journalled as done but destination missing, re-copying: {}",
                job.source.display()
            ));
        }

        if !self.journal.should_retry(&job.source) {
            self.send_stat(CopyStat::Skipped);
            return;
        }

        let name = job
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.source.display().to_string());

        let total = if self.config.mode == Mode::Adb {
            job.size
        } else {
            match fs::metadata(&job.source) {
                Ok(meta) => Some(meta.len()),
                Err(e) => {
                    let _ = self.errors.send(SalvageError::StatIo {
                        path: job.source.clone(),
                        source: e,
                    });
                    job.size
                }
            }
        };

        self.set_status(&format!("Starting: {}", name));

        let result = {
            let (ptx, prx) = bounded::<u64>(10);
            thread::scope(|scope| {
                let drain = scope.spawn(|| self.drain_progress(prx, &name, total));
                let result = self.copier.copy(&self.token, &job, &dest, &ptx);
                drop(ptx);
                let _ = drain.join();
                result
            })
        };

        match result {
            Ok(output) => self.finish_success(&job, &dest, output),
            Err(err) if err.is_cancelled() => {}
            Err(err) if err.is_stall() => {
                let _ = self.errors.send(err);
                self.send_stat(CopyStat::Timeout);
            }
            Err(err) if err.is_critical() => {
                let _ = self.errors.send(err);
                self.send_stat(CopyStat::Failure);
            }
            Err(err) => {
                self.count_failure(&job);
                let _ = self.errors.send(err);
                self.send_stat(CopyStat::Failure);
            }
        }

        self.set_status("Idle");
    }

    fn finish_success(&self, job: &FileJob, dest: &std::path::Path, output: CopyOutput) {
        let bytes = output.bytes;
        // Mount copies digested their bytes on the way to disk; pulls that
        // landed outside the engine get hashed here.
        let dest_hash = match output.digest.map(Ok).unwrap_or_else(|| hash_file(dest)) {
            Ok(hash) => hash,
            Err(err) => {
                let _ = fs::remove_file(dest);
                self.count_failure(job);
                let _ = self.errors.send(err);
                self.send_stat(CopyStat::Failure);
                return;
            }
        };

        // Mount transfers are double-checked against the source bytes; a
        // bad read on a flaky transport shows up as a mismatch here.
        if self.config.mode != Mode::Adb {
            match hash_file(&job.source) {
                Ok(src_hash) => {
                    if src_hash != dest_hash {
                        let _ = fs::remove_file(dest);
                        self.count_failure(job);
                        let _ = self.errors.send(SalvageError::HashMismatch {
                            path: job.source.clone(),
                            expected: src_hash,
                            actual: dest_hash,
                        });
                        self.send_stat(CopyStat::Failure);
                        return;
                    }
                }
                Err(err) => {
                    let _ = fs::remove_file(dest);
                    self.count_failure(job);
                    let _ = self.errors.send(err);
                    self.send_stat(CopyStat::Failure);
                    return;
                }
            }
        }

        if let Err(err) =
            self.journal
                .mark_done(&job.source, &self.config.source_root, &dest_hash)
        {
            let _ = self.errors.send(err);
            self.send_stat(CopyStat::Failure);
            return;
        }
        if self.id == 0 {
            let _ = self.journal.flush();
        }
        self.send_stat(CopyStat::Success { bytes });
    }

    fn count_failure(&self, job: &FileJob) {
        match self.journal.record_failure(&job.source) {
            Ok(Some(count)) => {
                if count >= MAX_FAILURES {
                    self.errlog.note(&format!(
                        "retiring {} after {} failures",
                        job.source.display(),
                        count
                    ));
                }
            }
            Ok(None) => {}
            Err(err) => {
                let _ = self.errors.send(err);
            }
        }
    }

    fn drain_progress(&self, prx: Receiver<u64>, name: &str, total: Option<u64>) {
        let started = Instant::now();
        while let Ok(bytes) = prx.recv() {
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            };
            let line = match total {
                Some(total) if total > 0 => format!(
                    "Copying: {} ({}/{} {:.0}% {}/s)",
                    name,
                    format_bytes(bytes),
                    format_bytes(total),
                    (bytes as f64 / total as f64) * 100.0,
                    format_bytes(speed as u64)
                ),
                _ => format!(
                    "Copying: {} ({} {}/s)",
                    name,
                    format_bytes(bytes),
                    format_bytes(speed as u64)
                ),
            };
            self.set_status(&line);
        }
    }

    fn set_status(&self, status: &str) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.insert(self.id, status.to_string());
    }

    fn send_stat(&self, stat: CopyStat) {
        let _ = self.stats.send(stat);
    }
}

/// Fold job outcomes into counters and publish updates. Runs until the
/// stats channel closes (all workers gone) or the stop channel fires.
#[allow(clippy::too_many_arguments)]
pub fn run_stats(
    stats_rx: Receiver<CopyStat>,
    stop_rx: Receiver<()>,
    reporter: Arc<dyn ProgressReporter>,
    statuses: StatusMap,
    discovered: Arc<AtomicU64>,
    scan_complete: Arc<AtomicBool>,
    interval: Duration,
) -> RunStats {
    let ticker = tick(interval);
    let mut stats = RunStats::default();
    let mut consecutive_timeouts = 0u64;
    let mut window: VecDeque<(Instant, u64)> = VecDeque::new();
    let mut seq = 0u64;
    let mut emitted_bytes = 0u64;

    loop {
        select! {
            recv(stats_rx) -> msg => match msg {
                Ok(stat) => apply(&mut stats, &mut consecutive_timeouts, &mut window, stat),
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                seq += 1;
                emit(
                    seq, &stats, consecutive_timeouts, &mut window, &mut emitted_bytes,
                    &reporter, &statuses, &discovered, &scan_complete,
                );
            }
        }
    }

    while let Ok(stat) = stats_rx.try_recv() {
        apply(&mut stats, &mut consecutive_timeouts, &mut window, stat);
    }
    seq += 1;
    emit(
        seq, &stats, consecutive_timeouts, &mut window, &mut emitted_bytes,
        &reporter, &statuses, &discovered, &scan_complete,
    );

    stats
}

fn apply(
    stats: &mut RunStats,
    consecutive_timeouts: &mut u64,
    window: &mut VecDeque<(Instant, u64)>,
    stat: CopyStat,
) {
    match stat {
        CopyStat::Success { bytes } => {
            stats.completed += 1;
            stats.bytes += bytes;
            window.push_back((Instant::now(), bytes));
            *consecutive_timeouts = 0;
        }
        CopyStat::Failure => {
            stats.failed += 1;
            *consecutive_timeouts = 0;
        }
        CopyStat::Skipped => {
            stats.skipped += 1;
        }
        CopyStat::Timeout => {
            stats.timeouts += 1;
            *consecutive_timeouts += 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit(
    seq: u64,
    stats: &RunStats,
    consecutive_timeouts: u64,
    window: &mut VecDeque<(Instant, u64)>,
    emitted_bytes: &mut u64,
    reporter: &Arc<dyn ProgressReporter>,
    statuses: &StatusMap,
    discovered: &Arc<AtomicU64>,
    scan_complete: &Arc<AtomicBool>,
) {
    while let Some((at, _)) = window.front() {
        if at.elapsed() > RATE_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
    let windowed: u64 = window.iter().map(|(_, b)| *b).sum();
    let rate_bps = windowed as f64 / RATE_WINDOW.as_secs_f64();
    let delta_mb = (stats.bytes - *emitted_bytes) as f64 / (1024.0 * 1024.0);
    *emitted_bytes = stats.bytes;

    let update = ProgressUpdate {
        seq,
        total_files: discovered.load(Ordering::Relaxed),
        completed: stats.completed,
        failed: stats.failed,
        skipped: stats.skipped,
        timeout_skips: stats.timeouts,
        consecutive_skips: consecutive_timeouts,
        total_bytes: stats.bytes,
        rate_bps,
        delta_mb,
        worker_statuses: statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone(),
        scan_complete: scan_complete.load(Ordering::SeqCst),
    };
    reporter.progress(&update);
}
