/*!
 * ADB source adapter
 *
 * Everything goes through the adb binary: discovery is `adb shell find`,
 * transfer is `adb pull`, liveness is `adb devices`. Pull progress is
 * approximated by polling the destination file's size, which is also what
 * feeds the stall budget.
 */

use crate::cancel::CancelToken;
use crate::config::{BackupConfig, PRIORITY_DIRS};
use crate::engine::adapter::{CopyOutput, FileJob, JobSink, SourceCopier, SourceScanner};
use crate::error::{Result, SalvageError};
use crossbeam_channel::{select, Sender};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Cancellation poll cadence while a pull is in flight
const PULL_POLL: Duration = Duration::from_millis(500);

pub struct AdbAdapter {
    config: BackupConfig,
    root: PathBuf,
}

impl AdbAdapter {
    pub fn new(config: BackupConfig) -> Self {
        let root = config.source_root.clone();
        Self { config, root }
    }

    fn adb_output(args: &[&str]) -> Result<String> {
        let output = Command::new("adb")
            .args(args)
            .output()
            .map_err(|e| SalvageError::Adb(format!("failed to run adb: {}", e)))?;
        if !output.status.success() {
            return Err(SalvageError::Adb(format!(
                "adb {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn find_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let dir_str = dir.to_string_lossy();
        let out = Self::adb_output(&["shell", "find", dir_str.as_ref(), "-type", "f"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    fn push_file(&self, path: PathBuf, seen: &mut HashSet<PathBuf>, sink: &JobSink) -> bool {
        if !seen.insert(path.clone()) {
            return true;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
        sink.push(FileJob {
            source: path,
            relative,
            size: None,
        })
    }

    fn kill_and_unlink(child: &mut std::process::Child, dest: &Path) {
        let _ = child.kill();
        let _ = child.wait();
        let _ = fs::remove_file(dest);
    }
}

/// Count connected devices in `adb devices` output. The first line is the
/// banner; a live device reports as `<serial>\tdevice`.
pub fn count_devices(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.contains("\tdevice"))
        .count()
}

impl SourceScanner for AdbAdapter {
    fn scan(&self, token: &CancelToken, sink: &JobSink, errors: &Sender<SalvageError>) {
        let mut seen: HashSet<PathBuf> = HashSet::new();

        // Media first: one find per priority directory, in order. Most
        // devices only have a few of these, so a missing path is routine.
        for name in PRIORITY_DIRS {
            if token.is_cancelled() {
                return;
            }
            let dir = self.root.join(name);
            match self.find_files(&dir) {
                Ok(paths) => {
                    for path in paths {
                        if !self.push_file(path, &mut seen, sink) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("priority find skipped {}: {}", dir.display(), e);
                }
            }
        }

        if token.is_cancelled() {
            return;
        }

        // Then everything else.
        match self.find_files(&self.root) {
            Ok(paths) => {
                for path in paths {
                    if token.is_cancelled() {
                        return;
                    }
                    if !self.push_file(path, &mut seen, sink) {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = errors.send(e);
            }
        }
    }
}

impl SourceCopier for AdbAdapter {
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

        let mut child = Command::new("adb")
            .arg("pull")
            .arg(&job.source)
            .arg(dest)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SalvageError::Adb(format!("failed to spawn adb pull: {}", e)))?;

        let started = Instant::now();
        let mut last_size = 0u64;
        let mut last_change = Instant::now();
        let mut last_poll = Instant::now()
            .checked_sub(self.config.progress_interval)
            .unwrap_or_else(Instant::now);
        let mut last_probe = Instant::now();

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    Self::kill_and_unlink(&mut child, dest);
                    return Err(SalvageError::Io(e));
                }
            }

            if token.is_cancelled() {
                Self::kill_and_unlink(&mut child, dest);
                return Err(SalvageError::Cancelled);
            }

            if started.elapsed() >= self.config.adb_pull_ceiling {
                Self::kill_and_unlink(&mut child, dest);
                return Err(SalvageError::Stalled {
                    path: job.source.clone(),
                    idle: started.elapsed(),
                });
            }

            if last_poll.elapsed() >= self.config.progress_interval {
                last_poll = Instant::now();
                if let Ok(meta) = fs::metadata(dest) {
                    let size = meta.len();
                    if size != last_size {
                        last_size = size;
                        last_change = Instant::now();
                    }
                    let _ = progress.try_send(size);
                }
            }

            if last_change.elapsed() >= self.config.stall_timeout {
                Self::kill_and_unlink(&mut child, dest);
                return Err(SalvageError::Stalled {
                    path: job.source.clone(),
                    idle: last_change.elapsed(),
                });
            }

            if last_probe.elapsed() >= self.config.copy_liveness_interval {
                last_probe = Instant::now();
                if let Err(err) = self.probe() {
                    Self::kill_and_unlink(&mut child, dest);
                    return Err(err);
                }
            }

            select! {
                recv(token.watch()) -> _ => {}
                default(PULL_POLL) => {}
            }
        };

        if status.success() {
            let size = fs::metadata(dest)?.len();
            let _ = progress.try_send(size);
            // The pull wrote the file itself; the worker hashes it from disk.
            Ok(CopyOutput {
                bytes: size,
                digest: None,
            })
        } else {
            let mut detail = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut detail);
            }
            let _ = fs::remove_file(dest);
            Err(SalvageError::Adb(format!(
                "adb pull {} failed: {}",
                job.source.display(),
                detail.trim()
            )))
        }
    }

    fn probe(&self) -> Result<()> {
        let out = Self::adb_output(&["devices"])?;
        if count_devices(&out) == 0 {
            return Err(SalvageError::ConnectionLost {
                path: self.root.clone(),
                detail: "no device reported by adb devices".to_string(),
            });
        }
        Ok(())
    }
}
