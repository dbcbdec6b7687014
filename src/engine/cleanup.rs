/*!
 * Source deletion pass
 *
 * Destructive and gated hard: a source file is only unlinked when the
 * source bytes, the destination bytes and the journalled hash all agree.
 * Candidates are visited in shuffled order so a localized disconnection
 * does not burn the cleanup budget of one directory.
 */

use crate::cancel::CancelToken;
use crate::checksum::hash_file;
use crate::config::{BackupConfig, MAX_FAILURES};
use crate::engine::adapter::{FileJob, SourceCopier};
use crate::error::{is_transport_error, Result, SalvageError};
use crate::journal::{CompletedFile, Journal};
use crate::reporter::ProgressReporter;
use crossbeam_channel::{bounded, select, tick};
use rand::seq::SliceRandom;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::Level;

/// Progress tick cadence for the pass
const CLEANUP_TICK: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub total: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub rebuilt: usize,
    pub failures: usize,
    /// Stat/hash reads that died on the transport; distinguishes a flaky
    /// connection from genuine mismatches.
    pub stat_io_errors: usize,
}

impl CleanupReport {
    pub fn render(&self) -> String {
        format!(
            "cleanup: {} candidates, {} deleted, {} skipped, {} rebuilt, {} failures, {} stat I/O errors",
            self.total, self.deleted, self.skipped, self.rebuilt, self.failures, self.stat_io_errors
        )
    }
}

#[derive(Default)]
struct Counters {
    examined: AtomicUsize,
    deleted: AtomicUsize,
    skipped: AtomicUsize,
    rebuilt: AtomicUsize,
    failures: AtomicUsize,
    stat_io_errors: AtomicUsize,
}

enum HashOutcome {
    Hash(String),
    TransportGlitch,
    Unreadable,
}

fn try_hash(path: &Path) -> HashOutcome {
    match hash_file(path) {
        Ok(hash) => HashOutcome::Hash(hash),
        Err(SalvageError::Io(e)) if is_transport_error(&e) => HashOutcome::TransportGlitch,
        Err(_) => HashOutcome::Unreadable,
    }
}

pub fn run_cleanup(
    config: &BackupConfig,
    journal: &Journal,
    copier: Arc<dyn SourceCopier>,
    token: &CancelToken,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<CleanupReport> {
    let storage = config.storage_root();
    let mut candidates: Vec<CompletedFile> = journal
        .completed_under(&config.source_root)
        .into_iter()
        .filter(|r| {
            !journal.is_deleted(&r.source)
                && journal.cleanup_failure_count(&r.source) < MAX_FAILURES
        })
        .collect();
    candidates.shuffle(&mut rand::rng());

    let total = candidates.len();
    let counters = Counters::default();
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let result = thread::scope(|scope| {
        scope.spawn(|| {
            let ticker = tick(CLEANUP_TICK);
            loop {
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {
                        reporter.log(
                            Level::INFO,
                            &format!(
                                "[cleanup] {}/{} examined, {} deleted, {} failures",
                                counters.examined.load(Ordering::Relaxed),
                                total,
                                counters.deleted.load(Ordering::Relaxed),
                                counters.failures.load(Ordering::Relaxed)
                            ),
                        );
                    }
                }
            }
        });

        let result = (|| -> Result<()> {
            for record in &candidates {
                if token.is_cancelled() {
                    break;
                }
                cleanup_one(config, journal, &copier, token, record, &storage, &counters)?;
                counters.examined.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })();

        drop(stop_tx);
        result
    });

    journal.flush()?;
    result?;

    Ok(CleanupReport {
        total,
        deleted: counters.deleted.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        rebuilt: counters.rebuilt.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
        stat_io_errors: counters.stat_io_errors.load(Ordering::Relaxed),
    })
}

fn cleanup_one(
    config: &BackupConfig,
    journal: &Journal,
    copier: &Arc<dyn SourceCopier>,
    token: &CancelToken,
    record: &CompletedFile,
    storage: &Path,
    counters: &Counters,
) -> Result<()> {
    // The source must still be a plain file.
    let meta = match fs::symlink_metadata(&record.source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(_) => {
            counters.stat_io_errors.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    if meta.is_dir() {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    // Connection loss aborts the whole pass; deleting against a half-dead
    // transport is how backups get eaten.
    if let Err(err) = copier.probe() {
        if err.is_critical() {
            return Err(err);
        }
        counters.stat_io_errors.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let dest = storage.join(&record.normalized);
    if !dest.exists() {
        let job = FileJob {
            source: record.source.clone(),
            relative: record.normalized.clone(),
            size: None,
        };
        let (ptx, _prx) = bounded::<u64>(10);
        match copier.copy(token, &job, &dest, &ptx) {
            Ok(output) => {
                let rebuilt_hash = output.digest.map(Ok).unwrap_or_else(|| hash_file(&dest));
                match rebuilt_hash {
                    Ok(hash) if hash == record.hash => {
                        counters.rebuilt.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        journal.record_cleanup_failure(&record.source)?;
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
            }
            Err(err) if err.is_critical() => return Err(err),
            Err(_) => {
                journal.record_cleanup_failure(&record.source)?;
                counters.failures.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    let src_hash = match try_hash(&record.source) {
        HashOutcome::Hash(hash) => hash,
        HashOutcome::TransportGlitch => {
            counters.stat_io_errors.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        HashOutcome::Unreadable => {
            journal.record_cleanup_failure(&record.source)?;
            counters.failures.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    let dest_hash = match try_hash(&dest) {
        HashOutcome::Hash(hash) => hash,
        _ => {
            journal.record_cleanup_failure(&record.source)?;
            counters.failures.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };

    if src_hash == record.hash && dest_hash == record.hash {
        match fs::remove_file(&record.source) {
            Ok(()) => {
                journal.mark_deleted(&record.source, &record.hash)?;
                counters.deleted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if is_transport_error(&e) => {
                counters.stat_io_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                journal.record_cleanup_failure(&record.source)?;
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    } else {
        journal.record_cleanup_failure(&record.source)?;
        counters.failures.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
