/*!
 * Post-copy verification pass
 *
 * Walks every completed record under the current source root and proves
 * the backup: in mount mode both sides are re-hashed and a mismatched
 * destination gets one rebuild attempt; in ADB mode only the destination
 * can be hashed, so it is checked against the stored hash.
 */

use crate::cancel::CancelToken;
use crate::checksum::hash_file;
use crate::config::{BackupConfig, Mode};
use crate::engine::adapter::{FileJob, SourceCopier};
use crate::error::{Result, SalvageError};
use crate::journal::{CompletedFile, Journal};
use crate::reporter::ProgressReporter;
use crossbeam_channel::{bounded, select, tick};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::Level;

/// Progress tick cadence for the pass
const VERIFY_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyReport {
    pub total: usize,
    pub verified: usize,
    pub missing_source: usize,
    pub missing_dest: usize,
    pub mismatched: usize,
    pub rebuilt: usize,
}

impl VerifyReport {
    /// Clean means the backup holds: nothing mismatched, nothing missing
    /// from the destination. Missing sources are expected after cleanup.
    pub fn is_clean(&self) -> bool {
        self.mismatched == 0 && self.missing_dest == 0
    }

    pub fn render(&self) -> String {
        format!(
            "verify: {} records, {} verified, {} rebuilt, {} mismatched, {} missing destination, {} missing source",
            self.total, self.verified, self.rebuilt, self.mismatched, self.missing_dest, self.missing_source
        )
    }
}

#[derive(Default)]
struct Counters {
    checked: AtomicUsize,
    verified: AtomicUsize,
    missing_source: AtomicUsize,
    missing_dest: AtomicUsize,
    mismatched: AtomicUsize,
    rebuilt: AtomicUsize,
}

pub fn run_verify(
    config: &BackupConfig,
    journal: &Journal,
    copier: Arc<dyn SourceCopier>,
    token: &CancelToken,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<VerifyReport> {
    let storage = config.storage_root();
    let records = journal.completed_under(&config.source_root);
    let total = records.len();
    let counters = Counters::default();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.max(1))
        .build()
        .map_err(|e| SalvageError::Config(format!("failed to build verify pool: {}", e)))?;

    let (stop_tx, stop_rx) = bounded::<()>(0);
    thread::scope(|scope| {
        scope.spawn(|| {
            let ticker = tick(VERIFY_TICK);
            loop {
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {
                        reporter.log(
                            Level::INFO,
                            &format!(
                                "[verify] {}/{} checked, {} verified, {} mismatched",
                                counters.checked.load(Ordering::Relaxed),
                                total,
                                counters.verified.load(Ordering::Relaxed),
                                counters.mismatched.load(Ordering::Relaxed)
                            ),
                        );
                    }
                }
            }
        });

        pool.install(|| {
            records.par_iter().for_each(|record| {
                if token.is_cancelled() {
                    return;
                }
                verify_one(config, record, &storage, &copier, token, &counters);
                counters.checked.fetch_add(1, Ordering::Relaxed);
            });
        });

        drop(stop_tx);
    });

    Ok(VerifyReport {
        total,
        verified: counters.verified.load(Ordering::Relaxed),
        missing_source: counters.missing_source.load(Ordering::Relaxed),
        missing_dest: counters.missing_dest.load(Ordering::Relaxed),
        mismatched: counters.mismatched.load(Ordering::Relaxed),
        rebuilt: counters.rebuilt.load(Ordering::Relaxed),
    })
}

fn verify_one(
    config: &BackupConfig,
    record: &CompletedFile,
    storage: &Path,
    copier: &Arc<dyn SourceCopier>,
    token: &CancelToken,
    counters: &Counters,
) {
    let dest = storage.join(&record.normalized);
    let adb = config.mode == Mode::Adb;

    if !adb && fs::metadata(&record.source).is_err() {
        counters.missing_source.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if !dest.exists() {
        counters.missing_dest.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let dest_hash = match hash_file(&dest) {
        Ok(hash) => hash,
        Err(_) => {
            counters.mismatched.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if adb {
        // No cheap way to hash on-device; the stored hash is the reference.
        if dest_hash == record.hash {
            counters.verified.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.mismatched.fetch_add(1, Ordering::Relaxed);
        }
        return;
    }

    let src_hash = match hash_file(&record.source) {
        Ok(hash) => hash,
        Err(_) => {
            counters.missing_source.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if src_hash == dest_hash {
        counters.verified.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // One rebuild attempt before declaring the record bad.
    let job = FileJob {
        source: record.source.clone(),
        relative: record.normalized.clone(),
        size: None,
    };
    let (ptx, _prx) = bounded::<u64>(10);
    if let Ok(output) = copier.copy(token, &job, &dest, &ptx) {
        let rehash = output.digest.map(Ok).unwrap_or_else(|| hash_file(&dest));
        if let Ok(rehash) = rehash {
            if rehash == src_hash {
                counters.rebuilt.fetch_add(1, Ordering::Relaxed);
                counters.verified.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
    counters.mismatched.fetch_add(1, Ordering::Relaxed);
}
