/*!
 * Scan controller
 *
 * Thin wrapper over the adapter's scan: attaches the liveness probe,
 * guarantees the job channel closes exactly once, and emits the directory
 * summary when discovery finishes.
 */

use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::engine::adapter::{CloseOnce, JobSink, SourceCopier, SourceScanner};
use crate::error::SalvageError;
use crate::journal::Journal;
use crate::reporter::ProgressReporter;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::Level;

/// Closes the job channel even if the scan unwinds; workers must never be
/// left blocking on a channel nobody will close.
struct CloseOnExit(Arc<CloseOnce>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run_controller(
    token: CancelToken,
    config: BackupConfig,
    scanner: Arc<dyn SourceScanner>,
    copier: Arc<dyn SourceCopier>,
    guard: Arc<CloseOnce>,
    sink: JobSink,
    errors: Sender<SalvageError>,
    journal: Arc<Journal>,
    reporter: Arc<dyn ProgressReporter>,
    scan_complete: Arc<AtomicBool>,
) {
    let _closer = CloseOnExit(guard.clone());
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let probe_handle = {
        let token = token.clone();
        let copier = copier.clone();
        let errors = errors.clone();
        let interval = config.liveness_interval;
        thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(token.watch()) -> _ => return,
                    recv(ticker) -> _ => {
                        if let Err(err) = copier.probe() {
                            let critical = err.is_critical();
                            let _ = errors.send(err);
                            if critical {
                                return;
                            }
                        }
                    }
                }
            }
        })
    };

    scanner.scan(&token, &sink, &errors);

    // Exactly one close, whether the scan drained naturally or bailed on
    // cancellation.
    guard.close();
    scan_complete.store(true, Ordering::SeqCst);

    let summary = journal.dir_summary();
    reporter.log(
        Level::INFO,
        &format!(
            "scan finished: {} files discovered; directories {} completed, {} partial, {} timeout, {} error",
            sink.discovered(),
            summary.completed,
            summary.partial,
            summary.timeout,
            summary.error
        ),
    );

    drop(stop_tx);
    let _ = probe_handle.join();
}
