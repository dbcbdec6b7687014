/*!
 * The backup engine
 *
 * Wires the pipeline: scan controller feeding a bounded job channel, N
 * copy workers, a stats aggregator and an error pump, all sharing one
 * journal and one cancellation token. Cancellation gives workers a grace
 * window, then the journal is flushed and the run returns.
 */

pub mod adapter;
pub mod adb;
pub mod cleanup;
pub mod copier;
pub mod mount;
pub mod scanner;
pub mod verify;
pub mod worker;

use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::error::{Result, SalvageError};
use crate::journal::Journal;
use crate::logging::{ErrorLog, ErrorSummary};
use crate::reporter::ProgressReporter;
use adapter::{adapter_for, CloseOnce, JobSink};
use cleanup::{run_cleanup, CleanupReport};
use crossbeam_channel::{bounded, select, Receiver};
use scanner::run_controller;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::Level;
use verify::{run_verify, VerifyReport};
use worker::{run_stats, RunStats, StatusMap, Worker};

/// Bounded buffer sizes for the pipeline channels
const JOB_BUFFER: usize = 1000;
const ERROR_BUFFER: usize = 100;
const STATS_BUFFER: usize = 100;

/// How a run ended
#[derive(Debug, Clone, Copy)]
pub enum RunOutcome {
    Completed(RunStats),
    Cancelled(RunStats),
    ConnectionLost(RunStats),
}

impl RunOutcome {
    pub fn stats(&self) -> RunStats {
        match self {
            RunOutcome::Completed(s) | RunOutcome::Cancelled(s) | RunOutcome::ConnectionLost(s) => {
                *s
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

pub struct Engine {
    config: BackupConfig,
    journal: Arc<Journal>,
    errlog: Arc<ErrorLog>,
    reporter: Arc<dyn ProgressReporter>,
    token: CancelToken,
}

impl Engine {
    pub fn new(config: BackupConfig, reporter: Arc<dyn ProgressReporter>) -> Result<Self> {
        config.validate()?;
        let storage = config.storage_root();
        let journal = Arc::new(Journal::open(&storage)?);
        let errlog = Arc::new(ErrorLog::open(&storage)?);
        Ok(Self {
            config,
            journal,
            errlog,
            reporter,
            token: CancelToken::new(),
        })
    }

    /// Handle for cancelling the run from a signal handler or UI.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn error_summary(&self) -> ErrorSummary {
        self.errlog.summary()
    }

    /// Run the backup pipeline to completion, cancellation or connection
    /// loss. The journal is flushed before this returns, whatever happened.
    pub fn run(&self) -> Result<RunOutcome> {
        let (jobs_tx, jobs_rx) = bounded(JOB_BUFFER);
        let (errors_tx, errors_rx) = bounded::<SalvageError>(ERROR_BUFFER);
        let (stats_tx, stats_rx) = bounded(STATS_BUFFER);
        let (done_tx, done_rx) = bounded::<usize>(self.config.workers);
        let (stats_stop_tx, stats_stop_rx) = bounded::<()>(0);

        let guard = Arc::new(CloseOnce::new(jobs_tx));
        let discovered = Arc::new(AtomicU64::new(0));
        let scan_complete = Arc::new(AtomicBool::new(false));
        let connection_lost = Arc::new(AtomicBool::new(false));
        let statuses: StatusMap = Arc::new(Mutex::new(BTreeMap::new()));

        let (scanner, copier) = adapter_for(&self.config, self.journal.clone());

        let pump_handle = {
            let errlog = self.errlog.clone();
            let reporter = self.reporter.clone();
            let token = self.token.clone();
            let connection_lost = connection_lost.clone();
            thread::spawn(move || {
                run_error_pump(errors_rx, errlog, reporter, token, connection_lost)
            })
        };

        let stats_handle = {
            let reporter = self.reporter.clone();
            let statuses = statuses.clone();
            let discovered = discovered.clone();
            let scan_complete = scan_complete.clone();
            let interval = self.config.progress_interval;
            thread::spawn(move || {
                run_stats(
                    stats_rx,
                    stats_stop_rx,
                    reporter,
                    statuses,
                    discovered,
                    scan_complete,
                    interval,
                )
            })
        };

        let controller_handle = {
            let token = self.token.clone();
            let config = self.config.clone();
            let scanner = scanner.clone();
            let copier = copier.clone();
            let guard = guard.clone();
            let sink = JobSink::new(guard.clone(), discovered.clone(), self.token.clone());
            let errors = errors_tx.clone();
            let journal = self.journal.clone();
            let reporter = self.reporter.clone();
            let scan_complete = scan_complete.clone();
            thread::spawn(move || {
                run_controller(
                    token,
                    config,
                    scanner,
                    copier,
                    guard,
                    sink,
                    errors,
                    journal,
                    reporter,
                    scan_complete,
                )
            })
        };

        let mut worker_handles = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                token: self.token.clone(),
                config: self.config.clone(),
                journal: self.journal.clone(),
                errlog: self.errlog.clone(),
                copier: copier.clone(),
                stats: stats_tx.clone(),
                errors: errors_tx.clone(),
                statuses: statuses.clone(),
                storage_root: self.config.storage_root(),
                done: done_tx.clone(),
            };
            let jobs = jobs_rx.clone();
            worker_handles.push(thread::spawn(move || worker.run(jobs)));
        }

        // The spawned stages own the only live senders from here on.
        drop(jobs_rx);
        drop(done_tx);
        drop(stats_tx);
        drop(errors_tx);

        let forced = self.wait_for_workers(&done_rx, &guard);

        if !forced {
            for handle in worker_handles {
                let _ = handle.join();
            }
            let _ = controller_handle.join();
        }

        drop(stats_stop_tx);
        let stats = stats_handle.join().unwrap_or_default();

        if !forced {
            let _ = pump_handle.join();
        }

        self.journal.flush()?;
        self.errlog.flush();

        if connection_lost.load(Ordering::SeqCst) {
            Ok(RunOutcome::ConnectionLost(stats))
        } else if self.token.is_cancelled() {
            Ok(RunOutcome::Cancelled(stats))
        } else {
            Ok(RunOutcome::Completed(stats))
        }
    }

    /// Wait for every worker to finish. After cancellation the wait turns
    /// into the shutdown grace window; true means the window expired with
    /// workers still out there.
    fn wait_for_workers(&self, done_rx: &Receiver<usize>, guard: &CloseOnce) -> bool {
        let mut remaining = self.config.workers;
        while remaining > 0 {
            if self.token.is_cancelled() {
                guard.close();
                let deadline = Instant::now() + self.config.shutdown_grace;
                while remaining > 0 {
                    match done_rx.recv_deadline(deadline) {
                        Ok(_) => remaining -= 1,
                        Err(_) => {
                            self.reporter.log(
                                Level::WARN,
                                &format!(
                                    "{} worker(s) still busy after the {}s grace window",
                                    remaining,
                                    self.config.shutdown_grace.as_secs()
                                ),
                            );
                            return true;
                        }
                    }
                }
                return false;
            }
            select! {
                recv(done_rx) -> msg => match msg {
                    Ok(_) => remaining -= 1,
                    Err(_) => remaining = 0,
                },
                recv(self.token.watch()) -> _ => {}
            }
        }
        false
    }

    /// Post-copy verification over every completed record under the
    /// current root.
    pub fn verify(&self) -> Result<VerifyReport> {
        let (_, copier) = adapter_for(&self.config, self.journal.clone());
        run_verify(
            &self.config,
            &self.journal,
            copier,
            &self.token,
            self.reporter.clone(),
        )
    }

    /// Destructive source-deletion pass, gated by triple hash equality.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let (_, copier) = adapter_for(&self.config, self.journal.clone());
        run_cleanup(
            &self.config,
            &self.journal,
            copier,
            &self.token,
            self.reporter.clone(),
        )
    }
}

fn run_error_pump(
    errors_rx: Receiver<SalvageError>,
    errlog: Arc<ErrorLog>,
    reporter: Arc<dyn ProgressReporter>,
    token: CancelToken,
    connection_lost: Arc<AtomicBool>,
) {
    while let Ok(err) = errors_rx.recv() {
        errlog.record(&err);
        if err.is_critical() {
            connection_lost.store(true, Ordering::SeqCst);
            reporter.error(&err);
            reporter.log(
                Level::ERROR,
                &format!(
                    "CRITICAL: {}. Reconnect the device and re-run; the backup resumes where it stopped.",
                    err
                ),
            );
            token.cancel();
        } else {
            tracing::debug!("recorded error: {}", err);
        }
    }
}
