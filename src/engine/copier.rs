/*!
 * Stall and liveness supervision shared by both copier variants
 *
 * A supervisor tick compares the running byte counter against the last
 * observed value once a second; a copy that moves no bytes for the stall
 * budget is aborted with a distinguished stalled outcome. The same tick
 * drives the periodic connection probe and observes cancellation, so the
 * copy loop only ever needs to check one abort cell between reads.
 */

use crate::cancel::CancelToken;
use crate::error::{Result, SalvageError};
use crossbeam_channel::{tick, Receiver};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One-shot abort cell. The first trigger wins; the copy loop takes the
/// reason and returns it as the copy's outcome.
pub struct Abort {
    reason: Mutex<Option<SalvageError>>,
}

impl Abort {
    pub fn new() -> Self {
        Self {
            reason: Mutex::new(None),
        }
    }

    pub fn trigger(&self, err: SalvageError) {
        let mut reason = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if reason.is_none() {
            *reason = Some(err);
        }
    }

    /// Take the abort reason, if one was triggered.
    pub fn take(&self) -> Option<SalvageError> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Default for Abort {
    fn default() -> Self {
        Self::new()
    }
}

/// Budgets the supervisor enforces.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorBudget {
    pub stall_timeout: Duration,
    pub liveness_interval: Duration,
}

/// Supervise one transfer until `done` disconnects. Runs on the caller's
/// scoped thread; triggers the abort cell on stall, connection loss or
/// cancellation and then keeps running until the copy loop notices.
pub fn supervise(
    token: &CancelToken,
    source: &Path,
    bytes: &AtomicU64,
    abort: &Abort,
    probe: &dyn Fn() -> Result<()>,
    budget: SupervisorBudget,
    done: Receiver<()>,
) {
    let ticker = tick(Duration::from_secs(1));
    let mut last_seen = bytes.load(Ordering::Relaxed);
    let mut last_change = Instant::now();
    let mut last_probe = Instant::now();

    loop {
        crossbeam_channel::select! {
            recv(done) -> _ => return,
            recv(ticker) -> _ => {}
        }

        if token.is_cancelled() {
            abort.trigger(SalvageError::Cancelled);
            continue;
        }

        let seen = bytes.load(Ordering::Relaxed);
        if seen != last_seen {
            last_seen = seen;
            last_change = Instant::now();
        } else if last_change.elapsed() >= budget.stall_timeout {
            abort.trigger(SalvageError::Stalled {
                path: source.to_path_buf(),
                idle: last_change.elapsed(),
            });
            continue;
        }

        if last_probe.elapsed() >= budget.liveness_interval {
            last_probe = Instant::now();
            if let Err(err) = probe() {
                if err.is_critical() {
                    abort.trigger(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn budget(stall_ms: u64) -> SupervisorBudget {
        SupervisorBudget {
            stall_timeout: Duration::from_millis(stall_ms),
            liveness_interval: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_abort_first_trigger_wins() {
        let abort = Abort::new();
        abort.trigger(SalvageError::Cancelled);
        abort.trigger(SalvageError::Stalled {
            path: PathBuf::from("/a"),
            idle: Duration::from_secs(1),
        });
        assert!(matches!(abort.take(), Some(SalvageError::Cancelled)));
        assert!(abort.take().is_none());
    }

    #[test]
    fn test_supervisor_exits_when_done() {
        let token = CancelToken::new();
        let bytes = Arc::new(AtomicU64::new(0));
        let abort = Arc::new(Abort::new());
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = {
            let token = token.clone();
            let bytes = bytes.clone();
            let abort = abort.clone();
            thread::spawn(move || {
                supervise(
                    &token,
                    Path::new("/a"),
                    &bytes,
                    &abort,
                    &|| Ok(()),
                    budget(60_000),
                    done_rx,
                )
            })
        };

        drop(done_tx);
        handle.join().unwrap();
        assert!(abort.take().is_none());
    }

    #[test]
    fn test_supervisor_flags_stall() {
        let token = CancelToken::new();
        let bytes = Arc::new(AtomicU64::new(0));
        let abort = Arc::new(Abort::new());
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = {
            let token = token.clone();
            let bytes = bytes.clone();
            let abort = abort.clone();
            thread::spawn(move || {
                supervise(
                    &token,
                    Path::new("/phone/big.bin"),
                    &bytes,
                    &abort,
                    &|| Ok(()),
                    budget(500),
                    done_rx,
                )
            })
        };

        // No byte movement; the second tick should trip the stall budget.
        thread::sleep(Duration::from_millis(2500));
        let reason = abort.take();
        assert!(matches!(reason, Some(SalvageError::Stalled { .. })));

        drop(done_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_supervisor_observes_cancellation() {
        let token = CancelToken::new();
        let bytes = Arc::new(AtomicU64::new(0));
        let abort = Arc::new(Abort::new());
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = {
            let token = token.clone();
            let bytes = bytes.clone();
            let abort = abort.clone();
            thread::spawn(move || {
                supervise(
                    &token,
                    Path::new("/a"),
                    &bytes,
                    &abort,
                    &|| Ok(()),
                    budget(60_000),
                    done_rx,
                )
            })
        };

        token.cancel();
        thread::sleep(Duration::from_millis(1500));
        assert!(matches!(abort.take(), Some(SalvageError::Cancelled)));

        drop(done_tx);
        handle.join().unwrap();
    }
}
