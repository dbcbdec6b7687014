/*!
 * Job control surface
 *
 * The desktop shell and the remote HTTP surface drive the engine through
 * this: start a run, cancel it, read the latest progress snapshot. One
 * process can run several jobs over its lifetime; ids are never reused.
 */

use crate::cancel::CancelToken;
use crate::config::BackupConfig;
use crate::engine::{Engine, RunOutcome};
use crate::error::{Result, SalvageError};
use crate::reporter::{ProgressReporter, ProgressUpdate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::Level;

pub type JobId = u64;

struct JobEntry {
    token: CancelToken,
    snapshot: Arc<Mutex<Option<ProgressUpdate>>>,
    handle: Option<JoinHandle<Result<RunOutcome>>>,
}

/// Tees progress updates into a snapshot cell on the way to the real
/// reporter, so `snapshot()` always has the latest state.
struct SnapshotReporter {
    inner: Arc<dyn ProgressReporter>,
    snapshot: Arc<Mutex<Option<ProgressUpdate>>>,
}

impl ProgressReporter for SnapshotReporter {
    fn progress(&self, update: &ProgressUpdate) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            // Discard stale updates that raced a newer one.
            let newer = snapshot.as_ref().map(|s| s.seq < update.seq).unwrap_or(true);
            if newer {
                *snapshot = Some(update.clone());
            }
        }
        self.inner.progress(update);
    }

    fn error(&self, err: &SalvageError) {
        self.inner.error(err);
    }

    fn log(&self, level: Level, message: &str) {
        self.inner.log(level, message);
    }
}

#[derive(Default)]
pub struct JobControl {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a backup run on its own thread. Returns the job id.
    pub fn start(
        &self,
        config: BackupConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<JobId> {
        let snapshot = Arc::new(Mutex::new(None));
        let tee = Arc::new(SnapshotReporter {
            inner: reporter,
            snapshot: snapshot.clone(),
        });
        let engine = Engine::new(config, tee)?;
        let token = engine.token();
        let handle = std::thread::spawn(move || engine.run());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            id,
            JobEntry {
                token,
                snapshot,
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    /// Cancel a running job. True when the id was known.
    pub fn cancel(&self, id: JobId) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Latest progress snapshot for a job, if any update has arrived.
    pub fn snapshot(&self, id: JobId) -> Option<ProgressUpdate> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&id)
            .and_then(|entry| entry.snapshot.lock().ok().and_then(|s| s.clone()))
    }

    /// Block until the job's engine thread finishes and return its outcome.
    pub fn wait(&self, id: JobId) -> Option<Result<RunOutcome>> {
        let handle = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get_mut(&id).and_then(|entry| entry.handle.take())
        };
        handle.map(|h| {
            h.join()
                .unwrap_or_else(|_| Err(SalvageError::Journal("engine thread panicked".into())))
        })
    }
}
