/*!
 * Source adapter capability pair
 *
 * The mount and ADB transports each implement a scanner half and a copier
 * half. The engine selects a pair at construction by mode; nothing else in
 * the pipeline knows which transport it is driving.
 */

use crate::cancel::CancelToken;
use crate::config::{BackupConfig, Mode};
use crate::engine::adb::AdbAdapter;
use crate::engine::mount::MountAdapter;
use crate::error::{Result, SalvageError};
use crate::journal::Journal;
use crossbeam_channel::{select, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One unit of work: a file discovered on the device.
#[derive(Debug, Clone)]
pub struct FileJob {
    /// Absolute path on the source
    pub source: PathBuf,
    /// Path relative to the source root
    pub relative: PathBuf,
    /// Size observed at discovery time (mount mode only)
    pub size: Option<u64>,
}

/// Close-once guard around the job channel's producer side. The scan
/// controller closes it when the scan finishes and the cancellation path
/// may close it early; whichever comes first wins and the second is a no-op.
pub struct CloseOnce {
    slot: Mutex<Option<Sender<FileJob>>>,
}

impl CloseOnce {
    pub fn new(tx: Sender<FileJob>) -> Self {
        Self {
            slot: Mutex::new(Some(tx)),
        }
    }

    pub fn close(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }

    fn sender(&self) -> Option<Sender<FileJob>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Where scanners push discovered files. Counts discoveries and respects
/// cancellation; a false return means stop scanning.
#[derive(Clone)]
pub struct JobSink {
    guard: Arc<CloseOnce>,
    discovered: Arc<AtomicU64>,
    token: CancelToken,
}

impl JobSink {
    pub fn new(guard: Arc<CloseOnce>, discovered: Arc<AtomicU64>, token: CancelToken) -> Self {
        Self {
            guard,
            discovered,
            token,
        }
    }

    /// Push a job, blocking if the channel is full. Returns false when the
    /// run is cancelled or the channel is gone.
    pub fn push(&self, job: FileJob) -> bool {
        let Some(tx) = self.guard.sender() else {
            return false;
        };
        select! {
            send(tx, job) -> res => {
                if res.is_ok() {
                    self.discovered.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            recv(self.token.watch()) -> _ => false,
        }
    }

    pub fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }
}

/// Scanner half: enumerate files under the source root, pushing jobs into
/// the sink and non-fatal errors into the error channel. Must honor the
/// token; must not close the sink (the controller owns that).
pub trait SourceScanner: Send + Sync {
    fn scan(&self, token: &CancelToken, sink: &JobSink, errors: &Sender<SalvageError>);
}

/// What a completed transfer hands back to the worker.
#[derive(Debug, Clone)]
pub struct CopyOutput {
    pub bytes: u64,
    /// Digest of the bytes written, when the transport streamed them
    /// through the engine (mount). ADB pulls land opaquely and get hashed
    /// from disk afterwards.
    pub digest: Option<String>,
}

/// Copier half: transfer one file to `dest`, publishing byte counts into
/// the progress channel on the configured cadence. `probe` answers whether
/// the transport is still alive.
pub trait SourceCopier: Send + Sync {
    fn copy(
        &self,
        token: &CancelToken,
        job: &FileJob,
        dest: &Path,
        progress: &Sender<u64>,
    ) -> Result<CopyOutput>;

    fn probe(&self) -> Result<()>;
}

/// Build the adapter pair for the configured mode. Verify and cleanup
/// post-process a mount backup, so they get the mount adapter.
pub fn adapter_for(
    config: &BackupConfig,
    journal: Arc<Journal>,
) -> (Arc<dyn SourceScanner>, Arc<dyn SourceCopier>) {
    match config.mode {
        Mode::Adb => {
            let adapter = Arc::new(AdbAdapter::new(config.clone()));
            (adapter.clone(), adapter)
        }
        Mode::Mount | Mode::Verify | Mode::Cleanup => {
            let adapter = Arc::new(MountAdapter::new(config.clone(), journal));
            (adapter.clone(), adapter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_close_once_is_idempotent() {
        let (tx, rx) = bounded::<FileJob>(4);
        let guard = CloseOnce::new(tx);
        assert!(guard.sender().is_some());
        guard.close();
        guard.close();
        assert!(guard.sender().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_counts_and_stops_after_close() {
        let (tx, rx) = bounded::<FileJob>(4);
        let guard = Arc::new(CloseOnce::new(tx));
        let sink = JobSink::new(
            guard.clone(),
            Arc::new(AtomicU64::new(0)),
            CancelToken::new(),
        );

        let job = FileJob {
            source: PathBuf::from("/phone/DCIM/a.jpg"),
            relative: PathBuf::from("DCIM/a.jpg"),
            size: Some(10),
        };
        assert!(sink.push(job.clone()));
        assert_eq!(sink.discovered(), 1);
        assert_eq!(rx.recv().unwrap().relative, PathBuf::from("DCIM/a.jpg"));

        guard.close();
        assert!(!sink.push(job));
        assert_eq!(sink.discovered(), 1);
    }

    #[test]
    fn test_sink_unblocks_on_cancel() {
        let (tx, _rx) = bounded::<FileJob>(0);
        let guard = Arc::new(CloseOnce::new(tx));
        let token = CancelToken::new();
        let sink = JobSink::new(guard, Arc::new(AtomicU64::new(0)), token.clone());

        let handle = std::thread::spawn(move || {
            sink.push(FileJob {
                source: PathBuf::from("/a"),
                relative: PathBuf::from("a"),
                size: None,
            })
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        token.cancel();
        assert!(!handle.join().unwrap());
    }
}
