/*!
 * Cooperative cancellation token shared by every blocking stage
 */

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A cancellation token that is both cheap to poll and selectable.
///
/// The atomic flag answers `is_cancelled()` without contention; the
/// crossbeam receiver disconnects the moment `cancel()` drops its sender,
/// so a blocked `select!` wakes immediately. Clones observe the same token.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    guard: Arc<Mutex<Option<Sender<()>>>>,
    watch: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            guard: Arc::new(Mutex::new(Some(tx))),
            watch: rx,
        }
    }

    /// Cancel the token. Idempotent; every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.guard.lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that becomes disconnected on cancellation; never yields a
    /// message. Use in `select!` alongside data channels.
    pub fn watch(&self) -> &Receiver<()> {
        &self.watch
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
