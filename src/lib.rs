/*!
 * Salvage - resumable backup engine for Android phones
 *
 * Copies file trees off phones mounted over fragile transports (MTP/GVFS
 * or ADB) with:
 * - Streaming discovery and copying (no full enumeration up front)
 * - A durable, human-readable markdown journal for crash-safe resume
 * - Per-file stall detection and per-directory read deadlines
 * - Connection liveness probing with clean terminal shutdown
 * - Post-copy hash verification and a triple-hash-gated deletion pass
 */

pub mod cancel;
pub mod checksum;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod journal;
pub mod logging;
pub mod reporter;

// Re-export commonly used types for convenience
pub use cancel::CancelToken;
pub use config::{BackupConfig, Mode, MAX_FAILURES, PRIORITY_DIRS};
pub use control::{JobControl, JobId};
pub use engine::cleanup::CleanupReport;
pub use engine::verify::VerifyReport;
pub use engine::worker::RunStats;
pub use engine::{Engine, RunOutcome};
pub use error::{ErrorKind, Result, SalvageError};
pub use journal::{normalize_path, DirStatus, Journal};
pub use reporter::{ConsoleReporter, NullReporter, ProgressReporter, ProgressUpdate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
