/*!
 * Configuration structures and defaults for Salvage
 */

use crate::error::{Result, SalvageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Operating mode selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Back up from a filesystem mount (MTP/GVFS)
    Mount,
    /// Back up through the Android Debug Bridge
    Adb,
    /// Verify an existing backup against the journal
    Verify,
    /// Delete source files whose backup is proven by triple hash match
    Cleanup,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mount" => Ok(Self::Mount),
            "adb" => Ok(Self::Adb),
            "verify" => Ok(Self::Verify),
            "cleanup" => Ok(Self::Cleanup),
            _ => Err(SalvageError::Config(format!("unknown mode: {}", s))),
        }
    }

    /// Journal/backup layout directory under the destination root. The
    /// verify and cleanup passes post-process a mount backup.
    pub fn storage_dir(&self) -> &'static str {
        match self {
            Mode::Adb => "adb",
            Mode::Mount | Mode::Verify | Mode::Cleanup => "mount",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Mount => "mount",
            Mode::Adb => "adb",
            Mode::Verify => "verify",
            Mode::Cleanup => "cleanup",
        }
    }
}

/// Directory names that typically hold user media, scheduled ahead of
/// everything else so photos come off the device first. Order matters.
pub const PRIORITY_DIRS: &[&str] = &[
    "DCIM",
    "Camera",
    "Pictures",
    "Documents",
    "Download",
    "Movies",
    "Music",
    "Videos",
    "ScreenRecordings",
    "Screenshots",
    "WhatsApp/Media",
    "Android/media",
    "Android/data",
];

/// A file is permanently retired once it has failed this many times.
pub const MAX_FAILURES: u32 = 10;

/// Main configuration for a backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root of the source tree on the device
    pub source_root: PathBuf,

    /// Destination root; the backup lands under `<dest_root>/<mode>/`
    pub dest_root: PathBuf,

    /// Operating mode
    pub mode: Mode,

    /// Number of copy workers (keep at 4 or below for MTP)
    pub workers: usize,

    /// Per-file stall budget: copy aborts after this long with no bytes
    pub stall_timeout: Duration,

    /// Budget for reading a single directory's entries
    pub dir_read_timeout: Duration,

    /// Interval between scanner liveness probes of the source root
    pub liveness_interval: Duration,

    /// Interval between per-copy connection checks
    pub copy_liveness_interval: Duration,

    /// Cadence of progress publication and the console status line
    pub progress_interval: Duration,

    /// Grace window for workers to finish after cancellation
    pub shutdown_grace: Duration,

    /// Hard ceiling on a single `adb pull`
    pub adb_pull_ceiling: Duration,

    /// Verbose (debug) logging
    pub verbose: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::new(),
            dest_root: PathBuf::new(),
            mode: Mode::Mount,
            workers: 1,
            stall_timeout: Duration::from_secs(30),
            dir_read_timeout: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(30),
            copy_liveness_interval: Duration::from_secs(10),
            progress_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(10),
            adb_pull_ceiling: Duration::from_secs(30 * 60),
            verbose: false,
        }
    }
}

impl BackupConfig {
    /// Directory holding the journal, the error log and the mirrored tree.
    pub fn storage_root(&self) -> PathBuf {
        self.dest_root.join(self.mode.storage_dir())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_root.as_os_str().is_empty() {
            return Err(SalvageError::Config("source path is required".to_string()));
        }
        if self.dest_root.as_os_str().is_empty() {
            return Err(SalvageError::Config(
                "destination path is required".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(SalvageError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
