/*!
 * Error types for Salvage
 */

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, SalvageError>;

#[derive(Debug)]
pub enum SalvageError {
    /// The source root is no longer reachable; terminal for the run
    ConnectionLost { path: PathBuf, detail: String },

    /// No bytes observed from the source for the stall budget
    Stalled { path: PathBuf, idle: Duration },

    /// Reading a single directory's entries exceeded its budget
    DirReadTimeout { dir: PathBuf },

    /// Reading a directory's entries failed outright
    DirRead { dir: PathBuf, source: io::Error },

    /// Source and destination hashes disagree after a copy
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// A stat on the transport failed transiently
    StatIo { path: PathBuf, source: io::Error },

    /// The file has exhausted its failure budget and is retired
    Retired { path: PathBuf, failures: u32 },

    /// Journal read/write/parse error
    Journal(String),

    /// adb invocation error
    Adb(String),

    /// Configuration error
    Config(String),

    /// The run was cancelled
    Cancelled,

    /// I/O error
    Io(io::Error),
}

/// Error kind for grouping in the shutdown summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionLost,
    Stall,
    DirReadTimeout,
    DirRead,
    HashMismatch,
    StatIo,
    Retired,
    Journal,
    Adb,
    Config,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConnectionLost => write!(f, "connection-lost"),
            ErrorKind::Stall => write!(f, "stall"),
            ErrorKind::DirReadTimeout => write!(f, "dir-read-timeout"),
            ErrorKind::DirRead => write!(f, "dir-read-error"),
            ErrorKind::HashMismatch => write!(f, "hash-mismatch"),
            ErrorKind::StatIo => write!(f, "stat-io-error"),
            ErrorKind::Retired => write!(f, "permanent-retire"),
            ErrorKind::Journal => write!(f, "journal"),
            ErrorKind::Adb => write!(f, "adb"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

impl SalvageError {
    /// Critical errors terminate the run; everything else is per-file or
    /// per-directory and the pipeline keeps going.
    pub fn is_critical(&self) -> bool {
        matches!(self, SalvageError::ConnectionLost { .. })
    }

    /// Stalls are retried on the next run and never counted as failures.
    pub fn is_stall(&self) -> bool {
        matches!(self, SalvageError::Stalled { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SalvageError::Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SalvageError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            SalvageError::Stalled { .. } => ErrorKind::Stall,
            SalvageError::DirReadTimeout { .. } => ErrorKind::DirReadTimeout,
            SalvageError::DirRead { .. } => ErrorKind::DirRead,
            SalvageError::HashMismatch { .. } => ErrorKind::HashMismatch,
            SalvageError::StatIo { .. } => ErrorKind::StatIo,
            SalvageError::Retired { .. } => ErrorKind::Retired,
            SalvageError::Journal(_) => ErrorKind::Journal,
            SalvageError::Adb(_) => ErrorKind::Adb,
            SalvageError::Config(_) => ErrorKind::Config,
            SalvageError::Cancelled => ErrorKind::Cancelled,
            SalvageError::Io(_) => ErrorKind::Io,
        }
    }

    /// The path the error is about, when there is one. Used by the shutdown
    /// summary to group errors by affected directory.
    pub fn path(&self) -> Option<&Path> {
        match self {
            SalvageError::ConnectionLost { path, .. }
            | SalvageError::Stalled { path, .. }
            | SalvageError::HashMismatch { path, .. }
            | SalvageError::StatIo { path, .. }
            | SalvageError::Retired { path, .. } => Some(path),
            SalvageError::DirReadTimeout { dir } | SalvageError::DirRead { dir, .. } => Some(dir),
            _ => None,
        }
    }
}

/// Raw OS errno values a fragile transport surfaces when the device drops:
/// EIO, ENODEV, ENOTCONN, ESTALE.
const TRANSPORT_ERRNOS: &[i32] = &[5, 19, 107, 116];

/// True when an I/O error looks like the transport itself failing rather
/// than a problem with one file.
pub fn is_transport_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => TRANSPORT_ERRNOS.contains(&code),
        None => false,
    }
}

/// Classify a failed stat of the source root. This is the only layer where
/// OS errors are errno-matched into the closed enum.
///
/// NotFound is terminal regardless of transport. Gvfs mounts report a
/// dropped device as plain ENOENT on the mount point, and a non-gvfs root
/// that vanished leaves the engine nothing to scan either, so the rule is
/// not gated on the path looking like a gvfs mount. Everything outside
/// NotFound and the transport errnos stays a transient stat error.
pub fn classify_root_stat(root: &Path, err: io::Error) -> SalvageError {
    if err.kind() == io::ErrorKind::NotFound || is_transport_error(&err) {
        SalvageError::ConnectionLost {
            path: root.to_path_buf(),
            detail: err.to_string(),
        }
    } else {
        SalvageError::StatIo {
            path: root.to_path_buf(),
            source: err,
        }
    }
}

impl fmt::Display for SalvageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SalvageError::ConnectionLost { path, detail } => {
                write!(f, "connection lost: {} ({})", path.display(), detail)
            }
            SalvageError::Stalled { path, idle } => {
                write!(
                    f,
                    "stalled: no bytes from {} for {}s",
                    path.display(),
                    idle.as_secs()
                )
            }
            SalvageError::DirReadTimeout { dir } => {
                write!(f, "directory read timed out: {}", dir.display())
            }
            SalvageError::DirRead { dir, source } => {
                write!(f, "directory read failed: {}: {}", dir.display(), source)
            }
            SalvageError::HashMismatch {
                path,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "hash mismatch for {}: expected {}, got {}",
                    path.display(),
                    expected,
                    actual
                )
            }
            SalvageError::StatIo { path, source } => {
                write!(f, "stat failed for {}: {}", path.display(), source)
            }
            SalvageError::Retired { path, failures } => {
                write!(f, "retired after {} failures: {}", failures, path.display())
            }
            SalvageError::Journal(msg) => write!(f, "journal error: {}", msg),
            SalvageError::Adb(msg) => write!(f, "adb error: {}", msg),
            SalvageError::Config(msg) => write!(f, "configuration error: {}", msg),
            SalvageError::Cancelled => write!(f, "cancelled"),
            SalvageError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for SalvageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SalvageError::Io(err) => Some(err),
            SalvageError::DirRead { source, .. } => Some(source),
            SalvageError::StatIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for SalvageError {
    fn from(err: io::Error) -> Self {
        SalvageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_errors() {
        let err = SalvageError::ConnectionLost {
            path: PathBuf::from("/run/user/1000/gvfs/mtp:host=X"),
            detail: "No such file or directory".to_string(),
        };
        assert!(err.is_critical());
        assert!(!SalvageError::Cancelled.is_critical());
        assert!(!SalvageError::Stalled {
            path: PathBuf::from("/a"),
            idle: Duration::from_secs(30),
        }
        .is_critical());
    }

    #[test]
    fn test_stall_detection() {
        let err = SalvageError::Stalled {
            path: PathBuf::from("/a"),
            idle: Duration::from_secs(30),
        };
        assert!(err.is_stall());
        assert_eq!(err.kind(), ErrorKind::Stall);
    }

    #[test]
    fn test_transport_errno_classification() {
        assert!(is_transport_error(&io::Error::from_raw_os_error(5)));
        assert!(is_transport_error(&io::Error::from_raw_os_error(107)));
        assert!(is_transport_error(&io::Error::from_raw_os_error(116)));
        assert!(!is_transport_error(&io::Error::from_raw_os_error(13)));
    }

    #[test]
    fn test_root_stat_enoent_is_connection_lost() {
        let root = Path::new("/run/user/1000/gvfs/mtp:host=Pixel");
        let err = classify_root_stat(root, io::Error::from_raw_os_error(2));
        assert!(err.is_critical());
    }

    #[test]
    fn test_root_stat_enoent_terminal_on_non_gvfs_root_too() {
        // A plain directory root that vanished is just as unrecoverable as
        // a dropped gvfs mount.
        let root = Path::new("/mnt/phone");
        let err = classify_root_stat(root, io::Error::from_raw_os_error(2));
        assert!(err.is_critical());
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }

    #[test]
    fn test_root_stat_permission_is_transient() {
        let root = Path::new("/mnt/phone");
        let err = classify_root_stat(root, io::Error::from_raw_os_error(13));
        assert!(!err.is_critical());
        assert_eq!(err.kind(), ErrorKind::StatIo);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::ConnectionLost.to_string(), "connection-lost");
        assert_eq!(ErrorKind::DirReadTimeout.to_string(), "dir-read-timeout");
        assert_eq!(ErrorKind::Retired.to_string(), "permanent-retire");
    }

    #[test]
    fn test_error_display() {
        let err = SalvageError::HashMismatch {
            path: PathBuf::from("/p/x.jpg"),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "hash mismatch for /p/x.jpg: expected abc, got def"
        );
    }
}
