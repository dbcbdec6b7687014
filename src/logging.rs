/*!
 * Logging and tracing initialization, plus the run's error log file
 */

use crate::error::{ErrorKind, Result, SalvageError};
use chrono::Local;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Error log file name under `<dest_root>/<mode>/`
pub const ERROR_LOG_FILE: &str = "gus_errors.log";

/// Initialize structured logging for the process.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "salvage=debug" } else { "salvage=info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .map_err(|e| SalvageError::Config(format!("failed to create log filter: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

struct ErrorLogInner {
    writer: BufWriter<File>,
    total: usize,
    by_kind: HashMap<ErrorKind, usize>,
    by_dir: HashMap<PathBuf, usize>,
}

/// Line-oriented timestamped error log. Non-fatal errors land here as they
/// happen; at shutdown the accumulated buckets become the run summary.
pub struct ErrorLog {
    path: PathBuf,
    inner: Mutex<ErrorLogInner>,
}

impl ErrorLog {
    pub fn open(storage_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_root)?;
        let path = storage_root.join(ERROR_LOG_FILE);
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ErrorLogInner {
                writer: BufWriter::new(file),
                total: 0,
                by_kind: HashMap::new(),
                by_dir: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an error: one timestamped line on disk plus the in-memory
    /// kind and directory buckets for the shutdown summary.
    pub fn record(&self, err: &SalvageError) {
        let dir = err.path().map(|p| {
            if p.extension().is_some() {
                p.parent().unwrap_or(p).to_path_buf()
            } else {
                p.to_path_buf()
            }
        });
        let mut inner = self.lock();
        inner.total += 1;
        *inner.by_kind.entry(err.kind()).or_insert(0) += 1;
        if let Some(dir) = dir {
            *inner.by_dir.entry(dir).or_insert(0) += 1;
        }
        let _ = writeln!(
            inner.writer,
            "[{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            err
        );
    }

    /// Append a free-form line (worker anomalies, banners).
    pub fn note(&self, message: &str) {
        let mut inner = self.lock();
        let _ = writeln!(
            inner.writer,
            "[{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
    }

    pub fn flush(&self) {
        let _ = self.lock().writer.flush();
    }

    pub fn summary(&self) -> ErrorSummary {
        let inner = self.lock();
        let mut by_kind: Vec<(ErrorKind, usize)> = inner.by_kind.iter().map(|(k, n)| (*k, *n)).collect();
        by_kind.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        let mut by_dir: Vec<(PathBuf, usize)> = inner.by_dir.iter().map(|(d, n)| (d.clone(), *n)).collect();
        by_dir.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ErrorSummary {
            total: inner.total,
            by_kind,
            by_dir,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ErrorLogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shutdown summary of the run's non-fatal errors, grouped by kind and by
/// affected directory. Printed only when errors were recorded.
#[derive(Debug, Clone)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_kind: Vec<(ErrorKind, usize)>,
    pub by_dir: Vec<(PathBuf, usize)>,
}

impl ErrorSummary {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn render(&self) -> String {
        let mut out = format!("{} error(s) recorded this run\n", self.total);
        out.push_str("By kind:\n");
        for (kind, count) in &self.by_kind {
            out.push_str(&format!("  {:<18} {}\n", kind.to_string(), count));
        }
        if !self.by_dir.is_empty() {
            out.push_str("By directory:\n");
            for (dir, count) in self.by_dir.iter().take(20) {
                out.push_str(&format!("  {:<50} {}\n", dir.display().to_string(), count));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_record_writes_timestamped_line() {
        let dir = tempdir().unwrap();
        let log = ErrorLog::open(dir.path()).unwrap();
        log.record(&SalvageError::Stalled {
            path: PathBuf::from("/phone/DCIM/a.jpg"),
            idle: Duration::from_secs(30),
        });
        log.flush();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("stalled: no bytes from /phone/DCIM/a.jpg"));
        // [YYYY-MM-DD HH:MM:SS] prefix
        assert!(content.starts_with('['));
        assert_eq!(content.as_bytes()[11], b' ');
        assert_eq!(&content[20..22], "] ");
    }

    #[test]
    fn test_summary_groups_by_kind_and_dir() {
        let dir = tempdir().unwrap();
        let log = ErrorLog::open(dir.path()).unwrap();
        for name in ["a.jpg", "b.jpg"] {
            log.record(&SalvageError::Stalled {
                path: PathBuf::from("/phone/DCIM").join(name),
                idle: Duration::from_secs(30),
            });
        }
        log.record(&SalvageError::DirReadTimeout {
            dir: PathBuf::from("/phone/Music"),
        });

        let summary = log.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind[0], (ErrorKind::Stall, 2));
        assert_eq!(summary.by_dir[0], (PathBuf::from("/phone/DCIM"), 2));
        assert!(summary.render().contains("dir-read-timeout"));
    }

    #[test]
    fn test_empty_summary() {
        let dir = tempdir().unwrap();
        let log = ErrorLog::open(dir.path()).unwrap();
        assert!(log.summary().is_empty());
    }
}
