/*!
 * Progress reporting seam
 *
 * The engine pushes updates into a narrow trait; console, desktop and
 * remote adapters implement it. Updates are sequence-numbered so a UI that
 * reconnects can discard stale ones.
 */

use crate::error::SalvageError;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::Level;

/// Aggregate snapshot published on the progress cadence
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressUpdate {
    pub seq: u64,
    pub total_files: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub timeout_skips: u64,
    pub consecutive_skips: u64,
    pub total_bytes: u64,
    pub rate_bps: f64,
    pub delta_mb: f64,
    pub worker_statuses: BTreeMap<usize, String>,
    pub scan_complete: bool,
}

/// Implemented by whatever is watching the run.
pub trait ProgressReporter: Send + Sync {
    fn progress(&self, update: &ProgressUpdate);
    fn error(&self, err: &SalvageError);
    fn log(&self, level: Level, message: &str);
}

/// Reporter that discards everything. For tests and headless embedding.
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn progress(&self, _update: &ProgressUpdate) {}
    fn error(&self, _err: &SalvageError) {}
    fn log(&self, _level: Level, _message: &str) {}
}

/// Terminal reporter: one aggregate line plus one line per worker.
pub struct ConsoleReporter {
    multi: MultiProgress,
    aggregate: ProgressBar,
    workers: Mutex<HashMap<usize, ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let aggregate = multi.add(ProgressBar::new_spinner());
        aggregate.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}").unwrap(),
        );
        aggregate.enable_steady_tick(Duration::from_millis(250));
        Self {
            multi,
            aggregate,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn finish(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for bar in workers.values() {
            bar.finish_and_clear();
        }
        self.aggregate.finish_and_clear();
    }

    fn worker_bar(&self, id: usize) -> ProgressBar {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .entry(id)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(ProgressStyle::with_template("  {msg}").unwrap());
                bar
            })
            .clone()
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn progress(&self, update: &ProgressUpdate) {
        let scan = if update.scan_complete {
            format!("{}", update.total_files)
        } else {
            format!("{}+", update.total_files)
        };
        self.aggregate.set_message(format!(
            "{} files | {} done, {} failed, {} skipped, {} stalled | {} | {}/s",
            scan,
            update.completed,
            update.failed,
            update.skipped,
            update.timeout_skips,
            format_bytes(update.total_bytes),
            format_bytes(update.rate_bps as u64),
        ));
        for (id, status) in &update.worker_statuses {
            self.worker_bar(*id)
                .set_message(format!("[worker {}] {}", id, status));
        }
    }

    fn error(&self, err: &SalvageError) {
        let _ = self.multi.println(format!("ERROR: {}", err));
    }

    fn log(&self, level: Level, message: &str) {
        if level <= Level::WARN {
            let _ = self.multi.println(format!("{}: {}", level, message));
        } else {
            tracing::debug!("{}", message);
        }
    }
}

/// Format bytes into a human-readable quantity.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}
