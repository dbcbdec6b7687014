/*!
 * Durable state journal
 *
 * A human-readable markdown file, one entry per line, append-only within a
 * run. On load, later entries for the same key supersede earlier ones. The
 * journal owns every resume decision: completed files (keyed by content
 * hash), failure tallies, confirmed deletions, cleanup failure tallies and
 * per-directory scan status.
 */

use crate::config::MAX_FAILURES;
use crate::error::{Result, SalvageError};
use chrono::Local;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

/// Journal file name under `<dest_root>/<mode>/`
pub const JOURNAL_FILE: &str = "gus_state.md";

/// Source-path prefixes that are protocol artifacts, stripped to produce
/// the protocol-agnostic destination layout.
const STORAGE_PREFIXES: &[&str] = &["Internal shared storage", "SD card"];

static RE_DONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[x\] Hash: ([0-9a-fA-F]+) \| Path: (.+) \| SourcePath: (.+)$").unwrap()
});
static RE_DONE_LEGACY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[x\] (.+) \| Hash: ([0-9a-fA-F]+)$").unwrap());
static RE_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[ \] (.+) \| Failures: (\d+)$").unwrap());
static RE_DELETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[d\] (.+) \| Hash: ([0-9a-fA-F]+) \| Deleted: (.+)$").unwrap()
});
static RE_CLEANUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[c\] (.+) \| CleanupFailures: (\d+)$").unwrap());
static RE_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[dir\] (.+) \| Status: (completed|partial|timeout|error)$").unwrap()
});

/// Scan status of a directory. Terminal within a run; a later run that
/// re-enters the directory overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirStatus {
    Completed,
    Partial,
    Timeout,
    Error,
}

impl DirStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirStatus::Completed => "completed",
            DirStatus::Partial => "partial",
            DirStatus::Timeout => "timeout",
            DirStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(DirStatus::Completed),
            "partial" => Some(DirStatus::Partial),
            "timeout" => Some(DirStatus::Timeout),
            "error" => Some(DirStatus::Error),
            _ => None,
        }
    }
}

/// Per-status directory counts reported at end of scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSummary {
    pub completed: usize,
    pub partial: usize,
    pub timeout: usize,
    pub error: usize,
}

/// A completed file as the verify and cleanup passes see it
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub source: PathBuf,
    pub hash: String,
    pub normalized: PathBuf,
}

/// Strip the source root and any storage prefix from a source path to get
/// the destination-layout path.
pub fn normalize_path(source: &Path, source_root: &Path) -> PathBuf {
    let rel = source.strip_prefix(source_root).unwrap_or(source);
    for prefix in STORAGE_PREFIXES {
        if let Ok(stripped) = rel.strip_prefix(prefix) {
            return stripped.to_path_buf();
        }
    }
    rel.to_path_buf()
}

struct Inner {
    writer: BufWriter<File>,
    done: HashMap<PathBuf, String>,
    layout: HashMap<String, PathBuf>,
    failures: HashMap<PathBuf, u32>,
    deleted: HashMap<PathBuf, String>,
    cleanup_failures: HashMap<PathBuf, u32>,
    dirs: HashMap<PathBuf, DirStatus>,
    discovered: HashMap<PathBuf, BTreeSet<PathBuf>>,
    failed_this_run: HashSet<PathBuf>,
    has_success: bool,
}

impl Inner {
    fn append(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line)
            .map_err(|e| SalvageError::Journal(format!("append failed: {}", e)))
    }
}

/// The journal. One instance per run, shared by reference across the
/// scanner, the workers and the passes; a single mutex serialises appends
/// and map access.
pub struct Journal {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Journal {
    /// Open (creating if needed) the journal under `storage_root` and load
    /// every prior entry into memory.
    pub fn open(storage_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_root)?;
        let path = storage_root.join(JOURNAL_FILE);

        let mut inner = Inner {
            writer: BufWriter::new(
                OpenOptions::new().append(true).create(true).open(&path)?,
            ),
            done: HashMap::new(),
            layout: HashMap::new(),
            failures: HashMap::new(),
            deleted: HashMap::new(),
            cleanup_failures: HashMap::new(),
            dirs: HashMap::new(),
            discovered: HashMap::new(),
            failed_this_run: HashSet::new(),
            has_success: false,
        };

        let reader = BufReader::new(File::open(&path)?);
        for line in reader.lines() {
            let line = line.map_err(|e| SalvageError::Journal(format!("read failed: {}", e)))?;
            Self::load_line(&mut inner, line.trim_end());
        }

        // Seed each directory's discovered set from the completed files it
        // is known to contain, so completed directories can be skipped on
        // resume without re-reading them.
        let parents: Vec<(PathBuf, PathBuf)> = inner
            .done
            .keys()
            .filter_map(|p| p.parent().map(|d| (d.to_path_buf(), p.clone())))
            .collect();
        for (dir, child) in parents {
            inner.discovered.entry(dir).or_default().insert(child);
        }

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn load_line(inner: &mut Inner, line: &str) {
        if let Some(caps) = RE_DONE.captures(line) {
            let hash = caps[1].to_lowercase();
            let normalized = PathBuf::from(&caps[2]);
            let source = PathBuf::from(&caps[3]);
            inner.layout.insert(hash.clone(), normalized);
            inner.done.insert(source, hash);
        } else if let Some(caps) = RE_DONE_LEGACY.captures(line) {
            let source = PathBuf::from(&caps[1]);
            let hash = caps[2].to_lowercase();
            inner.done.insert(source, hash);
        } else if let Some(caps) = RE_FAILURE.captures(line) {
            if let Ok(count) = caps[2].parse::<u32>() {
                inner.failures.insert(PathBuf::from(&caps[1]), count);
            }
        } else if let Some(caps) = RE_DELETED.captures(line) {
            inner
                .deleted
                .insert(PathBuf::from(&caps[1]), caps[2].to_lowercase());
        } else if let Some(caps) = RE_CLEANUP.captures(line) {
            if let Ok(count) = caps[2].parse::<u32>() {
                inner
                    .cleanup_failures
                    .insert(PathBuf::from(&caps[1]), count);
            }
        } else if let Some(caps) = RE_DIR.captures(line) {
            if let Some(status) = DirStatus::parse(&caps[2]) {
                inner.dirs.insert(PathBuf::from(&caps[1]), status);
            }
        }
        // Unrecognised lines are preserved on disk and ignored in memory.
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a completed copy. Arms failure counting for the rest of the
    /// run and keeps the directory bookkeeping current.
    pub fn mark_done(&self, source: &Path, source_root: &Path, hash: &str) -> Result<()> {
        let normalized = normalize_path(source, source_root);
        let mut inner = self.lock();
        inner.append(&format!(
            "- [x] Hash: {} | Path: {} | SourcePath: {}",
            hash,
            normalized.display(),
            source.display()
        ))?;
        inner.layout.insert(hash.to_string(), normalized);
        inner.done.insert(source.to_path_buf(), hash.to_string());
        if let Some(parent) = source.parent() {
            inner
                .discovered
                .entry(parent.to_path_buf())
                .or_default()
                .insert(source.to_path_buf());
        }
        inner.has_success = true;
        Ok(())
    }

    /// True when the path has a completed record under the current root.
    /// A mount-point change invalidates old records so the files are
    /// re-discovered instead of appearing phantom-done.
    pub fn is_done(&self, source: &Path, source_root: &Path) -> bool {
        let inner = self.lock();
        inner.done.contains_key(source) && source.starts_with(source_root)
    }

    /// Hash recorded for a source path, if any.
    pub fn recorded_hash(&self, source: &Path) -> Option<String> {
        self.lock().done.get(source).cloned()
    }

    /// Tally a failure for the path. Returns the new count, or None when
    /// the increment is suppressed: failure counting only arms after the
    /// first success of the run (an initial connection outage must not
    /// burn every file's retry budget), and each path counts at most once
    /// per run.
    pub fn record_failure(&self, source: &Path) -> Result<Option<u32>> {
        let mut inner = self.lock();
        if !inner.has_success {
            return Ok(None);
        }
        if inner.failed_this_run.contains(source) {
            return Ok(None);
        }
        let count = inner.failures.get(source).copied().unwrap_or(0) + 1;
        inner.append(&format!("- [ ] {} | Failures: {}", source.display(), count))?;
        inner.failures.insert(source.to_path_buf(), count);
        inner.failed_this_run.insert(source.to_path_buf());
        Ok(Some(count))
    }

    pub fn failure_count(&self, source: &Path) -> u32 {
        self.lock().failures.get(source).copied().unwrap_or(0)
    }

    /// False once a file has exhausted its failure budget.
    pub fn should_retry(&self, source: &Path) -> bool {
        self.failure_count(source) < MAX_FAILURES
    }

    pub fn has_success(&self) -> bool {
        self.lock().has_success
    }

    /// Record a confirmed deletion of the source file.
    pub fn mark_deleted(&self, source: &Path, hash: &str) -> Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut inner = self.lock();
        inner.append(&format!(
            "- [d] {} | Hash: {} | Deleted: {}",
            source.display(),
            hash,
            timestamp
        ))?;
        inner.deleted.insert(source.to_path_buf(), hash.to_string());
        Ok(())
    }

    pub fn is_deleted(&self, source: &Path) -> bool {
        self.lock().deleted.contains_key(source)
    }

    /// Tally a cleanup failure. No arming: the cleanup pass has its own
    /// connection-loss abort and does not need outage suppression.
    pub fn record_cleanup_failure(&self, source: &Path) -> Result<u32> {
        let mut inner = self.lock();
        let count = inner.cleanup_failures.get(source).copied().unwrap_or(0) + 1;
        inner.append(&format!(
            "- [c] {} | CleanupFailures: {}",
            source.display(),
            count
        ))?;
        inner.cleanup_failures.insert(source.to_path_buf(), count);
        Ok(count)
    }

    pub fn cleanup_failure_count(&self, source: &Path) -> u32 {
        self.lock()
            .cleanup_failures
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_dir_status(&self, dir: &Path, status: DirStatus) -> Result<()> {
        let mut inner = self.lock();
        inner.append(&format!(
            "- [dir] {} | Status: {}",
            dir.display(),
            status.as_str()
        ))?;
        inner.dirs.insert(dir.to_path_buf(), status);
        Ok(())
    }

    pub fn dir_status(&self, dir: &Path) -> Option<DirStatus> {
        self.lock().dirs.get(dir).copied()
    }

    /// Note a file discovered under its parent directory. Memory only; the
    /// durable form is the completed records the files eventually get.
    pub fn note_discovered(&self, parent: &Path, child: &Path) {
        let mut inner = self.lock();
        inner
            .discovered
            .entry(parent.to_path_buf())
            .or_default()
            .insert(child.to_path_buf());
    }

    pub fn discovered_children(&self, dir: &Path) -> Vec<PathBuf> {
        self.lock()
            .discovered
            .get(dir)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when every file discovered under the directory has a completed
    /// record under the current root.
    pub fn all_discovered_done(&self, dir: &Path, source_root: &Path) -> bool {
        let inner = self.lock();
        match inner.discovered.get(dir) {
            Some(children) => children
                .iter()
                .all(|c| inner.done.contains_key(c) && c.starts_with(source_root)),
            None => true,
        }
    }

    /// Resume skip: a directory journalled completed whose known children
    /// are all done under the current root does not need re-reading.
    /// Completed entries with no known children are conservatively
    /// re-scanned; re-scanning is idempotent.
    pub fn can_skip_dir(&self, dir: &Path, source_root: &Path) -> bool {
        let inner = self.lock();
        if inner.dirs.get(dir) != Some(&DirStatus::Completed) {
            return false;
        }
        match inner.discovered.get(dir) {
            Some(children) if !children.is_empty() => children
                .iter()
                .all(|c| inner.done.contains_key(c) && c.starts_with(source_root)),
            _ => false,
        }
    }

    /// Completed records whose source lies under the current root, as the
    /// verify and cleanup passes consume them. Legacy records without a
    /// stored layout path fall back to normalizing against the root.
    pub fn completed_under(&self, source_root: &Path) -> Vec<CompletedFile> {
        let inner = self.lock();
        let mut records: Vec<CompletedFile> = inner
            .done
            .iter()
            .filter(|(source, _)| source.starts_with(source_root))
            .map(|(source, hash)| CompletedFile {
                source: source.clone(),
                hash: hash.clone(),
                normalized: inner
                    .layout
                    .get(hash)
                    .cloned()
                    .unwrap_or_else(|| normalize_path(source, source_root)),
            })
            .collect();
        records.sort_by(|a, b| a.source.cmp(&b.source));
        records
    }

    pub fn done_count(&self) -> usize {
        self.lock().done.len()
    }

    pub fn dir_summary(&self) -> DirSummary {
        let inner = self.lock();
        let mut summary = DirSummary::default();
        for status in inner.dirs.values() {
            match status {
                DirStatus::Completed => summary.completed += 1,
                DirStatus::Partial => summary.partial += 1,
                DirStatus::Timeout => summary.timeout += 1,
                DirStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    /// Flush buffered appends to disk.
    pub fn flush(&self) -> Result<()> {
        self.lock()
            .writer
            .flush()
            .map_err(|e| SalvageError::Journal(format!("flush failed: {}", e)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned journal mutex means a worker panicked mid-append; the
        // maps are still the best record we have, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn journal_in(dir: &Path) -> Journal {
        Journal::open(dir).unwrap()
    }

    #[test]
    fn test_normalize_strips_storage_prefixes() {
        let root = Path::new("/run/user/1000/gvfs/mtp:host=X");
        assert_eq!(
            normalize_path(&root.join("Internal shared storage/DCIM/x.jpg"), root),
            PathBuf::from("DCIM/x.jpg")
        );
        assert_eq!(
            normalize_path(&root.join("SD card/Music/b.mp3"), root),
            PathBuf::from("Music/b.mp3")
        );
        assert_eq!(
            normalize_path(&root.join("Download/y.pdf"), root),
            PathBuf::from("Download/y.pdf")
        );
    }

    #[test]
    fn test_mark_done_round_trip() {
        let dir = tempdir().unwrap();
        let root = Path::new("/phone");
        {
            let journal = journal_in(dir.path());
            journal
                .mark_done(
                    &root.join("Internal shared storage/DCIM/a.jpg"),
                    root,
                    "ab12",
                )
                .unwrap();
            journal.flush().unwrap();
        }

        let journal = journal_in(dir.path());
        assert!(journal.is_done(&root.join("Internal shared storage/DCIM/a.jpg"), root));
        assert_eq!(
            journal.completed_under(root)[0].normalized,
            PathBuf::from("DCIM/a.jpg")
        );
    }

    #[test]
    fn test_legacy_completed_line() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            "- [x] /phone/DCIM/old.jpg | Hash: deadbeef\n",
        )
        .unwrap();

        let journal = journal_in(dir.path());
        let root = Path::new("/phone");
        assert!(journal.is_done(Path::new("/phone/DCIM/old.jpg"), root));
        // No stored layout; normalization falls back to the current root.
        let records = journal.completed_under(root);
        assert_eq!(records[0].normalized, PathBuf::from("DCIM/old.jpg"));
    }

    #[test]
    fn test_later_entries_supersede() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            "- [ ] /phone/a | Failures: 1\n- [ ] /phone/a | Failures: 4\n",
        )
        .unwrap();
        let journal = journal_in(dir.path());
        assert_eq!(journal.failure_count(Path::new("/phone/a")), 4);
    }

    #[test]
    fn test_failure_counting_is_armed_by_success() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let root = Path::new("/phone");

        // Not armed yet: an outage at startup must not count.
        assert_eq!(
            journal.record_failure(Path::new("/phone/a")).unwrap(),
            None
        );
        assert_eq!(journal.failure_count(Path::new("/phone/a")), 0);

        journal.mark_done(&root.join("DCIM/x.jpg"), root, "aa").unwrap();
        assert!(journal.has_success());
        assert_eq!(
            journal.record_failure(Path::new("/phone/a")).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_one_failure_increment_per_run() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let root = Path::new("/phone");
        journal.mark_done(&root.join("x"), root, "aa").unwrap();

        assert_eq!(
            journal.record_failure(Path::new("/phone/a")).unwrap(),
            Some(1)
        );
        assert_eq!(journal.record_failure(Path::new("/phone/a")).unwrap(), None);
        assert_eq!(journal.failure_count(Path::new("/phone/a")), 1);
    }

    #[test]
    fn test_retirement_after_budget() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            format!("- [ ] /phone/bad | Failures: {}\n", MAX_FAILURES),
        )
        .unwrap();
        let journal = journal_in(dir.path());
        assert!(!journal.should_retry(Path::new("/phone/bad")));
        assert!(journal.should_retry(Path::new("/phone/good")));
    }

    #[test]
    fn test_mount_point_change_invalidates_done() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let mtp_root = Path::new("/gvfs/mtp:host=X");
        journal
            .mark_done(&mtp_root.join("DCIM/a.jpg"), mtp_root, "aa")
            .unwrap();

        assert!(journal.is_done(&mtp_root.join("DCIM/a.jpg"), mtp_root));
        let gphoto_root = Path::new("/gvfs/gphoto2:host=X");
        assert!(!journal.is_done(&mtp_root.join("DCIM/a.jpg"), gphoto_root));
        assert!(journal.completed_under(gphoto_root).is_empty());
    }

    #[test]
    fn test_dir_status_round_trip() {
        let dir = tempdir().unwrap();
        {
            let journal = journal_in(dir.path());
            journal
                .set_dir_status(Path::new("/phone/DCIM"), DirStatus::Timeout)
                .unwrap();
            journal
                .set_dir_status(Path::new("/phone/Music"), DirStatus::Completed)
                .unwrap();
            journal.flush().unwrap();
        }
        let journal = journal_in(dir.path());
        assert_eq!(
            journal.dir_status(Path::new("/phone/DCIM")),
            Some(DirStatus::Timeout)
        );
        let summary = journal.dir_summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.timeout, 1);
    }

    #[test]
    fn test_dir_skip_requires_known_done_children() {
        let dir = tempdir().unwrap();
        let root = Path::new("/phone");
        {
            let journal = journal_in(dir.path());
            journal.mark_done(&root.join("DCIM/a.jpg"), root, "aa").unwrap();
            journal
                .set_dir_status(&root.join("DCIM"), DirStatus::Completed)
                .unwrap();
            journal
                .set_dir_status(&root.join("Empty"), DirStatus::Completed)
                .unwrap();
            journal.flush().unwrap();
        }

        let journal = journal_in(dir.path());
        // Reconstructed child is done: skip.
        assert!(journal.can_skip_dir(&root.join("DCIM"), root));
        // Completed but no known children: conservative re-scan.
        assert!(!journal.can_skip_dir(&root.join("Empty"), root));
        // Different root: no skip.
        assert!(!journal.can_skip_dir(&root.join("DCIM"), Path::new("/other")));
    }

    #[test]
    fn test_discovery_blocks_completion() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let root = Path::new("/phone");

        journal.note_discovered(&root.join("DCIM"), &root.join("DCIM/a.jpg"));
        journal.note_discovered(&root.join("DCIM"), &root.join("DCIM/b.jpg"));
        assert!(!journal.all_discovered_done(&root.join("DCIM"), root));

        journal.mark_done(&root.join("DCIM/a.jpg"), root, "aa").unwrap();
        assert!(!journal.all_discovered_done(&root.join("DCIM"), root));

        journal.mark_done(&root.join("DCIM/b.jpg"), root, "bb").unwrap();
        assert!(journal.all_discovered_done(&root.join("DCIM"), root));
    }

    #[test]
    fn test_deleted_and_cleanup_records() {
        let dir = tempdir().unwrap();
        {
            let journal = journal_in(dir.path());
            journal.mark_deleted(Path::new("/phone/x"), "aa").unwrap();
            assert_eq!(
                journal.record_cleanup_failure(Path::new("/phone/y")).unwrap(),
                1
            );
            assert_eq!(
                journal.record_cleanup_failure(Path::new("/phone/y")).unwrap(),
                2
            );
            journal.flush().unwrap();
        }
        let journal = journal_in(dir.path());
        assert!(journal.is_deleted(Path::new("/phone/x")));
        assert!(!journal.is_deleted(Path::new("/phone/y")));
        assert_eq!(journal.cleanup_failure_count(Path::new("/phone/y")), 2);
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            "# heading\n\n- [x] Hash: aa | Path: DCIM/a.jpg | SourcePath: /phone/DCIM/a.jpg\nnot a record\n",
        )
        .unwrap();
        let journal = journal_in(dir.path());
        assert_eq!(journal.done_count(), 1);
    }
}
