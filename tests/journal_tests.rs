/*!
 * Journal grammar round-trip tests against a literal journal file
 */

use std::path::Path;

use tempfile::tempdir;

use salvage::journal::JOURNAL_FILE;
use salvage::{DirStatus, Journal};

const SAMPLE: &str = "\
- [x] Hash: 0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0 | Path: DCIM/a.jpg | SourcePath: /gvfs/mtp:host=X/Internal shared storage/DCIM/a.jpg
- [x] /gvfs/mtp:host=X/Internal shared storage/Music/old.mp3 | Hash: aaaabbbbccccddddeeeeffff00001111aaaabbbbccccddddeeeeffff00001111
- [ ] /gvfs/mtp:host=X/Internal shared storage/zz/flaky.bin | Failures: 3
- [d] /gvfs/mtp:host=X/Internal shared storage/DCIM/gone.jpg | Hash: 1234123412341234123412341234123412341234123412341234123412341234 | Deleted: 2026-07-30 21:14:02
- [c] /gvfs/mtp:host=X/Internal shared storage/zz/undeletable.bin | CleanupFailures: 2
- [dir] /gvfs/mtp:host=X/Internal shared storage/DCIM | Status: completed
- [dir] /gvfs/mtp:host=X/Internal shared storage/zz | Status: timeout
";

#[test]
fn test_load_every_line_shape() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join(JOURNAL_FILE), SAMPLE).unwrap();
    let journal = Journal::open(dir.path()).unwrap();
    let root = Path::new("/gvfs/mtp:host=X");

    assert!(journal.is_done(
        Path::new("/gvfs/mtp:host=X/Internal shared storage/DCIM/a.jpg"),
        root
    ));
    assert!(journal.is_done(
        Path::new("/gvfs/mtp:host=X/Internal shared storage/Music/old.mp3"),
        root
    ));
    assert_eq!(
        journal.failure_count(Path::new(
            "/gvfs/mtp:host=X/Internal shared storage/zz/flaky.bin"
        )),
        3
    );
    assert!(journal.is_deleted(Path::new(
        "/gvfs/mtp:host=X/Internal shared storage/DCIM/gone.jpg"
    )));
    assert_eq!(
        journal.cleanup_failure_count(Path::new(
            "/gvfs/mtp:host=X/Internal shared storage/zz/undeletable.bin"
        )),
        2
    );
    assert_eq!(
        journal.dir_status(Path::new("/gvfs/mtp:host=X/Internal shared storage/DCIM")),
        Some(DirStatus::Completed)
    );
    assert_eq!(
        journal.dir_status(Path::new("/gvfs/mtp:host=X/Internal shared storage/zz")),
        Some(DirStatus::Timeout)
    );
}

#[test]
fn test_write_then_reload_preserves_all_maps() {
    let dir = tempdir().unwrap();
    let root = Path::new("/phone");

    {
        let journal = Journal::open(dir.path()).unwrap();
        journal
            .mark_done(
                &root.join("Internal shared storage/DCIM/x.jpg"),
                root,
                "ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12",
            )
            .unwrap();
        journal.record_failure(&root.join("bad.bin")).unwrap();
        journal.mark_deleted(&root.join("done.bin"), "cd34").unwrap();
        journal
            .record_cleanup_failure(&root.join("stuck.bin"))
            .unwrap();
        journal
            .set_dir_status(&root.join("DCIM"), DirStatus::Partial)
            .unwrap();
        journal.flush().unwrap();
    }

    let journal = Journal::open(dir.path()).unwrap();
    assert!(journal.is_done(&root.join("Internal shared storage/DCIM/x.jpg"), root));
    assert_eq!(
        journal.completed_under(root)[0].normalized,
        Path::new("DCIM/x.jpg")
    );
    assert_eq!(journal.failure_count(&root.join("bad.bin")), 1);
    assert!(journal.is_deleted(&root.join("done.bin")));
    assert_eq!(journal.cleanup_failure_count(&root.join("stuck.bin")), 1);
    assert_eq!(
        journal.dir_status(&root.join("DCIM")),
        Some(DirStatus::Partial)
    );
}

#[test]
fn test_appends_never_rewrite_existing_lines() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join(JOURNAL_FILE), SAMPLE).unwrap();

    {
        let journal = Journal::open(dir.path()).unwrap();
        journal
            .set_dir_status(
                Path::new("/gvfs/mtp:host=X/Internal shared storage/zz"),
                DirStatus::Partial,
            )
            .unwrap();
        journal.flush().unwrap();
    }

    let content = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
    // The original timeout line is still there; the partial line follows.
    assert!(content.contains("| Status: timeout"));
    assert!(content.ends_with("| Status: partial\n"));

    // And on reload the later entry wins.
    let journal = Journal::open(dir.path()).unwrap();
    assert_eq!(
        journal.dir_status(Path::new("/gvfs/mtp:host=X/Internal shared storage/zz")),
        Some(DirStatus::Partial)
    );
}
