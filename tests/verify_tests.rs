/*!
 * Integration tests for the verification pass
 */

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use salvage::{BackupConfig, Engine, Journal, Mode, NullReporter};

fn test_config(source: &Path, dest: &Path, mode: Mode) -> BackupConfig {
    BackupConfig {
        source_root: source.to_path_buf(),
        dest_root: dest.to_path_buf(),
        mode,
        workers: 2,
        stall_timeout: Duration::from_millis(400),
        progress_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn backed_up_tree(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let source = dir.join("phone");
    let dest = dir.join("backup");
    std::fs::create_dir_all(source.join("DCIM")).unwrap();
    std::fs::write(source.join("DCIM/a.jpg"), vec![1u8; 2048]).unwrap();
    std::fs::write(source.join("DCIM/b.jpg"), vec![2u8; 2048]).unwrap();

    let config = test_config(&source, &dest, Mode::Mount);
    let engine = Engine::new(config, Arc::new(NullReporter)).unwrap();
    assert!(engine.run().unwrap().is_completed());
    (source, dest)
}

#[test]
fn test_verify_clean_backup() {
    let dir = tempdir().unwrap();
    let (source, dest) = backed_up_tree(dir.path());

    let engine = Engine::new(
        test_config(&source, &dest, Mode::Verify),
        Arc::new(NullReporter),
    )
    .unwrap();
    let report = engine.verify().unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.verified, 2);
    assert_eq!(report.mismatched, 0);
    assert!(report.is_clean());
}

#[test]
fn test_verify_rebuilds_corrupted_destination() {
    let dir = tempdir().unwrap();
    let (source, dest) = backed_up_tree(dir.path());

    // Corrupt one destination file behind the journal's back.
    std::fs::write(dest.join("mount/DCIM/a.jpg"), b"bitrot").unwrap();

    let engine = Engine::new(
        test_config(&source, &dest, Mode::Verify),
        Arc::new(NullReporter),
    )
    .unwrap();
    let report = engine.verify().unwrap();

    assert_eq!(report.verified, 2);
    assert_eq!(report.rebuilt, 1);
    assert_eq!(report.mismatched, 0);
    assert!(report.is_clean());
    // The destination was rebuilt from the source.
    assert_eq!(
        std::fs::read(dest.join("mount/DCIM/a.jpg")).unwrap(),
        vec![1u8; 2048]
    );
}

#[test]
fn test_verify_counts_missing_destination() {
    let dir = tempdir().unwrap();
    let (source, dest) = backed_up_tree(dir.path());

    std::fs::remove_file(dest.join("mount/DCIM/b.jpg")).unwrap();

    let engine = Engine::new(
        test_config(&source, &dest, Mode::Verify),
        Arc::new(NullReporter),
    )
    .unwrap();
    let report = engine.verify().unwrap();

    assert_eq!(report.missing_dest, 1);
    assert_eq!(report.verified, 1);
    assert!(!report.is_clean());
}

#[test]
fn test_verify_counts_missing_source() {
    let dir = tempdir().unwrap();
    let (source, dest) = backed_up_tree(dir.path());

    std::fs::remove_file(source.join("DCIM/a.jpg")).unwrap();

    let engine = Engine::new(
        test_config(&source, &dest, Mode::Verify),
        Arc::new(NullReporter),
    )
    .unwrap();
    let report = engine.verify().unwrap();

    assert_eq!(report.missing_source, 1);
    assert_eq!(report.verified, 1);
    // Sources legitimately disappear after cleanup; the backup still holds.
    assert!(report.is_clean());
}

#[test]
fn test_adb_verify_checks_destination_against_stored_hash() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("backup");
    let device_root = Path::new("/sdcard");

    // Journal as an adb run would have written it; no local source files.
    let storage = dest.join("adb");
    std::fs::create_dir_all(storage.join("DCIM")).unwrap();
    std::fs::write(storage.join("DCIM/ok.jpg"), b"device bytes").unwrap();
    std::fs::write(storage.join("DCIM/bad.jpg"), b"tampered").unwrap();
    {
        let journal = Journal::open(&storage).unwrap();
        let ok_hash = salvage::checksum::hash_file(&storage.join("DCIM/ok.jpg")).unwrap();
        journal
            .mark_done(&device_root.join("DCIM/ok.jpg"), device_root, &ok_hash)
            .unwrap();
        journal
            .mark_done(
                &device_root.join("DCIM/bad.jpg"),
                device_root,
                "0000000000000000000000000000000000000000000000000000000000000000",
            )
            .unwrap();
        journal.flush().unwrap();
    }

    let engine = Engine::new(
        test_config(device_root, &dest, Mode::Adb),
        Arc::new(NullReporter),
    )
    .unwrap();
    let report = engine.verify().unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.verified, 1);
    assert_eq!(report.mismatched, 1);
    assert_eq!(report.missing_source, 0);
    assert!(!report.is_clean());
}
