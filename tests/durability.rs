//! Crash-recovery properties: the backup (undo) log's replay contract,
//! and the database's best-effort rollback of half-finished conversions.

use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;

use gdb_store::backup::BackupLog;
use gdb_store::common::{default_tile_size, MAGIC_INDEX_PARTITION};
use gdb_store::tile::{AccessMode, TilePool, TiledFile};
use gdb_store::{Database, StoreConfig};

fn open_file(dir: &std::path::Path, name: &str) -> TiledFile {
    let pool = Arc::new(TilePool::new(1 << 20));
    TiledFile::open(pool, dir.join(name), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap()
}

/// A large-array file left at zero logical length (the tail end of a
/// conversion interrupted before it appended anything) gets unlinked by
/// `Database::rollback`, because nothing yet references it.
#[test]
fn rollback_deletes_zero_size_large_array() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::default();
    let mut db = Database::open(dir.path(), &cfg).unwrap();
    // Touch the index once so its directory structure (including
    // `large/`) exists before we drop a stray file into it.
    db.index("edges").unwrap();

    let large_dir = dir.path().join("index").join("edges").join("large");
    assert!(large_dir.is_dir());
    let mut f = File::create(large_dir.join("999.glf")).unwrap();
    f.write_all(b"lfv2").unwrap(); // magic
    f.write_all(&0u64.to_be_bytes()).unwrap(); // logical size = 0
    drop(f);

    db.rollback().unwrap();
    assert!(!large_dir.join("999.glf").exists());
}

/// A large-array file with a nonzero logical length is left alone by
/// rollback: it is reachable from an index slot and must not be pruned.
#[test]
fn rollback_leaves_nonempty_large_array_alone() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::default();
    let mut db = Database::open(dir.path(), &cfg).unwrap();
    db.index("edges").unwrap();

    let large_dir = dir.path().join("index").join("edges").join("large");
    let mut f = File::create(large_dir.join("42.glf")).unwrap();
    f.write_all(b"lfv2").unwrap();
    f.write_all(&5u64.to_be_bytes()).unwrap(); // logical size = 5 bytes, not 5 entries but nonzero
    drop(f);

    db.rollback().unwrap();
    assert!(large_dir.join("42.glf").exists());
}

/// A backup log stamped with a horizon below the file's own recorded
/// horizon is stale — left over from a checkpoint that completed a prior
/// cycle without the log ever being retired (e.g. a crash between
/// `RemoveBackup`'s fsync and the unlink) — and must be discarded without
/// touching the data file.
#[test]
fn stale_backup_log_is_discarded_without_replay() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_file(dir.path(), "partition.addb");

    let (_, r) = file.alloc(64, 72).unwrap();
    file.put(64, &r, b"CURRENT!").unwrap();
    file.free(r);
    file.snapshot_dirty_into_scheduled().unwrap();
    file.fsync_mapping().unwrap();

    let mut log = BackupLog::new(dir.path(), "partition");
    log.write(64, b"OLDVALUE").unwrap();
    log.sync_and_stamp(5).unwrap();

    let replayed = file.replay_backup_log(dir.path(), "partition", 10).unwrap();
    assert!(!replayed, "a log horizon below the caller's own horizon must be treated as stale");

    let (bytes, r) = file.get(64, 72, AccessMode::Read).unwrap();
    file.free(r);
    assert_eq!(&bytes, b"CURRENT!", "stale log must not overwrite current data");

    assert!(!dir.path().join("partition.clx").exists());
    assert!(!dir.path().join("partition.cln").exists());
}

/// A committed backup log whose horizon is at or above the caller's own
/// horizon is replayed: every recorded pre-image is written back, and the
/// log files are removed afterward.
#[test]
fn committed_backup_log_replays_its_undo_images() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_file(dir.path(), "partition.addb");

    let (_, r) = file.alloc(64, 72).unwrap();
    file.put(64, &r, b"CURRENT!").unwrap();
    file.free(r);
    file.snapshot_dirty_into_scheduled().unwrap();
    file.fsync_mapping().unwrap();

    let mut log = BackupLog::new(dir.path(), "partition");
    log.write(64, b"OLDVALUE").unwrap();
    log.sync_and_stamp(20).unwrap();

    let replayed = file.replay_backup_log(dir.path(), "partition", 10).unwrap();
    assert!(replayed);

    let (bytes, r) = file.get(64, 72, AccessMode::Read).unwrap();
    file.free(r);
    assert_eq!(&bytes, b"OLDVALUE", "replay must restore the undo image");

    assert!(!dir.path().join("partition.clx").exists());
    assert!(!dir.path().join("partition.cln").exists());
}

/// A corrupted (bad magic) or truncated backup log is ignored rather than
/// applied or treated as an error — both slots are still removed so a
/// subsequent checkpoint starts clean.
#[test]
fn corrupt_backup_log_is_ignored_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_file(dir.path(), "partition.addb");

    let (_, r) = file.alloc(64, 72).unwrap();
    file.put(64, &r, b"CURRENT!").unwrap();
    file.free(r);
    file.snapshot_dirty_into_scheduled().unwrap();
    file.fsync_mapping().unwrap();

    // Not a valid backup log: random bytes, no magic.
    fs::write(dir.path().join("partition.clx"), b"not-a-real-backup-log-at-all").unwrap();

    let replayed = file.replay_backup_log(dir.path(), "partition", 0).unwrap();
    assert!(!replayed);

    let (bytes, r) = file.get(64, 72, AccessMode::Read).unwrap();
    file.free(r);
    assert_eq!(&bytes, b"CURRENT!");
}
