//! Exercises the six-phase checkpoint engine and the async fsync pool
//! directly, below the `Database` convenience layer: several tiled files
//! checkpointed together, each backup-logged, each durable afterward.

use std::sync::Arc;

use gdb_store::checkpoint::CheckpointEngine;
use gdb_store::common::{default_tile_size, MAGIC_INDEX_PARTITION};
use gdb_store::fsync::FsyncPool;
use gdb_store::tile::{AccessMode, TilePool, TiledFile};

fn writable_file(pool: Arc<TilePool>, dir: &std::path::Path, name: &str) -> TiledFile {
    let file = TiledFile::open(pool, dir.join(name), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap();
    file.enable_backup(true, dir, name.trim_end_matches(".addb")).unwrap();
    file
}

#[test]
fn checkpoint_engine_commits_several_files_in_lockstep() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    let fsync = Arc::new(FsyncPool::new(Some(2)));
    let engine = CheckpointEngine::new(dir.path(), fsync);

    let files: Vec<TiledFile> = (0..4)
        .map(|i| {
            let f = writable_file(pool.clone(), dir.path(), &format!("f{i}.addb"));
            let (_, r) = f.alloc(16, 24).unwrap();
            f.put(16, &r, format!("val-{i:04}").as_bytes()).unwrap();
            f.free(r);
            f
        })
        .collect();

    engine.run(&files, 100).unwrap();

    for (i, f) in files.iter().enumerate() {
        assert!(!f.is_dirty(), "checkpoint must leave every file clean");
        let (bytes, r) = f.get(16, 24, AccessMode::Read).unwrap();
        f.free(r);
        assert_eq!(&bytes, format!("val-{i:04}").as_bytes());
        assert!(!dir.path().join(format!("f{i}.clx")).exists());
        assert!(!dir.path().join(format!("f{i}.cln")).exists());
    }
}

#[test]
fn checkpoint_survives_reopen_via_stamped_backup_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path_name = "p.addb";

    {
        let pool = Arc::new(TilePool::new(1 << 20));
        let fsync = Arc::new(FsyncPool::new(Some(1)));
        let engine = CheckpointEngine::new(dir.path(), fsync);
        let file = writable_file(pool, dir.path(), path_name);
        let (_, r) = file.alloc(16, 24).unwrap();
        file.put(16, &r, b"first!!!").unwrap();
        file.free(r);
        engine.run(std::slice::from_ref(&file), 1).unwrap();
    }

    // Reopening and replaying with caller_horizon below the committed
    // horizon is a no-op because the prior checkpoint finished cleanly
    // and retired its backup log; there is nothing left to replay.
    let pool = Arc::new(TilePool::new(1 << 20));
    let file = TiledFile::open(pool, dir.path().join(path_name), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap();
    let replayed = file.replay_backup_log(dir.path(), "p", 0).unwrap();
    assert!(!replayed);
    let (bytes, r) = file.get(16, 24, AccessMode::Read).unwrap();
    file.free(r);
    assert_eq!(&bytes, b"first!!!");
}

#[test]
fn fsync_pool_drains_many_concurrent_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    let fsync = FsyncPool::new(Some(4));

    let files: Vec<TiledFile> = (0..16)
        .map(|i| {
            let f = TiledFile::open(pool.clone(), dir.path().join(format!("t{i}.addb")), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap();
            let (_, r) = f.alloc(0, 8).unwrap();
            f.put(0, &r, &(i as u64).to_be_bytes()).unwrap();
            f.free(r);
            f.snapshot_dirty_into_scheduled().unwrap();
            f
        })
        .collect();

    let tokens: Vec<_> = files.iter().map(|f| fsync.submit_mapping_sync(f.clone())).collect();
    for token in tokens {
        fsync.finish(&token, true).unwrap();
    }
}
