//! Top-level database handle.
//!
//! Mirrors the shape of the teacher crate's `GraphStorageManager`
//! (`src/graph/storage.rs`): one object owning a base directory and
//! delegating persistence to format-specific helpers. Here the
//! helpers are the primitive store and the named source→list indexes,
//! and the shared state is the tile pool and the checkpoint/fsync
//! machinery that drives them together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::checkpoint::CheckpointEngine;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::fsync::FsyncPool;
use crate::index::SourceListIndex;
use crate::primitive_store::PrimitiveStore;
use crate::sabotage::Sabotage;
use crate::tile::TilePool;

const PRIMITIVES_DIR: &str = "primitives";
const INDEXES_DIR: &str = "index";

/// Owns every durable structure for one database directory: the
/// shared tile pool, the primitive record store, and however many
/// named source→list indexes have been opened. `open` replays each
/// tiled file's published backup log as it's first touched, so a
/// database recovered from a crash is consistent by the time any of
/// its accessors are called.
pub struct Database {
    dir: PathBuf,
    pool: Arc<TilePool>,
    tile_size: usize,
    primitives: PrimitiveStore,
    indexes: HashMap<String, SourceListIndex>,
    fsync: Arc<FsyncPool>,
    checkpoint: CheckpointEngine,
    sabotage: Option<Arc<Sabotage>>,
}

impl Database {
    /// Opens (creating if necessary) the database rooted at `dir`,
    /// eagerly reopening every index subdirectory found on disk so a
    /// reopened database sees the same named indexes it had before.
    pub fn open(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let pool = Arc::new(TilePool::new(config.pool_max_bytes));
        let primitives = PrimitiveStore::open_with_sabotage(
            dir.join(PRIMITIVES_DIR),
            pool.clone(),
            config.tile_size,
            config.sabotage.clone(),
        )?;

        let indexes_dir = dir.join(INDEXES_DIR);
        std::fs::create_dir_all(&indexes_dir)?;
        let mut indexes = HashMap::new();
        for entry in std::fs::read_dir(&indexes_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let idx = SourceListIndex::open_with_sabotage(entry.path(), pool.clone(), config.tile_size, config.sabotage.clone())?;
                indexes.insert(name, idx);
            }
        }

        let fsync = Arc::new(FsyncPool::new(config.fsync_workers));
        let checkpoint = CheckpointEngine::new(&dir, fsync.clone());

        info!(dir = %dir.display(), indexes = indexes.len(), "database opened");
        Ok(Self {
            dir,
            pool,
            tile_size: config.tile_size,
            primitives,
            indexes,
            fsync,
            checkpoint,
            sabotage: config.sabotage.clone(),
        })
    }

    pub fn primitives(&mut self) -> &mut PrimitiveStore {
        &mut self.primitives
    }

    /// Opens (creating on first use) the named source→list index.
    pub fn index(&mut self, name: &str) -> Result<&mut SourceListIndex> {
        if !self.indexes.contains_key(name) {
            let path = self.dir.join(INDEXES_DIR).join(name);
            let idx = SourceListIndex::open_with_sabotage(path, self.pool.clone(), self.tile_size, self.sabotage.clone())?;
            self.indexes.insert(name.to_string(), idx);
        }
        Ok(self.indexes.get_mut(name).unwrap())
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.keys().map(String::as_str).collect()
    }

    /// Drives one full group-commit checkpoint: the primitive store
    /// and every index partition file advance through the six-phase
    /// protocol together, then every dirty large-array/bitmap overflow
    /// file runs its own simplified two-phase handling (§4.7 — these
    /// files carry no backup log of their own, so they have nothing to
    /// contribute to phases `FinishBackup`/`SyncBackup`).
    pub fn checkpoint(&mut self, new_horizon: u64) -> Result<()> {
        let mut files = self.primitives.tiled_files();
        for idx in self.indexes.values() {
            files.extend(idx.tiled_files());
        }

        self.checkpoint.run(&files, new_horizon)?;

        self.primitives.advance_horizon(new_horizon)?;
        for idx in self.indexes.values_mut() {
            idx.advance_horizon(new_horizon)?;
            idx.checkpoint_overflow()?;
        }

        info!(horizon = new_horizon, files = files.len(), "database checkpoint complete");
        Ok(())
    }

    /// Explicit shutdown point. Dropping `Database` already releases
    /// every resource (tiled files unmap, the fsync pool's worker
    /// threads join); `close` exists so callers have a named call that
    /// can't be accidentally skipped by an early return, matching the
    /// teacher crate's explicit `shutdown` methods.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Best-effort recovery after an interrupted checkpoint: deletes
    /// every large-array overflow file left at zero logical length
    /// across every open index. Per the `lf_delete_count` open
    /// question (spec.md §9), a large-array file only reaches zero
    /// length if the conversion that created it was interrupted before
    /// appending anything, in which case nothing references it yet and
    /// it is safe to unlink outright; the partition file it would have
    /// been linked from never left `SLOT_MULTI`/`SLOT_SINGLETON`
    /// because that slot write itself goes through the same six-phase
    /// protocol as everything else.
    pub fn rollback(&mut self) -> Result<()> {
        for (name, idx) in self.indexes.iter_mut() {
            let pruned = idx.prune_empty_large_arrays()?;
            if !pruned.is_empty() {
                info!(index = name, count = pruned.len(), "rollback pruned empty large-array files");
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &Arc<TilePool> {
        &self.pool
    }

    pub fn fsync_pool(&self) -> &Arc<FsyncPool> {
        &self.fsync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::OnDuplicate;

    #[test]
    fn open_add_checkpoint_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        {
            let mut db = Database::open(dir.path(), &config).unwrap();
            let id_a = db.primitives().append(b"node a").unwrap();
            let id_b = db.primitives().append(b"node b").unwrap();
            db.index("edges").unwrap().add(id_a, id_b, OnDuplicate::Reject).unwrap();
            let horizon = db.primitives().next_id();
            db.checkpoint(horizon).unwrap();
        }
        let mut db = Database::open(dir.path(), &config).unwrap();
        assert_eq!(db.primitives().next_id(), 2);
        assert_eq!(db.primitives().read(0).unwrap()[..6], *b"node a");
        assert_eq!(db.index("edges").unwrap().targets(0, true).unwrap(), vec![1]);
    }

    #[test]
    fn rollback_prunes_empty_large_array_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        let mut db = Database::open(dir.path(), &config).unwrap();
        db.index("edges").unwrap().create_large_for_test(999).unwrap();
        db.rollback().unwrap();
        assert!(db.index("edges").unwrap().large_ids_for_test().is_empty());
    }

    /// A `StoreConfig::sabotage` handle reaches every partition's backup
    /// log through `Database`: the first backup write after it arms
    /// fails and is deferred (`advance_backup = false`), but checkpoint
    /// phase `FinishBackup`'s retry succeeds once the one-shot hook has
    /// fired, so the checkpoint still completes and the data is durable.
    #[test]
    fn sabotage_handle_reaches_backup_log_through_database_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::default();
        config.sabotage = Some(Arc::new(crate::sabotage::Sabotage::new(0, libc::EIO)));
        let mut db = Database::open(dir.path(), &config).unwrap();

        let id_a = db.primitives().append(b"node a").unwrap();
        let id_b = db.primitives().append(b"node b").unwrap();
        db.index("edges").unwrap().add(id_a, id_b, OnDuplicate::Reject).unwrap();
        let horizon = db.primitives().next_id();
        db.checkpoint(horizon).unwrap();

        drop(db);
        let mut db = Database::open(dir.path(), &config).unwrap();
        assert_eq!(db.index("edges").unwrap().targets(id_a, true).unwrap(), vec![id_b]);
    }
}
