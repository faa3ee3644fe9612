//! Large-array overflow files: tiled, append-only, doubled on growth,
//! used when a source's target set outgrows the largest inline multi
//! size class.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::common::MAGIC_LARGE_ARRAY;
use crate::error::Result;
use crate::tile::{AccessMode, TilePool, TiledFile};

const HEADER_LEN: u64 = 80;
const ENTRY_BYTES: u64 = 5;

pub struct LargeArrayFile {
    file: TiledFile,
    tile_size: u64,
    logical_entries: u64,
}

impl LargeArrayFile {
    fn path_for(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{id}.glf"))
    }

    pub fn create(pool: Arc<TilePool>, dir: impl AsRef<Path>, id: u64, tile_size: usize) -> Result<Self> {
        let path = Self::path_for(dir.as_ref(), id);
        let file = TiledFile::open(pool, &path, MAGIC_LARGE_ARRAY, tile_size, true)?;
        let (_, r) = file.alloc(4, 12)?;
        file.put(4, &r, &0u64.to_be_bytes())?;
        file.free(r);
        Ok(Self { file, tile_size: tile_size as u64, logical_entries: 0 })
    }

    pub fn open(pool: Arc<TilePool>, dir: impl AsRef<Path>, id: u64, tile_size: usize, writable: bool) -> Result<Self> {
        let path = Self::path_for(dir.as_ref(), id);
        let file = TiledFile::open(pool, &path, MAGIC_LARGE_ARRAY, tile_size, writable)?;
        let (bytes, r) = file.get(4, 12, AccessMode::Read)?;
        file.free(r);
        let logical_size = u64::from_be_bytes(bytes.try_into().unwrap());
        Ok(Self { file, tile_size: tile_size as u64, logical_entries: logical_size / ENTRY_BYTES })
    }

    pub fn len(&self) -> u64 {
        self.logical_entries
    }

    fn entry_offset(&self, idx: u64) -> u64 {
        HEADER_LEN + idx * ENTRY_BYTES
    }

    /// Appends one 34-bit target id, growing the file (doubling its
    /// initial mapping when the new entry crosses into unmapped
    /// territory) as needed.
    pub fn append(&mut self, value: u64) -> Result<()> {
        let idx = self.logical_entries;
        let off = self.entry_offset(idx);
        let b = value.to_be_bytes();
        let packed = [b[3], b[4], b[5], b[6], b[7]];
        let (_, r) = self.file.alloc(off, off + ENTRY_BYTES)?;
        self.file.put(off, &r, &packed)?;
        self.file.free(r);

        self.logical_entries += 1;
        let logical_size = self.logical_entries * ENTRY_BYTES;
        let (_, r) = self.file.alloc(4, 12)?;
        self.file.put(4, &r, &logical_size.to_be_bytes())?;
        self.file.free(r);
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(self.logical_entries as usize);
        let mut idx = 0u64;
        while idx < self.logical_entries {
            let off = self.entry_offset(idx);
            let tile_end = (off / self.tile_size + 1) * self.tile_size;
            let count = ((tile_end - off) / ENTRY_BYTES).min(self.logical_entries - idx).max(1);
            let (bytes, r) = self.file.get(off, off + count * ENTRY_BYTES, AccessMode::Read)?;
            self.file.free(r);
            for chunk in bytes.chunks_exact(5) {
                let mut b = [0u8; 8];
                b[3..8].copy_from_slice(chunk);
                out.push(u64::from_be_bytes(b));
            }
            idx += count;
        }
        Ok(out)
    }

    pub fn is_dirty(&self) -> bool {
        self.file.is_dirty()
    }

    /// Checkpoint phase START_WRITES equivalent for large-array files:
    /// no backup log of their own (an overflow file only becomes
    /// reachable once the index slot pointing at it is itself made
    /// durable through the six-phase protocol), so the two phases
    /// collapse to "flush the heap-dirty buffer into the mapping" and
    /// "fsync it, then drop the scheduled snapshot".
    pub fn linear_start(&self) -> Result<()> {
        self.file.snapshot_dirty_into_scheduled()
    }

    pub fn linear_finish(&self) -> Result<()> {
        self.file.fsync_mapping()?;
        self.file.remove_backup_log()?;
        Ok(())
    }
}

/// Soft-LRU cache of open large-array file handles: when more than
/// `soft_limit` are open, the least recently used clean handle is
/// closed (dropped) to free file descriptors and tile memory.
pub struct LargeArrayCache {
    dir: PathBuf,
    pool: Arc<TilePool>,
    tile_size: usize,
    soft_limit: usize,
    open: VecDeque<(u64, LargeArrayFile)>,
}

impl LargeArrayCache {
    pub fn new(dir: impl AsRef<Path>, pool: Arc<TilePool>, tile_size: usize, soft_limit: usize) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), pool, tile_size, soft_limit, open: VecDeque::new() }
    }

    fn touch(&mut self, id: u64) -> Option<usize> {
        self.open.iter().position(|(i, _)| *i == id)
    }

    pub fn get_mut(&mut self, id: u64, writable: bool) -> Result<&mut LargeArrayFile> {
        if let Some(pos) = self.touch(id) {
            let entry = self.open.remove(pos).unwrap();
            self.open.push_back(entry);
        } else {
            self.evict_if_needed();
            let f = LargeArrayFile::open(self.pool.clone(), &self.dir, id, self.tile_size, writable)?;
            self.open.push_back((id, f));
        }
        Ok(&mut self.open.back_mut().unwrap().1)
    }

    pub fn create(&mut self, id: u64) -> Result<&mut LargeArrayFile> {
        self.evict_if_needed();
        let f = LargeArrayFile::create(self.pool.clone(), &self.dir, id, self.tile_size)?;
        self.open.push_back((id, f));
        Ok(&mut self.open.back_mut().unwrap().1)
    }

    fn evict_if_needed(&mut self) {
        while self.open.len() >= self.soft_limit {
            if let Some(pos) = self.open.iter().position(|(_, f)| !f.is_dirty()) {
                let (id, _) = self.open.remove(pos).unwrap();
                debug!(id, "evicted large-array handle from soft-LRU cache");
            } else {
                break; // everything open is dirty; exceed the soft limit rather than lose data
            }
        }
    }

    pub fn dirty_ids(&self) -> Vec<u64> {
        self.open.iter().filter(|(_, f)| f.is_dirty()).map(|(id, _)| *id).collect()
    }

    /// Runs every currently-open dirty large array through its
    /// `linear_start`/`linear_finish` checkpoint participation.
    pub fn checkpoint_dirty(&mut self) -> Result<()> {
        for (_, f) in self.open.iter() {
            if f.is_dirty() {
                f.linear_start()?;
            }
        }
        for (_, f) in self.open.iter() {
            if f.is_dirty() {
                f.linear_finish()?;
            }
        }
        Ok(())
    }

    /// Every large-array id with a file on disk, open or not — used by
    /// checkpoint rollback to find zero-length files left behind by a
    /// conversion that never finished.
    pub fn list_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("glf") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Deletes a large-array file outright: used by checkpoint
    /// rollback when the index reports a zero canonical size for a
    /// file created inside an aborted checkpoint.
    pub fn delete(&mut self, id: u64) -> Result<()> {
        if let Some(pos) = self.touch(id) {
            self.open.remove(pos);
        }
        let path = LargeArrayFile::path_for(&self.dir, id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
