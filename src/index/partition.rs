//! On-disk layout and raw byte-level access for one index partition
//! file: header, size-class free-list heads, the dense 2²⁴-slot table,
//! and the overflow arena holding multi-arrays.

use std::path::Path;
use std::sync::Arc;

use crate::common::{
    round_up, ARENA_ENTRY_BYTES, ARENA_OFFSET_UNIT, MAGIC_INDEX_PARTITION, MAX_MULTI_EXP,
    SLOTS_PER_PARTITION,
};
use crate::error::Result;
use crate::sabotage::Sabotage;
use crate::tile::{AccessMode, TilePool, TiledFile};

const HEADER_LEN: u64 = 32;
const FREE_LIST_BYTES: u64 = MAX_MULTI_EXP as u64 * ARENA_ENTRY_BYTES;
pub const FREE_LIST_OFFSET: u64 = HEADER_LEN;
pub const SLOT_TABLE_OFFSET: u64 = FREE_LIST_OFFSET + FREE_LIST_BYTES;
const SLOT_TABLE_BYTES: u64 = SLOTS_PER_PARTITION * ARENA_ENTRY_BYTES;
pub const ARENA_OFFSET: u64 = SLOT_TABLE_OFFSET + SLOT_TABLE_BYTES;

/// Packs `value` (up to 40 bits) into 5 big-endian bytes.
pub fn pack5(value: u64) -> [u8; 5] {
    debug_assert!(value < (1u64 << 40));
    let b = value.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

pub fn unpack5(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b[3..8].copy_from_slice(&buf[..5]);
    u64::from_be_bytes(b)
}

pub struct IndexPartition {
    pub(crate) file: TiledFile,
    pub(crate) tile_size: u64,
}

impl IndexPartition {
    /// Opens the partition, replaying any published backup log found
    /// next to it (discarding it if `log_horizon` shows it's stale)
    /// and, if `writable`, arming backup logging for future writes.
    pub fn open(
        pool: Arc<TilePool>,
        path: impl AsRef<Path>,
        tile_size: usize,
        writable: bool,
        log_horizon: u64,
        sabotage: Option<Arc<Sabotage>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = TiledFile::open(pool, path, MAGIC_INDEX_PARTITION, tile_size, writable)?;
        if writable {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("partition").to_string();
            file.replay_backup_log(dir, &stem, log_horizon)?;
            file.enable_backup_with_sabotage(true, dir, &stem, sabotage)?;
        }
        Ok(Self { file, tile_size: tile_size as u64 })
    }

    /// Handle to the underlying tiled file, for the checkpoint engine
    /// to gather across every open partition.
    pub fn tiled_file(&self) -> TiledFile {
        self.file.clone()
    }

    fn spanning_read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let tile_end = (pos / self.tile_size + 1) * self.tile_size;
            let chunk = ((tile_end - pos) as usize).min(len - out.len());
            let (bytes, r) = self.file.get(pos, pos + chunk as u64, AccessMode::Read)?;
            self.file.free(r);
            out.extend_from_slice(&bytes);
            pos += chunk as u64;
        }
        Ok(out)
    }

    fn spanning_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let tile_end = (pos / self.tile_size + 1) * self.tile_size;
            let chunk = ((tile_end - pos) as usize).min(data.len() - written);
            let (_, r) = self.file.alloc(pos, pos + chunk as u64)?;
            self.file.put(pos, &r, &data[written..written + chunk])?;
            self.file.free(r);
            pos += chunk as u64;
            written += chunk;
        }
        Ok(())
    }

    pub fn read_slot(&self, local_id: u64) -> Result<u64> {
        let off = SLOT_TABLE_OFFSET + local_id * ARENA_ENTRY_BYTES;
        let bytes = self.spanning_read(off, 5)?;
        Ok(unpack5(&bytes))
    }

    pub fn write_slot(&self, local_id: u64, value: u64) -> Result<()> {
        let off = SLOT_TABLE_OFFSET + local_id * ARENA_ENTRY_BYTES;
        self.spanning_write(off, &pack5(value))
    }

    fn free_list_head(&self, exp: u32) -> Result<u64> {
        let off = FREE_LIST_OFFSET + exp as u64 * ARENA_ENTRY_BYTES;
        let bytes = self.spanning_read(off, 5)?;
        Ok(unpack5(&bytes))
    }

    fn set_free_list_head(&self, exp: u32, arena_units: u64) -> Result<()> {
        let off = FREE_LIST_OFFSET + exp as u64 * ARENA_ENTRY_BYTES;
        self.spanning_write(off, &pack5(arena_units))
    }

    fn arena_byte_offset(units: u64) -> u64 {
        ARENA_OFFSET + units * ARENA_OFFSET_UNIT
    }

    /// Reads `count` consecutive 5-byte arena entries starting at
    /// `units` (an offset in `ARENA_OFFSET_UNIT`-byte units from the
    /// arena base).
    pub fn read_arena(&self, units: u64, count: u64) -> Result<Vec<u64>> {
        let bytes = self.spanning_read(Self::arena_byte_offset(units), (count * ARENA_ENTRY_BYTES) as usize)?;
        Ok(bytes.chunks_exact(5).map(unpack5).collect())
    }

    pub fn write_arena(&self, units: u64, values: &[u64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(values.len() * 5);
        for v in values {
            bytes.extend_from_slice(&pack5(*v));
        }
        self.spanning_write(Self::arena_byte_offset(units), &bytes)
    }

    /// Reads the single entry at index `idx` within the block starting
    /// at `units`, i.e. byte `arena_byte_offset(units) + idx *
    /// ARENA_ENTRY_BYTES`. `idx` is a plain entry count and must never
    /// be folded into `units` itself: `units` advances in
    /// `ARENA_OFFSET_UNIT` (10-byte) strides while entries within a
    /// block pack at `ARENA_ENTRY_BYTES` (5-byte) strides.
    pub fn read_arena_entry(&self, units: u64, idx: u64) -> Result<u64> {
        let off = Self::arena_byte_offset(units) + idx * ARENA_ENTRY_BYTES;
        let bytes = self.spanning_read(off, ARENA_ENTRY_BYTES as usize)?;
        Ok(unpack5(&bytes))
    }

    /// Writes the single entry at index `idx` within the block starting
    /// at `units`. See [`IndexPartition::read_arena_entry`].
    pub fn write_arena_entry(&self, units: u64, idx: u64, value: u64) -> Result<()> {
        let off = Self::arena_byte_offset(units) + idx * ARENA_ENTRY_BYTES;
        self.spanning_write(off, &pack5(value))
    }

    /// Allocates a block of `2^exp` arena entries, reusing the
    /// size-class free list when non-empty, otherwise growing the
    /// arena from its current end (tracked via the header's virtual
    /// file size field).
    pub fn alloc_block(&self, exp: u32) -> Result<u64> {
        let head = self.free_list_head(exp)?;
        if head != 0 {
            let next = self.read_arena(head, 1)?[0];
            self.set_free_list_head(exp, next)?;
            return Ok(head);
        }
        let mut vfs = self.read_virtual_size()?;
        if vfs == 0 {
            // Unit 0 is reserved: a free-list head of 0 must mean
            // "empty", so no real block may ever live at units 0.
            vfs = 1;
        }
        let units = vfs;
        let block_bytes = (1u64 << exp) * ARENA_ENTRY_BYTES;
        let block_units = round_up(block_bytes, ARENA_OFFSET_UNIT) / ARENA_OFFSET_UNIT;
        self.write_virtual_size(vfs + block_units)?;
        Ok(units)
    }

    /// Returns a freed block of `2^exp` entries to its size-class free
    /// list, storing the previous head as the block's first entry
    /// (classic intrusive free-list reuse of the payload it no longer
    /// needs).
    pub fn free_block(&self, exp: u32, units: u64) -> Result<()> {
        let head = self.free_list_head(exp)?;
        self.write_arena(units, &[head])?;
        self.set_free_list_head(exp, units)
    }

    fn read_virtual_size(&self) -> Result<u64> {
        let bytes = self.spanning_read(4, 8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn write_virtual_size(&self, size: u64) -> Result<()> {
        self.spanning_write(4, &size.to_be_bytes())
    }
}
