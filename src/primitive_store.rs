//! Partitioned, append-only store mapping a dense 34-bit identifier
//! space to variable-length opaque byte records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::common::{round_up, MAGIC_PRIMITIVE_MARKER_HORIZON, MAGIC_PRIMITIVE_MARKER_NEXT, MAGIC_PRIMITIVE_PARTITION, MAX_ID, SLOTS_PER_PARTITION};
use crate::error::{Result, StoreError};
use crate::marker::MarkerFile;
use crate::sabotage::Sabotage;
use crate::tile::{AccessMode, TilePool, TiledFile};

/// Each local id maps to a 5-byte big-endian value counting 8-byte
/// units; the byte offset is `value * 8`.
const INDEX_ENTRY_BYTES: u64 = 5;
const INDEX_TABLE_BYTES: u64 = SLOTS_PER_PARTITION * INDEX_ENTRY_BYTES;
const DATA_ORIGIN: u64 = 4 + INDEX_TABLE_BYTES;

fn encode_units(byte_offset: u64) -> [u8; 5] {
    debug_assert_eq!(byte_offset % 8, 0, "record offsets are always 8-byte aligned");
    let units = byte_offset / 8;
    let b = units.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

fn decode_units(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b[3..8].copy_from_slice(&buf[..5]);
    u64::from_be_bytes(b) * 8
}

struct Partition {
    file: TiledFile,
}

impl Partition {
    /// Opens the partition, replaying any published backup log found
    /// next to it (discarding it if `log_horizon` shows it's stale)
    /// and, if `writable`, arming backup logging for future writes.
    fn open(
        pool: Arc<TilePool>,
        path: impl AsRef<Path>,
        tile_size: usize,
        writable: bool,
        log_horizon: u64,
        sabotage: Option<Arc<Sabotage>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = TiledFile::open(pool, path, MAGIC_PRIMITIVE_PARTITION, tile_size, writable)?;
        if writable {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("partition").to_string();
            file.replay_backup_log(dir, &stem, log_horizon)?;
            file.enable_backup_with_sabotage(true, dir, &stem, sabotage)?;
        }
        Ok(Self { file })
    }

    /// Writes `data`, which may span several tiles, starting at
    /// `offset`, one tile-sized (or smaller) chunk at a time so no
    /// single `get`/`alloc` call crosses a tile boundary.
    fn write_spanning(&self, offset: u64, data: &[u8], tile_size: u64) -> Result<()> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let tile_end = (pos / tile_size + 1) * tile_size;
            let chunk_len = ((tile_end - pos) as usize).min(data.len() - written);
            let (_, r) = self.file.alloc(pos, pos + chunk_len as u64)?;
            self.file.put(pos, &r, &data[written..written + chunk_len])?;
            self.file.free(r);
            pos += chunk_len as u64;
            written += chunk_len;
        }
        Ok(())
    }

    fn read_spanning(&self, offset: u64, len: usize, tile_size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let tile_end = (pos / tile_size + 1) * tile_size;
            let chunk_len = ((tile_end - pos) as usize).min(len - out.len());
            let (bytes, r) = self.file.get(pos, pos + chunk_len as u64, AccessMode::Read)?;
            self.file.free(r);
            out.extend_from_slice(&bytes);
            pos += chunk_len as u64;
        }
        Ok(out)
    }

    fn index_entry_offset(local_id: u64) -> u64 {
        4 + local_id * INDEX_ENTRY_BYTES
    }

    fn read_end_offset(&self, local_id: u64, tile_size: u64) -> Result<u64> {
        let bytes = self.read_spanning(Self::index_entry_offset(local_id), 5, tile_size)?;
        Ok(decode_units(&bytes))
    }

    fn write_end_offset(&self, local_id: u64, byte_offset: u64, tile_size: u64) -> Result<()> {
        self.write_spanning(Self::index_entry_offset(local_id), &encode_units(byte_offset), tile_size)
    }

    fn record_start(&self, local_id: u64, tile_size: u64) -> Result<u64> {
        if local_id == 0 {
            Ok(DATA_ORIGIN)
        } else {
            let end = self.read_end_offset(local_id - 1, tile_size)?;
            if end == 0 {
                return Err(StoreError::database(format!(
                    "primitive store gap: local id {} has no prior record",
                    local_id
                )));
            }
            Ok(end)
        }
    }
}

/// The append-only primitive record store: `next_id` tracks the
/// allocated identifier space, `horizon` tracks the id up to which
/// every dependent index has been durably checkpointed.
pub struct PrimitiveStore {
    dir: PathBuf,
    pool: Arc<TilePool>,
    tile_size: usize,
    partitions: Vec<Option<Partition>>,
    next_id: MarkerFile,
    horizon: MarkerFile,
    sabotage: Option<Arc<Sabotage>>,
}

impl PrimitiveStore {
    pub fn open(dir: impl AsRef<Path>, pool: Arc<TilePool>, tile_size: usize) -> Result<Self> {
        Self::open_with_sabotage(dir, pool, tile_size, None)
    }

    /// Same as [`PrimitiveStore::open`], but threading an explicit
    /// fault-injection handle (spec.md §6's countdown:errno env var)
    /// into every partition's backup log.
    pub fn open_with_sabotage(
        dir: impl AsRef<Path>,
        pool: Arc<TilePool>,
        tile_size: usize,
        sabotage: Option<Arc<Sabotage>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let next_id = MarkerFile::open(dir.join("next"), *MAGIC_PRIMITIVE_MARKER_NEXT, 0)?;
        let horizon = MarkerFile::open(dir.join("horizon"), *MAGIC_PRIMITIVE_MARKER_HORIZON, 0)?;
        let partition_count = if next_id.value() == 0 {
            0
        } else {
            (next_id.value() - 1) / SLOTS_PER_PARTITION + 1
        };
        let mut partitions = Vec::new();
        partitions.resize_with(partition_count as usize, || None);
        Ok(Self { dir, pool, tile_size, partitions, next_id, horizon, sabotage })
    }

    fn partition_path(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("g-{idx:02}.addb"))
    }

    fn partition_mut(&mut self, idx: usize, writable: bool) -> Result<&Partition> {
        if idx >= self.partitions.len() {
            self.partitions.resize_with(idx + 1, || None);
        }
        if self.partitions[idx].is_none() {
            let path = self.partition_path(idx);
            let log_horizon = self.horizon.value();
            self.partitions[idx] = Some(Partition::open(
                self.pool.clone(),
                path,
                self.tile_size,
                writable,
                log_horizon,
                self.sabotage.clone(),
            )?);
        }
        Ok(self.partitions[idx].as_ref().unwrap())
    }

    /// Appends `data`, zero-padded to an 8-byte boundary, returning
    /// the newly-allocated identifier.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let id = self.next_id.value();
        if id > MAX_ID {
            return Err(StoreError::database("primitive store identifier space exhausted"));
        }
        let partition_idx = (id / SLOTS_PER_PARTITION) as usize;
        let local_id = id % SLOTS_PER_PARTITION;
        let tile_size = self.tile_size as u64;

        let padded_len = round_up(data.len() as u64, 8);
        let mut padded = vec![0u8; padded_len as usize];
        padded[..data.len()].copy_from_slice(data);

        let partition = self.partition_mut(partition_idx, true)?;
        let start = partition.record_start(local_id, tile_size)?;
        let end = start + padded_len;
        partition.write_spanning(start, &padded, tile_size)?;
        partition.write_end_offset(local_id, end, tile_size)?;

        self.next_id.set(id + 1)?;
        debug!(id, bytes = data.len(), "primitive appended");
        Ok(id)
    }

    /// Reads back the record for `id`, trimmed to its logical length
    /// (the stored record is zero-padded to 8 bytes, so the caller
    /// gets back exactly `end - start` bytes, padding included; a
    /// higher layer carrying an explicit length trims further).
    pub fn read(&mut self, id: u64) -> Result<Vec<u8>> {
        if id >= self.next_id.value() {
            return Err(StoreError::NotFound(format!("primitive id {id}")));
        }
        let partition_idx = (id / SLOTS_PER_PARTITION) as usize;
        let local_id = id % SLOTS_PER_PARTITION;
        let tile_size = self.tile_size as u64;
        let partition = self.partition_mut(partition_idx, false)?;
        let start = partition.record_start(local_id, tile_size)?;
        let end = partition.read_end_offset(local_id, tile_size)?;
        partition.read_spanning(start, (end - start) as usize, tile_size)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.value()
    }

    pub fn horizon(&self) -> u64 {
        self.horizon.value()
    }

    /// Every open partition's tiled file, for the checkpoint engine to
    /// gather across the whole store.
    pub fn tiled_files(&self) -> Vec<TiledFile> {
        self.partitions.iter().flatten().map(|p| p.file.clone()).collect()
    }

    /// Called by the database layer once every dependent index has
    /// been checkpointed past `id`.
    pub fn advance_horizon(&mut self, id: u64) -> Result<()> {
        debug_assert!(id <= self.next_id.value());
        self.horizon.set(id)
    }

    /// Tells a reader process that the writer has grown the id space;
    /// stretches the last known partition and opens any new ones
    /// read-only.
    pub fn refresh(&mut self) -> Result<()> {
        self.next_id = MarkerFile::open(self.dir.join("next"), *MAGIC_PRIMITIVE_MARKER_NEXT, 0)?;
        if let Some(last) = self.partitions.iter().flatten().last() {
            last.file.stretch()?;
        }
        let needed = if self.next_id.value() == 0 {
            0
        } else {
            (self.next_id.value() - 1) / SLOTS_PER_PARTITION + 1
        };
        if needed as usize > self.partitions.len() {
            self.partitions.resize_with(needed as usize, || None);
        }
        Ok(())
    }
}
