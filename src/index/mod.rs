//! Source→list index: a sorted-set multimap from one 34-bit identifier
//! to an ordered list of 34-bit target identifiers, backed by the
//! tiled file manager.

pub mod partition;
pub mod sentinel;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::common::{MAGIC_INDEX_MARKER_HORIZON, DEFAULT_LARGE_FILE_SOFT_LIMIT, MAX_MULTI_EXP, SLOTS_PER_PARTITION};
use crate::error::{Result, StoreError};
use crate::large_array::LargeArrayCache;
use crate::marker::MarkerFile;
use crate::sabotage::Sabotage;
use crate::tile::{TiledFile, TilePool};

use partition::IndexPartition;
use sentinel::{AppendOutcome, SLOT_BITMAP, SLOT_EMPTY, SLOT_LARGE, SLOT_MULTI, SLOT_SINGLETON};

/// What to do when `add` sees a value that is not strictly greater
/// than the current maximum for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Return `Ok(())` without mutating anything.
    Ignore,
    /// Return `StoreError::Exists`.
    Reject,
}

pub struct SourceListIndex {
    dir: PathBuf,
    pool: Arc<TilePool>,
    tile_size: usize,
    partitions: Vec<Option<IndexPartition>>,
    /// Overflow backing for sources whose multi-array outgrew the
    /// largest inline size class. Keyed by the global (not
    /// per-partition) source id, which is already a unique 34-bit
    /// value and doubles as the large-array/bitmap file stem.
    large: LargeArrayCache,
    bitmap_dir: PathBuf,
    bitmaps: HashMap<u64, Bitmap>,
    /// Id up to which this index has been durably checkpointed;
    /// supplies `caller_horizon` when replaying a partition's backup
    /// log at open time.
    horizon: MarkerFile,
    sabotage: Option<Arc<Sabotage>>,
}

impl SourceListIndex {
    pub fn open(dir: impl AsRef<Path>, pool: Arc<TilePool>, tile_size: usize) -> Result<Self> {
        Self::open_with_sabotage(dir, pool, tile_size, None)
    }

    /// Same as [`SourceListIndex::open`], but threading an explicit
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
        let large_dir = dir.join("large");
        std::fs::create_dir_all(&large_dir)?;
        let bitmap_dir = dir.join("bgmap");
        std::fs::create_dir_all(&bitmap_dir)?;
        let large = LargeArrayCache::new(large_dir, pool.clone(), tile_size, DEFAULT_LARGE_FILE_SOFT_LIMIT);
        let horizon = MarkerFile::open(dir.join("horizon"), *MAGIC_INDEX_MARKER_HORIZON, 0)?;
        Ok(Self { dir, pool, tile_size, partitions: Vec::new(), large, bitmap_dir, bitmaps: HashMap::new(), horizon, sabotage })
    }

    fn partition_path(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("i-{idx:02}.addb"))
    }

    fn partition_mut(&mut self, idx: usize, writable: bool) -> Result<&IndexPartition> {
        if idx >= self.partitions.len() {
            self.partitions.resize_with(idx + 1, || None);
        }
        if self.partitions[idx].is_none() {
            let path = self.partition_path(idx);
            let log_horizon = self.horizon.value();
            self.partitions[idx] = Some(IndexPartition::open(
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

    pub fn horizon(&self) -> u64 {
        self.horizon.value()
    }

    /// Called by the database layer once this index has been
    /// checkpointed past `id`.
    pub fn advance_horizon(&mut self, id: u64) -> Result<()> {
        self.horizon.set(id)
    }

    /// Every open partition's tiled file, for the checkpoint engine to
    /// gather across the whole index.
    pub fn tiled_files(&self) -> Vec<TiledFile> {
        self.partitions.iter().flatten().map(|p| p.tiled_file()).collect()
    }

    /// Deletes every large-array overflow file left at zero logical
    /// length, per the `lf_delete_count` open-question decision: such
    /// a file can only be the tail end of a conversion interrupted
    /// before it appended anything, so nothing in this index yet
    /// references it. Returns the pruned ids.
    pub fn prune_empty_large_arrays(&mut self) -> Result<Vec<u64>> {
        let mut pruned = Vec::new();
        for id in self.large.list_ids()? {
            let len = self.large.get_mut(id, false)?.len();
            if len == 0 {
                self.large.delete(id)?;
                pruned.push(id);
            }
        }
        Ok(pruned)
    }

    /// Runs the simplified two-phase checkpoint participation (§4.7)
    /// for every dirty large-array or bitmap overflow file currently
    /// open, outside the six-phase group-commit protocol that covers
    /// the partition files themselves.
    pub fn checkpoint_overflow(&mut self) -> Result<()> {
        self.large.checkpoint_dirty()?;
        for bm in self.bitmaps.values() {
            if bm.is_dirty() {
                bm.linear_start()?;
            }
        }
        for bm in self.bitmaps.values() {
            if bm.is_dirty() {
                bm.linear_finish()?;
            }
        }
        Ok(())
    }

    fn locate(source: u64) -> (usize, u64) {
        ((source / SLOTS_PER_PARTITION) as usize, source % SLOTS_PER_PARTITION)
    }

    fn bitmap_mut(&mut self, source: u64, create: bool) -> Result<&mut Bitmap> {
        if !self.bitmaps.contains_key(&source) {
            let bm = if create {
                Bitmap::create(self.pool.clone(), &self.bitmap_dir, source, self.tile_size)?
            } else {
                Bitmap::open(self.pool.clone(), &self.bitmap_dir, source, self.tile_size, true)?
            };
            self.bitmaps.insert(source, bm);
        }
        Ok(self.bitmaps.get_mut(&source).unwrap())
    }

    /// Inserts `target` into `source`'s sorted set. `target` must be
    /// strictly greater than every element already present; violating
    /// that is either a fatal `Database` error or a silent no-op,
    /// selected by `on_dup`.
    pub fn add(&mut self, source: u64, target: u64, on_dup: OnDuplicate) -> Result<()> {
        let (pidx, local) = Self::locate(source);
        let slot = self.partition_mut(pidx, true)?.read_slot(local)?;
        let (tag, payload) = sentinel::unpack_tagged(slot);

        match tag {
            SLOT_EMPTY => {
                self.partition_mut(pidx, true)?
                    .write_slot(local, sentinel::pack_tagged(SLOT_SINGLETON, target))?;
                Ok(())
            }
            SLOT_SINGLETON => {
                let existing = payload;
                if target == existing {
                    return Self::handle_duplicate(on_dup);
                }
                if target < existing {
                    return Self::handle_out_of_order(on_dup);
                }
                let partition = self.partition_mut(pidx, true)?;
                let exp = 1u32;
                let units = partition.alloc_block(exp)?;
                sentinel::init_with_first_element(partition, units, exp, existing)?;
                match sentinel::append(partition, units, exp, target)? {
                    AppendOutcome::Done => {}
                    AppendOutcome::Full => unreachable!("freshly allocated 2-slot array cannot already be full"),
                }
                partition.write_slot(local, sentinel::pack_tagged(SLOT_MULTI, sentinel::pack_multi_slot(exp, units)))?;
                Ok(())
            }
            SLOT_MULTI => {
                let (exp, units) = sentinel::unpack_multi_slot(payload);
                let partition = self.partition_mut(pidx, true)?;
                if let Some(last) = sentinel::last_element(partition, units, exp)? {
                    if target == last {
                        return Self::handle_duplicate(on_dup);
                    }
                    if target < last {
                        return Self::handle_out_of_order(on_dup);
                    }
                }
                match sentinel::append(partition, units, exp, target)? {
                    AppendOutcome::Done => Ok(()),
                    AppendOutcome::Full if exp >= MAX_MULTI_EXP => {
                        self.convert_multi_to_large(pidx, local, units, exp, target)
                    }
                    AppendOutcome::Full => {
                        let partition = self.partition_mut(pidx, true)?;
                        let (new_units, new_exp) = sentinel::grow(partition, units, exp)?;
                        let outcome = sentinel::append(partition, new_units, new_exp, target)?;
                        debug_assert_eq!(outcome, AppendOutcome::Done);
                        partition.write_slot(
                            local,
                            sentinel::pack_tagged(SLOT_MULTI, sentinel::pack_multi_slot(new_exp, new_units)),
                        )?;
                        Ok(())
                    }
                }
            }
            SLOT_LARGE => {
                let large = self.large.get_mut(source, true)?;
                if let Some(last) = large.read_all()?.last().copied() {
                    if target == last {
                        return Self::handle_duplicate(on_dup);
                    }
                    if target < last {
                        return Self::handle_out_of_order(on_dup);
                    }
                }
                large.append(target)?;
                let count = large.len();
                self.partition_mut(pidx, true)?
                    .write_slot(local, sentinel::pack_tagged(SLOT_LARGE, count))?;
                Ok(())
            }
            SLOT_BITMAP => {
                if self.bitmap_mut(source, false)?.check(target)? {
                    return Self::handle_duplicate(on_dup);
                }
                self.bitmap_mut(source, false)?.set(target)
            }
            other => Err(StoreError::database(format!("corrupt slot tag {other}"))),
        }
    }

    /// A full multi array at the largest size class has no further
    /// size class to grow into (spec.md §4.6: "a full multi at the
    /// maximum size may be converted ... to a bitmap or a large-array
    /// backing"); this crate's policy picks the large-array backing
    /// automatically, and leaves the bitmap conversion to an explicit
    /// call to [`SourceListIndex::convert_to_bitmap`].
    fn convert_multi_to_large(&mut self, pidx: usize, local: u64, units: u64, exp: u32, target: u64) -> Result<()> {
        let source = pidx as u64 * SLOTS_PER_PARTITION + local;
        let elements = {
            let partition = self.partition_mut(pidx, true)?;
            let elements = sentinel::read_all(partition, units, exp)?;
            partition.free_block(exp, units)?;
            elements
        };
        let large = self.large.create(source)?;
        for e in &elements {
            large.append(*e)?;
        }
        large.append(target)?;
        let count = large.len();
        self.partition_mut(pidx, true)?
            .write_slot(local, sentinel::pack_tagged(SLOT_LARGE, count))?;
        Ok(())
    }

    /// External-policy conversion of a source's target set to a dense
    /// bitmap backing, for callers (e.g. the database layer) that know
    /// the set is dense enough that a bit vector beats a sorted list.
    pub fn convert_to_bitmap(&mut self, source: u64) -> Result<()> {
        let (pidx, local) = Self::locate(source);
        let slot = self.partition_mut(pidx, true)?.read_slot(local)?;
        let (tag, payload) = sentinel::unpack_tagged(slot);
        let elements = match tag {
            SLOT_EMPTY => Vec::new(),
            SLOT_SINGLETON => vec![payload],
            SLOT_MULTI => {
                let (exp, units) = sentinel::unpack_multi_slot(payload);
                let partition = self.partition_mut(pidx, true)?;
                let elements = sentinel::read_all(partition, units, exp)?;
                partition.free_block(exp, units)?;
                elements
            }
            SLOT_LARGE => {
                let elements = self.large.get_mut(source, true)?.read_all()?;
                self.large.delete(source)?;
                elements
            }
            SLOT_BITMAP => return Ok(()), // already a bitmap
            other => return Err(StoreError::database(format!("corrupt slot tag {other}"))),
        };
        {
            let bm = self.bitmap_mut(source, true)?;
            for e in elements {
                bm.set(e)?;
            }
        }
        self.partition_mut(pidx, true)?
            .write_slot(local, sentinel::pack_tagged(SLOT_BITMAP, 0))
    }

    fn handle_duplicate(on_dup: OnDuplicate) -> Result<()> {
        match on_dup {
            OnDuplicate::Ignore => Ok(()),
            OnDuplicate::Reject => Err(StoreError::Exists("target already present".into())),
        }
    }

    fn handle_out_of_order(on_dup: OnDuplicate) -> Result<()> {
        match on_dup {
            OnDuplicate::Ignore => Ok(()),
            OnDuplicate::Reject => Err(StoreError::database("target out of order: sorted-set invariant violated")),
        }
    }

    /// Every target currently stored for `source`, in ascending
    /// order (or descending, if `forward` is false).
    pub fn targets(&mut self, source: u64, forward: bool) -> Result<Vec<u64>> {
        let (pidx, local) = Self::locate(source);
        let partition = self.partition_mut(pidx, false)?;
        let slot = partition.read_slot(local)?;
        let (tag, payload) = sentinel::unpack_tagged(slot);
        let mut values = match tag {
            SLOT_EMPTY => Vec::new(),
            SLOT_SINGLETON => vec![payload],
            SLOT_MULTI => {
                let (exp, units) = sentinel::unpack_multi_slot(payload);
                sentinel::read_all(partition, units, exp)?
            }
            SLOT_LARGE => self.large.get_mut(source, false)?.read_all()?,
            SLOT_BITMAP => self.bitmap_mut(source, false)?.read_all()?,
            other => return Err(StoreError::database(format!("corrupt slot tag {other}"))),
        };
        if !forward {
            values.reverse();
        }
        Ok(values)
    }

    /// Count of targets stored for `source`.
    pub fn n(&mut self, source: u64) -> Result<u64> {
        let (pidx, local) = Self::locate(source);
        let partition = self.partition_mut(pidx, false)?;
        let slot = partition.read_slot(local)?;
        let (tag, payload) = sentinel::unpack_tagged(slot);
        Ok(match tag {
            SLOT_EMPTY => 0,
            SLOT_SINGLETON => 1,
            SLOT_MULTI => {
                let (exp, units) = sentinel::unpack_multi_slot(payload);
                sentinel::count(partition, units, exp)?
            }
            SLOT_LARGE => self.large.get_mut(source, false)?.len(),
            SLOT_BITMAP => self.bitmap_mut(source, false)?.read_all()?.len() as u64,
            other => return Err(StoreError::database(format!("corrupt slot tag {other}"))),
        })
    }

    /// Position at the smallest target `>= id`, or `None`.
    pub fn find(&mut self, source: u64, id: u64) -> Result<Option<u64>> {
        let values = self.targets(source, true)?;
        Ok(match values.binary_search(&id) {
            Ok(i) => Some(values[i]),
            Err(i) if i < values.len() => Some(values[i]),
            Err(_) => None,
        })
    }

    /// Intersects the target sets of `a` and `b`, capped at `limit`
    /// results. Returns `(results, truncated)`.
    pub fn intersect(&mut self, a: u64, b: u64, limit: usize) -> Result<(Vec<u64>, bool)> {
        let va = self.targets(a, true)?;
        let vb = self.targets(b, true)?;
        Ok(fixed_intersect_sorted(&va, &vb, limit))
    }

    /// Intersects an already-materialized sorted array against
    /// `source`'s target set.
    pub fn fixed_intersect(&mut self, source: u64, fixed: &[u64], limit: usize) -> Result<(Vec<u64>, bool)> {
        let values = self.targets(source, true)?;
        Ok(fixed_intersect_sorted(&values, fixed, limit))
    }
}

/// Recursive sorted-set intersection: pick the middle element of the
/// smaller side, binary-search it in the larger side, recurse left,
/// emit on equality, recurse right. Bounded by `limit`; once hit, the
/// remainder is abandoned and `truncated` is set.
fn fixed_intersect_sorted(a: &[u64], b: &[u64], limit: usize) -> (Vec<u64>, bool) {
    let mut out = Vec::new();
    let mut truncated = false;
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    intersect_rec(small, large, limit, &mut out, &mut truncated);
    out.sort_unstable();
    (out, truncated)
}

fn intersect_rec(small: &[u64], large: &[u64], limit: usize, out: &mut Vec<u64>, truncated: &mut bool) {
    if small.is_empty() || large.is_empty() || *truncated {
        return;
    }
    if out.len() >= limit {
        *truncated = true;
        return;
    }
    let mid = small.len() / 2;
    let pivot = small[mid];
    let pos = large.partition_point(|&x| x < pivot);

    intersect_rec(&small[..mid], &large[..pos], limit, out, truncated);

    if out.len() >= limit {
        *truncated = true;
        return;
    }
    if pos < large.len() && large[pos] == pivot {
        out.push(pivot);
    }

    intersect_rec(&small[mid + 1..], &large[pos..], limit, out, truncated);
}

#[cfg(test)]
impl SourceListIndex {
    /// Test-only hook letting `database.rs`'s rollback test create a
    /// large-array file directly, bypassing the normal conversion path
    /// that always appends at least one element.
    pub fn create_large_for_test(&mut self, id: u64) -> Result<()> {
        self.large.create(id)?;
        Ok(())
    }

    pub fn large_ids_for_test(&self) -> Vec<u64> {
        self.large.list_ids().unwrap_or_default()
    }
}
