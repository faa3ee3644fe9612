//! Bitmap files: a dense alternative backing for a source whose target
//! set is better represented as a bit vector than a sorted list.
//!
//! Laid out like [`crate::large_array::LargeArrayFile`] (tiled,
//! append-growable, its own magic) but the payload is a flat bit
//! vector addressed qword-at-a-time rather than a list of 5-byte
//! entries. `trailing_zeros`/`leading_zeros` stand in for the
//! original engine's precomputed per-qword MSB/LSB lookup table —
//! the compiler lowers both to a single `bsf`/`bsr` instruction, so
//! there's nothing a table buys here that the builtin doesn't already
//! give for free.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::MAGIC_BITMAP;
use crate::error::Result;
use crate::tile::{AccessMode, TilePool, TiledFile};

const HEADER_LEN: u64 = 16; // magic(4) + bit_count(8) + reserved(4)
const QWORD_BYTES: u64 = 8;
const QWORD_BITS: u64 = 64;

pub struct Bitmap {
    file: TiledFile,
    tile_size: u64,
    /// One past the highest bit index ever touched; not a count of
    /// set bits. Used to size scans and to decide when to grow.
    bit_count: u64,
}

impl Bitmap {
    pub fn path_for(dir: &Path, source_id: u64) -> PathBuf {
        dir.join(format!("{source_id}.bgm"))
    }

    pub fn create(pool: Arc<TilePool>, dir: impl AsRef<Path>, source_id: u64, tile_size: usize) -> Result<Self> {
        let path = Self::path_for(dir.as_ref(), source_id);
        let file = TiledFile::open(pool, &path, MAGIC_BITMAP, tile_size, true)?;
        let (_, r) = file.alloc(4, 12)?;
        file.put(4, &r, &0u64.to_be_bytes())?;
        file.free(r);
        Ok(Self { file, tile_size: tile_size as u64, bit_count: 0 })
    }

    pub fn open(pool: Arc<TilePool>, dir: impl AsRef<Path>, source_id: u64, tile_size: usize, writable: bool) -> Result<Self> {
        let path = Self::path_for(dir.as_ref(), source_id);
        let file = TiledFile::open(pool, &path, MAGIC_BITMAP, tile_size, writable)?;
        let (bytes, r) = file.get(4, 12, AccessMode::Read)?;
        file.free(r);
        let bit_count = u64::from_be_bytes(bytes.try_into().unwrap());
        Ok(Self { file, tile_size: tile_size as u64, bit_count })
    }

    fn qword_offset(qword_idx: u64) -> u64 {
        HEADER_LEN + qword_idx * QWORD_BYTES
    }

    fn read_qword(&self, qword_idx: u64) -> Result<u64> {
        let off = Self::qword_offset(qword_idx);
        if off + QWORD_BYTES > self.file.physical_size() {
            return Ok(0);
        }
        let (bytes, r) = self.file.get(off, off + QWORD_BYTES, AccessMode::Read)?;
        self.file.free(r);
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn write_qword(&mut self, qword_idx: u64, word: u64) -> Result<()> {
        let off = Self::qword_offset(qword_idx);
        let (_, r) = self.file.alloc(off, off + QWORD_BYTES)?;
        self.file.put(off, &r, &word.to_be_bytes())?;
        self.file.free(r);
        Ok(())
    }

    fn bump_bit_count(&mut self, touched: u64) -> Result<()> {
        if touched >= self.bit_count {
            self.bit_count = touched + 1;
            let (_, r) = self.file.alloc(4, 12)?;
            self.file.put(4, &r, &self.bit_count.to_be_bytes())?;
            self.file.free(r);
        }
        Ok(())
    }

    /// Sets the bit at `bit_idx`, growing the backing file if needed.
    pub fn set(&mut self, bit_idx: u64) -> Result<()> {
        let qword_idx = bit_idx / QWORD_BITS;
        let bit_in_word = bit_idx % QWORD_BITS;
        let word = self.read_qword(qword_idx)? | (1u64 << bit_in_word);
        self.write_qword(qword_idx, word)?;
        self.bump_bit_count(bit_idx)
    }

    /// `true` iff the bit at `bit_idx` is set; bits beyond the current
    /// high-water mark are implicitly unset.
    pub fn check(&self, bit_idx: u64) -> Result<bool> {
        if bit_idx >= self.bit_count {
            return Ok(false);
        }
        let qword_idx = bit_idx / QWORD_BITS;
        let bit_in_word = bit_idx % QWORD_BITS;
        Ok(self.read_qword(qword_idx)? & (1u64 << bit_in_word) != 0)
    }

    /// Smallest set bit at or after `from`, if any.
    pub fn scan_forward(&self, from: u64) -> Result<Option<u64>> {
        if from >= self.bit_count {
            return Ok(None);
        }
        let last_qword = (self.bit_count - 1) / QWORD_BITS;
        let mut qword_idx = from / QWORD_BITS;
        let mut mask_from_bit = from % QWORD_BITS;
        while qword_idx <= last_qword {
            let mut word = self.read_qword(qword_idx)?;
            if mask_from_bit > 0 {
                word &= !0u64 << mask_from_bit;
            }
            if word != 0 {
                let bit = word.trailing_zeros() as u64;
                return Ok(Some(qword_idx * QWORD_BITS + bit));
            }
            qword_idx += 1;
            mask_from_bit = 0;
        }
        Ok(None)
    }

    /// Largest set bit at or before `from`, if any.
    pub fn scan_backward(&self, from: u64) -> Result<Option<u64>> {
        if self.bit_count == 0 {
            return Ok(None);
        }
        let from = from.min(self.bit_count - 1);
        let mut qword_idx = from / QWORD_BITS;
        let mask_to_bit = from % QWORD_BITS;
        loop {
            let mut word = self.read_qword(qword_idx)?;
            if qword_idx == from / QWORD_BITS && mask_to_bit < QWORD_BITS - 1 {
                word &= (1u64 << (mask_to_bit + 1)) - 1;
            }
            if word != 0 {
                let bit = QWORD_BITS - 1 - word.leading_zeros() as u64;
                return Ok(Some(qword_idx * QWORD_BITS + bit));
            }
            if qword_idx == 0 {
                return Ok(None);
            }
            qword_idx -= 1;
        }
    }

    /// Every set bit in ascending order. Used by the index layer to
    /// materialize a bitmap-backed source's target list.
    pub fn read_all(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        while let Some(bit) = self.scan_forward(cursor)? {
            out.push(bit);
            cursor = bit + 1;
        }
        Ok(out)
    }

    pub fn is_dirty(&self) -> bool {
        self.file.is_dirty()
    }

    /// Checkpoint participation mirroring
    /// [`crate::large_array::LargeArrayFile`]'s simplified two-phase
    /// handling (see its doc comment): flush the heap-dirty buffer
    /// into the mapping, then fsync and drop the scheduled snapshot.
    pub fn linear_start(&self) -> Result<()> {
        self.file.snapshot_dirty_into_scheduled()
    }

    pub fn linear_finish(&self) -> Result<()> {
        self.file.fsync_mapping()?;
        self.file.remove_backup_log()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bitmap() -> (tempfile::TempDir, Bitmap) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(TilePool::new(1 << 20));
        let bm = Bitmap::create(pool, dir.path(), 1, crate::common::default_tile_size()).unwrap();
        (dir, bm)
    }

    #[test]
    fn set_and_check_round_trip() {
        let (_dir, mut bm) = new_bitmap();
        bm.set(3).unwrap();
        bm.set(130).unwrap();
        assert!(bm.check(3).unwrap());
        assert!(bm.check(130).unwrap());
        assert!(!bm.check(4).unwrap());
        assert!(!bm.check(5000).unwrap());
    }

    #[test]
    fn scan_forward_and_backward_find_set_bits() {
        let (_dir, mut bm) = new_bitmap();
        for b in [5u64, 64, 65, 200] {
            bm.set(b).unwrap();
        }
        assert_eq!(bm.scan_forward(0).unwrap(), Some(5));
        assert_eq!(bm.scan_forward(6).unwrap(), Some(64));
        assert_eq!(bm.scan_forward(66).unwrap(), Some(200));
        assert_eq!(bm.scan_forward(201).unwrap(), None);

        assert_eq!(bm.scan_backward(300).unwrap(), Some(200));
        assert_eq!(bm.scan_backward(199).unwrap(), Some(65));
        assert_eq!(bm.scan_backward(4).unwrap(), None);
    }

    #[test]
    fn read_all_matches_every_set_bit() {
        let (_dir, mut bm) = new_bitmap();
        let bits = [1u64, 2, 64, 1000, 1001, 4095];
        for b in bits {
            bm.set(b).unwrap();
        }
        assert_eq!(bm.read_all().unwrap(), bits.to_vec());
    }

    #[test]
    fn reopen_preserves_bits_after_checkpoint() {
        // Like every tiled file, a bitmap's writes live in a heap COW
        // buffer until its checkpoint participation
        // (`linear_start`/`linear_finish`) flushes them into the
        // mapping; reopening without running that first must not see
        // them.
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(TilePool::new(1 << 20));
        {
            let mut bm = Bitmap::create(pool.clone(), dir.path(), 9, crate::common::default_tile_size()).unwrap();
            bm.set(42).unwrap();
            bm.set(900).unwrap();
            bm.linear_start().unwrap();
            bm.linear_finish().unwrap();
        }
        let bm = Bitmap::open(pool, dir.path(), 9, crate::common::default_tile_size(), false).unwrap();
        assert!(bm.check(42).unwrap());
        assert!(bm.check(900).unwrap());
    }
}
