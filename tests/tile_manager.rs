//! Exercises the tile manager's pool-level contracts directly: reference
//! accounting, eviction's refusal to reclaim dirty/scheduled tiles, and
//! copy-on-write isolation between a checkpoint's snapshot and concurrent
//! writes.

use std::sync::Arc;

use gdb_store::common::{default_tile_size, MAGIC_INDEX_PARTITION};
use gdb_store::tile::{AccessMode, TilePool, TiledFile};

fn open(pool: Arc<TilePool>, dir: &std::path::Path, name: &str) -> TiledFile {
    TiledFile::open(pool, dir.join(name), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap()
}

/// Balanced `get`/`free` pairs, whether served from a materialized tile
/// or from the initial mapping, must leave the pool's linked-byte total
/// at zero.
#[test]
fn reference_accounting_balances_after_get_free_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    let file = open(pool.clone(), dir.path(), "f.addb");

    for i in 0..20u64 {
        let off = i * 64;
        let (_, r) = file.alloc(off, off + 8).unwrap();
        file.put(off, &r, &[7u8; 8]).unwrap();
        file.free(r);
    }
    assert_eq!(pool.linked(), 0, "every alloc/free pair must be balanced");

    // A read-only reopen exercises the initial-mapping borrow path,
    // which has its own, separate accounting (`InitMap { size }`).
    drop(file);
    let ro_pool = Arc::new(TilePool::new(1 << 24));
    let ro_file = TiledFile::open(ro_pool.clone(), dir.path().join("f.addb"), MAGIC_INDEX_PARTITION, default_tile_size(), false).unwrap();
    for i in 0..20u64 {
        let off = i * 64;
        let (bytes, r) = ro_file.get(off, off + 8, AccessMode::Read).unwrap();
        assert_eq!(bytes, vec![7u8; 8]);
        ro_file.free(r);
    }
    assert_eq!(ro_pool.linked(), 0, "init-map borrows must also balance");
}

/// `link` duplicates a reference's accounting along with its refcount:
/// the tile must survive until both the original and the duplicate are
/// freed, and the pool's linked total must return to zero only once both
/// are released.
#[test]
fn link_duplicates_accounting_not_just_refcount() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    let file = open(pool.clone(), dir.path(), "f.addb");

    let (_, r) = file.alloc(0, 8).unwrap();
    let linked_before = pool.linked();
    let dup = file.link(r);
    assert!(pool.linked() > linked_before, "link must account for the duplicate reference");

    file.free(dup);
    assert!(pool.linked() > 0, "original reference is still outstanding");
    file.free(r);
    assert_eq!(pool.linked(), 0);
}

/// A tile with outstanding dirty bits must never be handed back to the
/// pool's LRU free list, even under heavy eviction pressure from a tiny
/// soft cap.
#[test]
fn eviction_never_reclaims_a_dirty_tile() {
    let dir = tempfile::tempdir().unwrap();
    let tile_size = default_tile_size() as u64;
    // Cap the pool at one tile's worth so every additional tile touched
    // forces the evictor to run.
    let pool = Arc::new(TilePool::new(tile_size));
    let file = open(pool.clone(), dir.path(), "f.addb");

    // Dirty tile 0 and drop its reference so it would be evictable if
    // dirtiness weren't blocking it.
    let (_, r0) = file.alloc(16, 24).unwrap();
    file.put(16, &r0, b"dirty!!!").unwrap();
    file.free(r0);

    // Touch many more tiles, well past the one-tile cap, to drive the
    // evictor repeatedly.
    for i in 1..32u64 {
        let off = i * tile_size + 16;
        let (_, r) = file.get(off, off + 8, AccessMode::Read).unwrap();
        file.free(r);
    }

    // Tile 0's dirty bytes must still read back correctly: it was never
    // evicted and reset to the on-disk (pre-write) content.
    let (bytes, r) = file.get(16, 24, AccessMode::Read).unwrap();
    file.free(r);
    assert_eq!(&bytes, b"dirty!!!");
}

/// After checkpoint phase 1 (`snapshot_dirty_into_scheduled`), a write
/// that lands in the same tile must mutate the live `memory` buffer
/// without perturbing the frozen scheduled snapshot that phase 3 will
/// flush to disk.
#[test]
fn cow_isolation_between_scheduled_snapshot_and_new_writes() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    let file = open(pool, dir.path(), "f.addb");

    let (_, r) = file.alloc(16, 24).unwrap();
    file.put(16, &r, b"v1......").unwrap();
    file.free(r);

    // Phase 1: snapshot the dirty tile. The mapping now reflects "v1"
    // (start_writes hasn't run), and the tile is clean again until the
    // next write.
    file.snapshot_dirty_into_scheduled().unwrap();

    // A write to a *different* offset in the same tile re-dirties it
    // without disturbing the scheduled snapshot already captured.
    let (_, r2) = file.alloc(32, 40).unwrap();
    file.put(32, &r2, b"v2......").unwrap();
    file.free(r2);
    assert!(file.is_dirty(), "the new write must re-dirty the tile");

    // Flushing scheduled + dirty buffers back to the mapping must
    // preserve both the earlier snapshot's bytes and the new write's
    // bytes; neither should have clobbered the other.
    file.snapshot_dirty_into_scheduled().unwrap();
    file.fsync_mapping().unwrap();
    file.remove_backup_log().unwrap();

    let (first, r1) = file.get(16, 24, AccessMode::Read).unwrap();
    file.free(r1);
    let (second, r2) = file.get(32, 40, AccessMode::Read).unwrap();
    file.free(r2);
    assert_eq!(&first, b"v1......");
    assert_eq!(&second, b"v2......");
}

/// `peek` only ever returns a borrow into the initial mapping: once any
/// tile has been materialized for that slot, `peek` must refuse (a
/// materialized tile may carry a newer, dirty version of those bytes).
#[test]
fn peek_refuses_once_a_tile_is_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(TilePool::new(1 << 24));
    {
        let file = open(pool.clone(), dir.path(), "f.addb");
        let (_, r) = file.alloc(16, 24).unwrap();
        file.put(16, &r, b"initial!").unwrap();
        file.free(r);
        file.snapshot_dirty_into_scheduled().unwrap();
        file.fsync_mapping().unwrap();
        file.remove_backup_log().unwrap();
    }

    let file = TiledFile::open(pool, dir.path().join("f.addb"), MAGIC_INDEX_PARTITION, default_tile_size(), true).unwrap();
    assert_eq!(file.peek(16, 8).as_deref(), Some(&b"initial!"[..]));

    // Materializing the tile with a write must shadow the init-map peek.
    let (_, r) = file.alloc(16, 24).unwrap();
    file.put(16, &r, b"changed!").unwrap();
    file.free(r);
    assert!(file.peek(16, 8).is_none(), "peek must not read through a materialized tile");
}
