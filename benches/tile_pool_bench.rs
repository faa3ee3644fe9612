// Tile Pool Performance Benchmarks
// Exercises tile materialization, linked/unlinked reference accounting,
// and LRU eviction pressure under the process-wide tile pool.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gdb_store::tile::{AccessMode, TilePool, TiledFile};
use std::sync::Arc;
use tempfile::TempDir;

fn create_file(pool: Arc<TilePool>, tile_size: usize) -> (TiledFile, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bench.dat");
    let file = TiledFile::open(pool, &path, b"bnch", tile_size, true).unwrap();
    (file, temp_dir)
}

fn bench_sequential_get_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_get_put");
    let tile_size = gdb_store::common::default_tile_size();

    for tiles in [4usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("tiles", tiles), &tiles, |b, &tiles| {
            let pool = Arc::new(TilePool::new((tile_size * 8) as u64));
            let (file, _temp) = create_file(pool, tile_size);

            b.iter(|| {
                for i in 0..tiles {
                    let offset = (i * tile_size) as u64;
                    let (_, r) = file.alloc(offset, offset + 8).unwrap();
                    file.put(offset, &r, &[1u8; 8]).unwrap();
                    file.free(r);
                    black_box(&file);
                }
            });
        });
    }

    group.finish();
}

fn bench_eviction_pressure(c: &mut Criterion) {
    let tile_size = gdb_store::common::default_tile_size();

    c.bench_function("eviction_pressure", |b| {
        // A pool capped at 4 tiles forces eviction once more than 4
        // distinct tiles are touched in a pass.
        let pool = Arc::new(TilePool::new((tile_size * 4) as u64));
        let (file, _temp) = create_file(pool, tile_size);

        b.iter(|| {
            for i in 0..64u64 {
                let offset = i * tile_size as u64;
                let (bytes, r) = file.get(offset, offset + 8, AccessMode::Read).unwrap();
                black_box(&bytes);
                file.free(r);
            }
        });
    });
}

fn bench_linked_unlinked_accounting(c: &mut Criterion) {
    let tile_size = gdb_store::common::default_tile_size();
    let pool = Arc::new(TilePool::new((tile_size * 16) as u64));
    let (file, _temp) = create_file(pool, tile_size);

    c.bench_function("link_unlink_cycle", |b| {
        b.iter(|| {
            let (_, r) = file.alloc(0, 64).unwrap();
            let linked = file.link(r);
            black_box(&linked);
            file.free(linked);
            file.free(r);
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_get_put,
    bench_eviction_pressure,
    bench_linked_unlinked_accounting
);
criterion_main!(benches);
