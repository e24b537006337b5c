//! Benchmark: best-fit acquire and coalescing release on a fragmented map.
//!
//! The map is seeded with many small holes of varying size so that both the
//! length index and the neighbour lookups have real work to do.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use dbuf_alloc::FreeSpaceMap;
use dbuf_types::ByteOffset;

/// 4096 allocations of 64..=640 bytes with every third one released.
fn make_fragmented() -> (FreeSpaceMap, Vec<(ByteOffset, u64)>) {
    let mut map = FreeSpaceMap::new();
    let mut live = Vec::new();
    for i in 0..4096_u64 {
        let size = 64 + (i * 37) % 577;
        let off = map.acquire(size).expect("acquire");
        live.push((off, size));
    }
    let mut kept = Vec::new();
    for (i, (off, size)) in live.into_iter().enumerate() {
        if i % 3 == 0 {
            map.release(off, size).expect("release");
        } else {
            kept.push((off, size));
        }
    }
    (map, kept)
}

fn bench_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire");

    group.bench_function("best_fit_reuse", |b| {
        b.iter_batched(
            || make_fragmented().0,
            |mut map| {
                for size in [64_u64, 128, 256, 512] {
                    black_box(map.acquire(black_box(size)).expect("acquire"));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_growth", |b| {
        b.iter_batched(
            FreeSpaceMap::new,
            |mut map| {
                for _ in 0..64 {
                    black_box(map.acquire(black_box(4096)).expect("acquire"));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_release(c: &mut Criterion) {
    c.bench_function("release_coalescing", |b| {
        b.iter_batched(
            make_fragmented,
            |(mut map, kept)| {
                for &(off, size) in kept.iter().take(256) {
                    map.release(off, size).expect("release");
                }
                black_box(map.block_count());
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_defragment(c: &mut Criterion) {
    let (map, _) = make_fragmented();
    c.bench_function("defragment_sweep", |b| {
        b.iter_batched(
            || map.clone(),
            |mut map| black_box(map.defragment()),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_acquire, bench_release, bench_defragment);
criterion_main!(benches);
