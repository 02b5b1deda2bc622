//! # Profiling Benchmark
//!
//! Cost of attributed allocation, snapshots and track serialization.

#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_memory::{AllocatorContext, ChunkLayout, Profiler, Track, UnorderedPool};

fn attributed_pool(profiler: &Arc<Profiler>, name: &str) -> UnorderedPool {
    let id = profiler.create_group(None, name).unwrap();
    let context = AllocatorContext::default().with_group(profiler.handle(id).unwrap());
    UnorderedPool::with_context(ChunkLayout::new(64, 16, 256).unwrap(), context)
}

fn bench_attribution_overhead(c: &mut Criterion) {
    let mut plain = UnorderedPool::new(ChunkLayout::new(64, 16, 256).unwrap());
    c.bench_function("acquire_release_unattributed", |b| {
        b.iter(|| {
            let chunk = plain.acquire().unwrap();
            unsafe { plain.release(black_box(chunk)) };
        });
    });

    let profiler = Arc::new(Profiler::new());
    let mut pool = attributed_pool(&profiler, "bench");
    c.bench_function("acquire_release_attributed", |b| {
        b.iter(|| {
            let chunk = pool.acquire().unwrap();
            unsafe { pool.release(black_box(chunk)) };
        });
    });
}

fn bench_track(c: &mut Criterion) {
    let profiler = Arc::new(Profiler::new());
    let snapshot = profiler.snapshot();
    let mut pool = attributed_pool(&profiler, "track");
    let chunks: Vec<_> = (0..10_000).map(|_| pool.acquire().unwrap()).collect();
    for chunk in chunks {
        unsafe { pool.release(chunk) };
    }

    c.bench_function("snapshot", |b| b.iter(|| black_box(profiler.snapshot())));

    let track = profiler.track_since(&snapshot);
    let mut bytes = Vec::new();
    track.write_to(&mut bytes).unwrap();

    c.bench_function("track_write_20k_events", |b| {
        let mut out = Vec::with_capacity(bytes.len());
        b.iter(|| {
            out.clear();
            track.write_to(&mut out).unwrap();
        });
    });

    c.bench_function("track_read_20k_events", |b| {
        b.iter(|| Track::read_from(&mut bytes.as_slice()).unwrap());
    });

    c.bench_function("track_replay_20k_events", |b| b.iter(|| black_box(track.replay())));
}

criterion_group!(benches, bench_attribution_overhead, bench_track);
criterion_main!(benches);
