//! # Allocator Benchmark
//!
//! Acquire/release throughput of the pools, the stack and the heap, plus
//! interning hit and miss paths.
//!
//! Run with: `cargo bench --package tessera_memory --bench allocator_benchmark`

// Benchmarks don't need docs
#![allow(missing_docs)]
#![allow(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera_memory::{ChunkLayout, HeapAllocator, OrderedPool, StackAllocator, StringInterningPool, UnorderedPool};

const CHUNKS: usize = 10_000;

fn layout() -> ChunkLayout {
    ChunkLayout::new(64, 16, 256).unwrap()
}

fn bench_unordered_pool(c: &mut Criterion) {
    let mut pool = UnorderedPool::new(layout());
    // Warm the pages so the loop measures the free list only.
    let warm: Vec<_> = (0..CHUNKS).map(|_| pool.acquire().unwrap()).collect();
    for chunk in warm {
        unsafe { pool.release(chunk) };
    }

    c.bench_function("unordered_pool_acquire_release_10k", |b| {
        let mut chunks = Vec::with_capacity(CHUNKS);
        b.iter(|| {
            for _ in 0..CHUNKS {
                chunks.push(pool.acquire().unwrap());
            }
            for chunk in chunks.drain(..) {
                unsafe { pool.release(black_box(chunk)) };
            }
        });
    });
}

fn bench_ordered_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_pool");

    for live in [100usize, 1_000, CHUNKS] {
        let mut pool = OrderedPool::new(layout());
        let chunks: Vec<_> = (0..live).map(|_| pool.acquire().unwrap()).collect();

        group.bench_with_input(BenchmarkId::new("release_acquire", live), &live, |b, _| {
            let middle = chunks[chunks.len() / 2];
            b.iter(|| {
                unsafe { pool.release(black_box(middle)) };
                black_box(pool.acquire().unwrap())
            });
        });

        group.bench_with_input(BenchmarkId::new("iter_acquired", live), &live, |b, _| {
            b.iter(|| pool.iter_acquired().count());
        });
    }

    group.finish();
}

fn bench_stack(c: &mut Criterion) {
    let mut stack = StackAllocator::new(1024 * 1024).unwrap();

    c.bench_function("stack_acquire_rewind_10k", |b| {
        b.iter(|| {
            let frame = stack.head();
            for i in 0..CHUNKS {
                black_box(stack.acquire(16 + (i & 15), 8).unwrap());
            }
            stack.release(frame).unwrap();
        });
    });
}

fn bench_heap(c: &mut Criterion) {
    let mut heap = HeapAllocator::new();

    c.bench_function("heap_allocate_free_1k", |b| {
        let mut live = Vec::with_capacity(1_000);
        b.iter(|| {
            for i in 0..1_000 {
                live.push(heap.allocate(32 + i, 8, None).unwrap());
            }
            for ptr in live.drain(..) {
                heap.free(ptr).unwrap();
            }
        });
    });
}

fn bench_interning(c: &mut Criterion) {
    let words: Vec<String> = (0..1_000).map(|i| format!("identifier_{i}")).collect();
    let pool = StringInterningPool::new();
    for word in &words {
        pool.intern(word).unwrap();
    }

    c.bench_function("intern_hit_1k", |b| {
        b.iter(|| {
            for word in &words {
                black_box(pool.intern(word).unwrap());
            }
        });
    });

    c.bench_function("intern_miss_1k", |b| {
        b.iter(|| {
            let fresh = StringInterningPool::new();
            for word in &words {
                black_box(fresh.intern(word).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_unordered_pool,
    bench_ordered_pool,
    bench_stack,
    bench_heap,
    bench_interning,
);

criterion_main!(benches);
