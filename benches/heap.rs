//! Allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use memheap::Heap;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let mut heap = Heap::with_kernel().unwrap();

        group.bench_with_input(BenchmarkId::new("memheap", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = heap.allocate(sz).unwrap();
                criterion::black_box(ptr);
                heap.free(ptr).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        let mut heap = Heap::with_kernel().unwrap();

        b.iter(|| {
            let allocs: Vec<_> = (0..1000).map(|_| heap.allocate(64).unwrap()).collect();
            // Free in reverse so every free merges with the block after it.
            for ptr in allocs.into_iter().rev() {
                heap.free(ptr).unwrap();
            }
        });
    });

    group.bench_function("1000x64B_interleaved_free", |b| {
        let mut heap = Heap::with_kernel().unwrap();

        b.iter(|| {
            let allocs: Vec<_> = (0..1000).map(|_| heap.allocate(64).unwrap()).collect();
            // Every other block first, leaving a fragmented free list to search.
            for ptr in allocs.iter().step_by(2) {
                heap.free(*ptr).unwrap();
            }
            for ptr in allocs.iter().skip(1).step_by(2) {
                heap.free(*ptr).unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst);
criterion_main!(benches);
