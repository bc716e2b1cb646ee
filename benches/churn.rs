use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use geminus::{Heap, MmapArena};
use std::hint::black_box;

const OPS: u64 = 10_000;
const ARENA_BYTES: usize = 64 << 20;
const HEAP_BYTES: usize = 32 << 20;

/// geminus alloc/free throughput on one heap.
fn geminus_alloc_free(heap: &mut Heap, size: usize) {
  for _ in 0..OPS {
    let ptr = heap.alloc(size).expect("heap exhausted");
    black_box(ptr);
    heap.free(ptr.as_ptr()).expect("free failed");
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_churn(c: &mut Criterion) {
  let arena = MmapArena::new(ARENA_BYTES).expect("mmap arena");
  let mut heap = unsafe { Heap::init(arena.as_ptr(), HEAP_BYTES) }.expect("heap init");

  let mut group = c.benchmark_group("churn");

  for size in [48, 256, 1024, 16384, 262_144] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("geminus", size), &size, |b, &size| {
      b.iter(|| geminus_alloc_free(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
  assert_eq!(heap.teardown(), 0);
}

criterion_group!(benches, benchmark_churn);
criterion_main!(benches);
