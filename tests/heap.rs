use std::ptr::NonNull;

use memheap::{Heap, HeapConfig, HeapError, Kernel, PageSource, ALIGNMENT};

/// Page source that remembers every mapping it handed out.
#[derive(Default)]
struct TracingSource {
    maps: Vec<usize>,
}

impl PageSource for TracingSource {
    unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.maps.push(len);
        unsafe { Kernel.map(len) }
    }

    fn page_size(&self) -> usize {
        Kernel.page_size()
    }
}

fn heap() -> Heap<TracingSource> {
    Heap::new(TracingSource::default(), HeapConfig::default()).unwrap()
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

#[test]
fn freed_space_is_reused_without_extending() {
    let mut heap = heap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    heap.free(a).unwrap();
    let c = heap.allocate(50).unwrap();

    assert!(addr(c) >= addr(a) && addr(c) < addr(b));
    assert_eq!(heap.page_source().maps.len(), 1);
    assert_eq!(heap.stats().mapped_bytes, heap.page_source().maps[0]);
}

#[test]
fn same_size_after_free_gets_same_address() {
    let mut heap = heap();

    for size in [1, 24, 100, 1000, 5000] {
        let p = heap.allocate(size).unwrap();
        heap.free(p).unwrap();
        assert_eq!(heap.allocate(size).unwrap(), p);
        heap.free(p).unwrap();
    }

    heap.check().unwrap();
}

#[test]
fn adjacent_frees_leave_a_single_entry_in_either_order() {
    for reversed in [false, true] {
        let mut heap = heap();

        let a = heap.allocate(48).unwrap();
        let b = heap.allocate(48).unwrap();
        let _guard = heap.allocate(48).unwrap();
        let before = heap.stats().free_blocks;

        if reversed {
            heap.free(b).unwrap();
            heap.free(a).unwrap();
        } else {
            heap.free(a).unwrap();
            heap.free(b).unwrap();
        }

        assert_eq!(heap.stats().free_blocks, before + 1);
        heap.check().unwrap();
    }
}

#[test]
fn running_out_of_a_chunk_extends_exactly_once() {
    let mut heap = heap();
    let chunk = heap.page_source().maps[0];
    let mut live = Vec::new();

    // Fill the first chunk with blocks of 256 bytes.
    while heap.page_source().maps.len() == 1 {
        live.push(heap.allocate(256 - 16).unwrap());
    }

    assert_eq!(heap.page_source().maps.len(), 2);
    assert_eq!(live.len(), (chunk - 48) / 256 + 1);

    for ptr in live {
        heap.free(ptr).unwrap();
    }

    let report = heap.check().unwrap();
    assert_eq!(report.allocated_blocks, 0);
    assert_eq!(report.free_blocks, 2);
}

#[test]
fn random_workload_keeps_the_heap_consistent() {
    random_workload(HeapConfig::default());
}

#[test]
fn random_workload_without_neighbour_verification() {
    random_workload(HeapConfig::default().with_verify_on_free(false));
}

fn random_workload(config: HeapConfig) {
    let mut heap = Heap::new(TracingSource::default(), config).unwrap();
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    // Deterministic xorshift so the workload is reproducible.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    for round in 0..2000 {
        let roll = next();

        if live.is_empty() || roll % 3 != 0 {
            let size = (next() % 2048) as usize;
            let ptr = heap.allocate(size).unwrap();
            let fill = round as u8;

            assert_eq!(addr(ptr) % ALIGNMENT, 0);
            unsafe { ptr.as_ptr().write_bytes(fill, size) };
            live.push((ptr, size, fill));
        } else {
            let index = (next() as usize) % live.len();
            let (ptr, size, fill) = live.swap_remove(index);

            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|&byte| byte == fill));

            heap.free(ptr).unwrap();
        }

        if round % 100 == 0 {
            heap.check().unwrap();
        }
    }

    // No two live payloads overlap.
    let mut ranges: Vec<_> = live.iter().map(|(ptr, size, _)| (addr(*ptr), *size)).collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }

    for (ptr, _, _) in live {
        heap.free(ptr).unwrap();
    }

    let report = heap.check().unwrap();
    assert_eq!(report.allocated_blocks, 0);
    assert_eq!(report.free_blocks, heap.stats().chunks);
}

#[test]
fn one_byte_overrun_is_caught_by_the_next_free() {
    let mut heap = heap();

    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(32).unwrap();
    let c = heap.allocate(32).unwrap();

    let past_a = unsafe { a.as_ptr().add(heap.usable_size(a).unwrap()) };
    let saved = unsafe { past_a.read() };
    unsafe { past_a.write(0) };

    assert!(matches!(
        heap.free(b),
        Err(HeapError::CorruptedMetadata { .. })
    ));
    assert_eq!(heap.stats().live_allocations, 3);
    assert_eq!(heap.stats().free_blocks, 1);

    unsafe { past_a.write(saved) };
    heap.check().unwrap();

    for ptr in [b, a, c] {
        heap.free(ptr).unwrap();
    }
    assert_eq!(heap.check().unwrap().free_blocks, 1);
}

#[test]
fn misuse_is_reported_not_absorbed() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();

    heap.free(a).unwrap();
    assert!(matches!(heap.free(a), Err(HeapError::DoubleFree { .. })));

    let inside = unsafe { b.add(ALIGNMENT) };
    assert!(matches!(heap.free(inside), Err(HeapError::InvalidFree { .. })));

    heap.free(b).unwrap();
    heap.check().unwrap();
}

#[test]
fn chunk_granularity_follows_the_config() {
    let config = HeapConfig::default().with_chunk_pages(8);
    let heap = Heap::new(TracingSource::default(), config).unwrap();

    assert_eq!(heap.page_source().maps, vec![8 * Kernel.page_size()]);
}
