//! Runs the standard library on top of [`MemAlloc`] and shows how the
//! explicit free list behaves underneath `Box` and `Vec`.
//!
//! ```text
//! cargo run --example global                # reuse, merge and growth
//! cargo run --example global -- double-free # aborts on the second free
//! ```

use std::alloc::{GlobalAlloc, Layout};

use memheap::MemAlloc;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

fn report(label: &str) {
    if let Some(stats) = ALLOCATOR.stats() {
        println!(
            "{label:>8}: {} chunk(s), {} bytes mapped, {} live, {} free block(s)",
            stats.chunks, stats.mapped_bytes, stats.live_allocations, stats.free_blocks
        );
    }
}

fn main() {
    let double_free = std::env::args().any(|arg| arg == "double-free");

    report("start");

    // Freed blocks go to the front of the list, so the last one freed is
    // the first one handed out again. Fences keep x and y from merging.
    let x = Box::new([1u8; 256]);
    let _fence_x = Box::new(0u64);
    let y = Box::new([2u8; 256]);
    let _fence_y = Box::new(0u64);
    let (addr_x, addr_y) = (x.as_ptr(), y.as_ptr());

    drop(x);
    drop(y);
    let z = Box::new([3u8; 256]);

    println!("\nx at {addr_x:p}, y at {addr_y:p}, freed x then y");
    println!("z reuses {:p} (y: {})", z.as_ptr(), z.as_ptr() == addr_y);

    // Two neighbours freed in any order become one block that can hold
    // both of them.
    let a = Box::new([0u8; 64]);
    let b = Box::new([0u8; 64]);
    let addr_a = a.as_ptr();

    drop(b);
    drop(a);
    let merged = Box::new([0u8; 128]);

    println!(
        "a and b merged, 128 bytes placed at {:p} (a: {})\n",
        merged.as_ptr(),
        merged.as_ptr() == addr_a
    );

    // Bigger than anything free: the heap maps a new chunk for it.
    report("before");
    let big: Vec<u8> = Vec::with_capacity(1 << 20);
    report("after");
    drop(big);
    report("dropped");

    if double_free {
        let layout = Layout::new::<[u64; 4]>();

        unsafe {
            let ptr = ALLOCATOR.alloc(layout);
            ALLOCATOR.dealloc(ptr, layout);

            println!("\nfreeing {ptr:p} a second time, the process aborts");
            ALLOCATOR.dealloc(ptr, layout);
        }

        unreachable!("double free went unnoticed");
    }
}
