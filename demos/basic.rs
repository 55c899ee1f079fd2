use std::ptr::NonNull;

use memheap::Heap;

fn log_alloc(addr: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() -> memheap::Result<()> {
    let mut heap = Heap::with_kernel()?;

    let addr1 = heap.allocate(8)?;
    log_alloc(addr1, 8);

    let addr2 = heap.allocate(100)?;
    log_alloc(addr2, 100);

    let addr3 = heap.allocate(16)?;
    log_alloc(addr3, 16);

    heap.free(addr1)?;
    heap.free(addr2)?;

    // The block of addr1 and addr2 merged, so this fits where addr1 was.
    let addr4 = heap.allocate(100)?;
    log_alloc(addr4, 100);
    println!("Reused addr1: {}", addr1 == addr4);

    // Freeing twice is caught instead of corrupting the heap.
    heap.free(addr4)?;
    if let Err(err) = heap.free(addr4) {
        println!("Second free rejected: {err}");
    }

    heap.free(addr3)?;

    println!("{:?}", heap.stats());
    println!("{:?}", heap.check()?);

    Ok(())
}
