use std::{
    alloc::{GlobalAlloc, Layout},
    process,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{
    block::ALIGNMENT,
    config::HeapConfig,
    heap::{Heap, HeapStats},
    kernel::Kernel,
};

/// [`GlobalAlloc`] front end for a [`Heap`] backed by the [`Kernel`].
///
/// The heap itself is single threaded, so every call goes through a spin
/// lock. The heap is created lazily on the first allocation.
///
/// ```no_run
/// use memheap::MemAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: MemAlloc = MemAlloc::new();
/// ```
///
/// When installed as the global allocator, any logger hooked into the
/// [`log`] facade must not allocate: the heap logs while holding its lock.
pub struct MemAlloc {
    heap: Mutex<Option<Heap<Kernel>>>,
    config: HeapConfig,
}

impl MemAlloc {
    #[inline]
    pub const fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    #[inline]
    pub const fn with_config(config: HeapConfig) -> Self {
        Self {
            heap: Mutex::new(None),
            config,
        }
    }

    /// Runs `f` on the heap, creating it first if needed. Returns `None` if
    /// the heap could not be created.
    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<Kernel>) -> R) -> Option<R> {
        let mut guard = self.heap.lock();

        if guard.is_none() {
            *guard = Heap::new(Kernel, self.config).ok();
        }

        guard.as_mut().map(f)
    }

    /// Statistics of the underlying heap, `None` before the first
    /// allocation.
    pub fn stats(&self) -> Option<HeapStats> {
        self.heap.lock().as_ref().map(Heap::stats)
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Misuse of the heap can't be reported through [`GlobalAlloc`], and
/// carrying on would mean running on a corrupted heap.
fn abort_on_misuse(ptr: *mut u8, err: crate::HeapError) -> ! {
    log::error!("heap misuse at {ptr:p}: {err}");
    process::abort()
}

unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.with_heap(|heap| heap.allocate(layout.size()).ok())
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.with_heap(|heap| heap.allocate_zeroed(layout.size()).ok())
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(addr) = NonNull::new(ptr) else {
            return;
        };

        if let Some(Err(err)) = self.with_heap(|heap| heap.free(addr)) {
            abort_on_misuse(ptr, err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(addr) = NonNull::new(ptr) else {
            return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
        };

        match self.with_heap(|heap| heap.reallocate(addr, new_size)) {
            Some(Ok(new)) => new.as_ptr(),
            Some(Err(crate::HeapError::OutOfMemory { .. })) | None => ptr::null_mut(),
            Some(Err(err)) => abort_on_misuse(ptr, err),
        }
    }
}
