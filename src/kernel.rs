use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Supplier of fresh memory for the heap.
///
/// As the allocator, our top level view of this has nothing to do with
/// the concrete APIs offered by each kernel: we only ever ask for more
/// pages. Pages are never given back, so there is no unmap operation.
pub trait PageSource {
    /// Maps a region of at least `len` bytes aligned to the page size.
    /// `len` is always a multiple of [`PageSource::page_size`].
    ///
    /// Returns `None` if the underlying system can't satisfy the request.
    ///
    /// **SAFETY**: the returned region must stay mapped, readable and
    /// writable for as long as the heap using it is alive, and must not be
    /// handed out to anybody else.
    unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Virtual memory page size in bytes. Must be a power of two.
    fn page_size(&self) -> usize;
}

/// [`PageSource`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kernel;

/// Virtual memory page size of the computer. This is usually 4096, but we
/// can't know it at compile time so it is cached after the first query.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Trait implemented per platform by [`Kernel`].
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn query_page_size() -> usize;
}

impl PageSource for Kernel {
    unsafe fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        let region = unsafe { Kernel::request_memory(len) };

        match region {
            Some(addr) => log::debug!("mapped {len} bytes at {addr:p}"),
            None => log::warn!("failed to map {len} bytes"),
        }

        region
    }

    fn page_size(&self) -> usize {
        page_size()
    }
}

/// Cached wrapper around [`PlatformMemory::query_page_size`].
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Kernel::query_page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn query_page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn query_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
