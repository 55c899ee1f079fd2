//! Explicit free list memory allocator.
//!
//! Memory is requested from the operating system in chunks of a few pages
//! (see [`PageSource`]) and carved into blocks. Every block carries its size
//! and allocation status twice, in a header before the payload and in a
//! footer after it:
//!
//! ```text
//! +--------+---------------------------+--------+
//! | header |          payload          | footer |
//! +--------+---------------------------+--------+
//!          ^
//!          pointer handed to the user (16-byte aligned)
//! ```
//!
//! Free blocks are linked together in a doubly linked list whose links
//! live in the (unused) payload of the free blocks themselves, so the
//! allocator never needs memory of its own to keep track of anything.
//!
//! - [`Heap::allocate`] walks that list first-fit, splits the block it finds
//!   when the leftover is big enough, and maps a new chunk if nothing fits.
//! - [`Heap::free`] marks the block free and merges it with its neighbours
//!   in memory, found through the header of the next block and the footer
//!   of the previous one.
//!
//! Misuse (double free, foreign pointers, overwritten tags) is detected and
//! reported as a [`HeapError`] instead of silently corrupting the heap.
//!
//! ```
//! use memheap::Heap;
//!
//! let mut heap = Heap::with_kernel().unwrap();
//!
//! let a = heap.allocate(100).unwrap();
//! let b = heap.allocate(200).unwrap();
//! heap.free(a).unwrap();
//!
//! // Reuses the space left by `a`.
//! let c = heap.allocate(50).unwrap();
//! assert_eq!(a, c);
//!
//! heap.free(b).unwrap();
//! heap.free(c).unwrap();
//! heap.check().unwrap();
//! ```

mod block;
mod config;
mod error;
mod freelist;
mod global;
mod heap;
mod kernel;
mod region;
mod utils;

pub use block::{ALIGNMENT, MIN_BLOCK_SIZE};
pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use global::MemAlloc;
pub use heap::{Heap, HeapReport, HeapStats};
pub use kernel::{Kernel, PageSource, page_size};
pub use utils::align;
