use std::{mem, ptr::NonNull};

use crate::{
    error::{HeapError, Result},
    freelist::FreeNode,
    utils::align,
};

/// Size of a boundary tag (header or footer) in bytes.
pub(crate) const TAG_SIZE: usize = mem::size_of::<usize>();

/// Every payload we hand out is aligned to this many bytes, and every
/// block size is a multiple of it.
pub const ALIGNMENT: usize = 16;

/// Bytes of every block consumed by its header and footer.
pub(crate) const OVERHEAD: usize = 2 * TAG_SIZE;

/// Smallest block we ever create. A free block has to be able to host
/// its [`FreeNode`] inside the payload.
pub const MIN_BLOCK_SIZE: usize = align(OVERHEAD + mem::size_of::<FreeNode>(), ALIGNMENT);

const ALLOCATED_BIT: usize = 0x1;
const SIZE_MASK: usize = !(ALIGNMENT - 1);

/// Packs a block `size` and its allocation status into one tag word.
#[inline]
pub(crate) const fn pack(size: usize, allocated: bool) -> usize {
    size | allocated as usize
}

#[inline]
pub(crate) const fn unpack_size(tag: usize) -> usize {
    tag & SIZE_MASK
}

#[inline]
pub(crate) const fn unpack_allocated(tag: usize) -> bool {
    tag & ALLOCATED_BIT != 0
}

/// Total block size needed to serve a request of `requested` payload bytes.
///
/// Adds the tag overhead, rounds to [`ALIGNMENT`] and never goes below
/// [`MIN_BLOCK_SIZE`], so a request of 0 bytes still gets a minimum block.
/// Returns `None` when the computation overflows.
pub(crate) fn block_size(requested: usize) -> Option<usize> {
    let total = requested.checked_add(OVERHEAD + ALIGNMENT - 1)?;

    Some((total & SIZE_MASK).max(MIN_BLOCK_SIZE))
}

/// A block of the heap, identified by its payload address.
///
/// Memory layout of every block:
///
/// ```text
///            +---------------------+
///            |  header: size | a   |  TAG_SIZE bytes
/// payload -> +---------------------+
///            |                     |
///            |       payload       |
///            |                     |
///            +---------------------+
///            |  footer: size | a   |  TAG_SIZE bytes
///            +---------------------+ <- header of the next block
/// ```
///
/// `size` covers header, payload and footer. Both tags always carry the
/// same word, the footer is what lets us step backwards to the previous
/// block without scanning the chunk from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    payload: NonNull<u8>,
}

impl Block {
    /// **SAFETY**: `payload` must be the payload address of a block (or
    /// sentinel) laid out inside a mapped chunk, so that its header word is
    /// readable.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self { payload }
    }

    #[inline]
    pub fn payload(&self) -> NonNull<u8> {
        self.payload
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.payload.as_ptr() as usize
    }

    #[inline]
    fn header(&self) -> *mut usize {
        unsafe { self.payload.as_ptr().sub(TAG_SIZE).cast() }
    }

    #[inline]
    fn footer(&self) -> *mut usize {
        unsafe { self.payload.as_ptr().add(self.size() - OVERHEAD).cast() }
    }

    #[inline]
    pub fn header_tag(&self) -> usize {
        unsafe { self.header().read() }
    }

    /// Only meaningful for blocks whose header size is at least
    /// [`OVERHEAD`], which excludes the epilogue.
    #[inline]
    pub fn footer_tag(&self) -> usize {
        unsafe { self.footer().read() }
    }

    #[inline]
    pub fn size(&self) -> usize {
        unpack_size(self.header_tag())
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        unpack_allocated(self.header_tag())
    }

    /// The zero-size allocated block terminating every chunk.
    #[inline]
    pub fn is_epilogue(&self) -> bool {
        self.header_tag() == pack(0, true)
    }

    /// Writes the same tag in the header and the footer.
    #[inline]
    pub fn write_tags(&self, size: usize, allocated: bool) {
        let tag = pack(size, allocated);

        unsafe {
            self.header().write(tag);
            self.payload.as_ptr().add(size - OVERHEAD).cast::<usize>().write(tag);
        }
    }

    /// Next block by address. Reading past the last block of a chunk lands
    /// on the epilogue, never outside the mapping.
    #[inline]
    pub fn next_in_memory(&self) -> Block {
        unsafe { Block::from_payload(self.payload.add(self.size())) }
    }

    /// Tag stored in the footer of the block right before this one.
    #[inline]
    pub fn prev_footer_tag(&self) -> usize {
        unsafe { self.payload.as_ptr().sub(OVERHEAD).cast::<usize>().read() }
    }

    /// Previous block by address, found through its footer. The first block
    /// of a chunk sees the prologue here.
    #[inline]
    pub fn prev_in_memory(&self) -> Block {
        let prev_size = unpack_size(self.prev_footer_tag());

        unsafe { Block::from_payload(self.payload.sub(prev_size)) }
    }

    /// Checks that the block describes itself consistently: a size that is
    /// a multiple of [`ALIGNMENT`] and can hold both tags, and a footer
    /// equal to the header.
    pub fn check_tags(&self) -> Result<()> {
        let header = self.header_tag();
        let size = unpack_size(header);

        if size < ALIGNMENT || header & (ALIGNMENT - 1) & !ALLOCATED_BIT != 0 {
            return Err(HeapError::CorruptedMetadata {
                addr: self.addr(),
                header,
                footer: 0,
            });
        }

        let footer = self.footer_tag();
        if footer != header {
            return Err(HeapError::CorruptedMetadata {
                addr: self.addr(),
                header,
                footer,
            });
        }

        Ok(())
    }

    /// Splits the block into its typed view according to the allocated bit.
    #[inline]
    pub fn classify(self) -> BlockState {
        if self.is_allocated() {
            BlockState::Used(UsedBlock(self))
        } else {
            BlockState::Free(FreeBlock(self))
        }
    }
}

/// A block seen through its allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    Free(FreeBlock),
    Used(UsedBlock),
}

/// A block whose tags say free. Its payload is not owned by anyone, so we
/// overlay a [`FreeNode`] on it to link it into the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FreeBlock(Block);

/// A block handed out to the user. Its payload is opaque to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct UsedBlock(Block);

impl FreeBlock {
    /// Lays out a free block of `size` bytes starting at `block`, writing
    /// both tags. The free list links are left untouched.
    ///
    /// **SAFETY**: the `size` bytes around `block` (from its header to its
    /// footer) must belong to a chunk and not overlap any live block.
    #[inline]
    pub unsafe fn carve(block: Block, size: usize) -> Self {
        block.write_tags(size, false);
        Self(block)
    }

    #[inline]
    pub fn block(&self) -> Block {
        self.0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    #[inline]
    pub(crate) fn node(&self) -> *mut FreeNode {
        self.0.payload().as_ptr().cast()
    }

    /// Marks the first `size` bytes of this block as allocated.
    #[inline]
    pub fn into_used(self, size: usize) -> UsedBlock {
        self.0.write_tags(size, true);
        UsedBlock(self.0)
    }
}

impl UsedBlock {
    #[inline]
    pub fn block(&self) -> Block {
        self.0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Bytes of the payload the user can actually use.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.size() - OVERHEAD
    }

    /// Rewrites both tags as free, keeping the size.
    #[inline]
    pub fn release(self) -> FreeBlock {
        self.0.write_tags(self.size(), false);
        FreeBlock(self.0)
    }
}
