use std::{mem, ptr::NonNull};

use crate::{
    block::{ALIGNMENT, Block, FreeBlock, TAG_SIZE, pack},
    error::{HeapError, Result},
    utils::align,
};

/// Bytes reserved at the start of every chunk for its [`Region`] record.
pub(crate) const REGION_HEADER_SIZE: usize = align(mem::size_of::<Region>(), ALIGNMENT);

/// Size of the prologue sentinel block: just a header and a footer.
pub(crate) const PROLOGUE_SIZE: usize = ALIGNMENT;

/// Offset of the first usable payload from the start of the chunk.
const FIRST_PAYLOAD: usize = REGION_HEADER_SIZE + ALIGNMENT + PROLOGUE_SIZE;

/// Bytes of every chunk that can never be part of a usable block: the
/// region record, the padding before the prologue, the prologue itself and
/// the epilogue header.
pub(crate) const CHUNK_OVERHEAD: usize = FIRST_PAYLOAD;

/// Metadata of a chunk, written at the very beginning of the mapping.
///
/// [`crate::kernel::PageSource::map`] gives us memory regions aligned to
/// the page size, but we cannot assume these regions are adjacent. So every
/// chunk is fenced by sentinel blocks and chunks are chained together in a
/// list that lives inside the chunks themselves:
///
/// ```text
/// +--------+-----+----------+------------------------------------+-----+
/// | Region | pad | Prologue |  Block  |  Block  |  ...  |  Block | Epi | ---> next chunk
/// +--------+-----+----------+------------------------------------+-----+
///                 size 16, a         (free or allocated)           size 0, a
/// ```
///
/// The prologue stops backward traversal and the epilogue stops forward
/// traversal, so no boundary scan ever leaves the mapping.
#[repr(C)]
pub(crate) struct Region {
    /// Next chunk of the heap, in mapping order (newest first).
    next: Option<NonNull<Region>>,
    /// Size of the whole mapping.
    size: usize,
}

/// Size of the chunk we need to map so that its single free block is at
/// least `min_block` bytes. The result is a multiple of `granularity`.
pub(crate) fn chunk_size_for(min_block: usize, granularity: usize) -> Option<usize> {
    let needed = min_block.checked_add(CHUNK_OVERHEAD + granularity - 1)?;

    Some(needed & !(granularity - 1))
}

impl Region {
    /// Lays out a fresh chunk of `size` bytes at `addr`: region record,
    /// prologue, one free block spanning the rest and the epilogue.
    ///
    /// Returns the region and its free block, which is not linked anywhere
    /// yet.
    ///
    /// **SAFETY**: `addr` must point to `size` writable bytes aligned to
    /// [`ALIGNMENT`] and owned by the heap. `size` must be a multiple of
    /// [`ALIGNMENT`] greater than [`CHUNK_OVERHEAD`].
    pub unsafe fn format(
        addr: NonNull<u8>,
        size: usize,
        next: Option<NonNull<Region>>,
    ) -> (NonNull<Region>, FreeBlock) {
        unsafe {
            let region = addr.cast::<Region>();
            region.write(Region { next, size });

            let region_ref = region.as_ref();

            region_ref.prologue().write_tags(PROLOGUE_SIZE, true);
            region_ref.epilogue().write_tags_epilogue();

            let free = FreeBlock::carve(region_ref.first_block(), size - CHUNK_OVERHEAD);

            (region, free)
        }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self as *const Region as usize
    }

    /// Address one past the last byte of the chunk.
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    #[inline]
    fn block_at(&self, offset: usize) -> Block {
        unsafe {
            let base = NonNull::new_unchecked(self as *const Region as *mut u8);
            Block::from_payload(base.add(offset))
        }
    }

    #[inline]
    pub fn prologue(&self) -> Block {
        self.block_at(FIRST_PAYLOAD - PROLOGUE_SIZE)
    }

    #[inline]
    pub fn first_block(&self) -> Block {
        self.block_at(FIRST_PAYLOAD)
    }

    /// The epilogue has no payload, its "payload address" is the end of the
    /// chunk and its header is the last word of the mapping.
    #[inline]
    pub fn epilogue(&self) -> Block {
        self.block_at(self.size)
    }

    /// Tells whether `addr` could be the payload of a real block of this
    /// chunk, i.e. it lies between the first payload and the epilogue.
    #[inline]
    pub fn contains_payload(&self, addr: usize) -> bool {
        addr >= self.start() + FIRST_PAYLOAD && addr < self.end()
    }

    /// Iterates the blocks of the chunk in address order, sentinels
    /// excluded. Each block's tags are verified before it is yielded, and
    /// iteration stops after the first error.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            region: self,
            current: Some(self.first_block()),
        }
    }
}

impl Block {
    #[inline]
    fn write_tags_epilogue(&self) {
        // No footer: the epilogue header is the last word of the chunk.
        unsafe {
            self.payload()
                .as_ptr()
                .sub(TAG_SIZE)
                .cast::<usize>()
                .write(pack(0, true));
        }
    }
}

pub(crate) struct Blocks<'a> {
    region: &'a Region,
    current: Option<Block>,
}

impl Iterator for Blocks<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current.take()?;

        if block.is_epilogue() {
            if block.addr() == self.region.end() {
                return None;
            }

            return Some(Err(HeapError::CorruptedMetadata {
                addr: block.addr(),
                header: block.header_tag(),
                footer: 0,
            }));
        }

        // Bounds first, so a smashed size never sends us reading a footer
        // outside the mapping.
        if block.addr() + block.size() > self.region.end() {
            return Some(Err(HeapError::CorruptedMetadata {
                addr: block.addr(),
                header: block.header_tag(),
                footer: 0,
            }));
        }

        if let Err(err) = block.check_tags() {
            return Some(Err(err));
        }

        self.current = Some(block.next_in_memory());

        Some(Ok(block))
    }
}

/// Intrusive list of every chunk mapped by the heap, newest first.
pub(crate) struct RegionList {
    head: Option<NonNull<Region>>,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Option<NonNull<Region>>,
    marker: std::marker::PhantomData<&'a RegionList>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn head(&self) -> Option<NonNull<Region>> {
        self.head
    }

    /// Records a region formatted with [`Region::format`] using the current
    /// [`Self::head`] as its `next`.
    pub fn push(&mut self, region: NonNull<Region>) {
        self.head = Some(region);
        self.len += 1;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            marker: std::marker::PhantomData,
        }
    }

    /// Finds the chunk owning the payload address `addr`.
    pub fn find(&self, addr: usize) -> Option<&Region> {
        self.iter().find(|region| region.contains_payload(addr))
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        let region = unsafe { self.current?.as_ref() };
        self.current = region.next;

        Some(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MIN_BLOCK_SIZE, OVERHEAD};

    const CHUNK: usize = 1024;

    #[repr(align(16))]
    struct Scratch([u8; CHUNK]);

    fn format(scratch: &mut Scratch) -> (NonNull<Region>, FreeBlock) {
        unsafe {
            let addr = NonNull::new_unchecked(scratch.0.as_mut_ptr());
            Region::format(addr, CHUNK, None)
        }
    }

    #[test]
    fn chunk_size_fits_the_request() {
        let granularity = 4 * 4096;

        assert_eq!(chunk_size_for(4096, granularity), Some(granularity));
        assert_eq!(
            chunk_size_for(granularity, granularity),
            Some(2 * granularity)
        );
        assert_eq!(chunk_size_for(usize::MAX, granularity), None);

        for min_block in (MIN_BLOCK_SIZE..10 * granularity).step_by(4000) {
            let size = chunk_size_for(min_block, granularity).unwrap();
            assert_eq!(size % granularity, 0);
            assert!(size - CHUNK_OVERHEAD >= min_block);
        }
    }

    #[test]
    fn layout_of_a_fresh_chunk() {
        let mut scratch = Scratch([0; CHUNK]);
        let (region, free) = format(&mut scratch);
        let region = unsafe { region.as_ref() };

        assert_eq!(free.block(), region.first_block());
        assert_eq!(free.size(), CHUNK - CHUNK_OVERHEAD);
        assert_eq!(free.block().addr() % ALIGNMENT, 0);
        assert!(free.block().check_tags().is_ok());

        // Sentinels on both sides.
        assert_eq!(free.block().prev_footer_tag(), pack(PROLOGUE_SIZE, true));
        assert_eq!(free.block().prev_in_memory(), region.prologue());
        assert!(free.block().next_in_memory().is_epilogue());
        assert_eq!(free.block().next_in_memory(), region.epilogue());
    }

    #[test]
    fn blocks_walks_until_the_epilogue() {
        let mut scratch = Scratch([0; CHUNK]);
        let (region, free) = format(&mut scratch);
        let region = unsafe { region.as_ref() };

        let total = free.size();
        let used = free.into_used(64);
        let rest = unsafe { FreeBlock::carve(used.block().next_in_memory(), total - 64) };
        assert_eq!(rest.size(), CHUNK - CHUNK_OVERHEAD - 64);

        let sizes: Vec<_> = region.blocks().map(|block| block.unwrap().size()).collect();
        assert_eq!(sizes, vec![64, CHUNK - CHUNK_OVERHEAD - 64]);
    }

    #[test]
    fn blocks_reports_corruption() {
        let mut scratch = Scratch([0; CHUNK]);
        let (region, free) = format(&mut scratch);
        let region = unsafe { region.as_ref() };

        // Smash the footer of the only block.
        unsafe {
            free.block()
                .payload()
                .as_ptr()
                .add(free.size() - OVERHEAD)
                .write_bytes(0xFF, 1);
        }

        let mut blocks = region.blocks();
        assert!(matches!(
            blocks.next(),
            Some(Err(HeapError::CorruptedMetadata { .. }))
        ));
        assert!(blocks.next().is_none());
    }

    #[test]
    fn payload_bounds() {
        let mut scratch = Scratch([0; CHUNK]);
        let (region, free) = format(&mut scratch);
        let region = unsafe { region.as_ref() };

        assert!(region.contains_payload(free.block().addr()));
        assert!(!region.contains_payload(region.prologue().addr()));
        assert!(!region.contains_payload(region.end()));
        assert!(!region.contains_payload(region.start()));
    }

    #[test]
    fn region_list_finds_owner() {
        let mut first = Scratch([0; CHUNK]);
        let mut second = Scratch([0; CHUNK]);
        let mut regions = RegionList::new();

        let (a, free_a) = format(&mut first);
        regions.push(a);
        let (b, free_b) = unsafe {
            Region::format(
                NonNull::new_unchecked(second.0.as_mut_ptr()),
                CHUNK,
                regions.head(),
            )
        };
        regions.push(b);

        assert_eq!(regions.len(), 2);
        assert_eq!(regions.iter().count(), 2);
        assert_eq!(
            regions.find(free_a.block().addr()).map(Region::start),
            Some(a.as_ptr() as usize)
        );
        assert_eq!(
            regions.find(free_b.block().addr()).map(Region::start),
            Some(b.as_ptr() as usize)
        );
        assert!(regions.find(0x10).is_none());
    }
}
