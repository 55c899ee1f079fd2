use std::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::{
    block::{
        ALIGNMENT, Block, BlockState, FreeBlock, MIN_BLOCK_SIZE, UsedBlock, block_size, pack,
        unpack_size,
    },
    config::HeapConfig,
    error::{HeapError, Result},
    freelist::FreeList,
    kernel::{Kernel, PageSource},
    region::{PROLOGUE_SIZE, Region, RegionList, chunk_size_for},
    utils::is_aligned,
};

/// Counters describing how much memory the heap holds and hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Chunks mapped since the last [`Heap::init`].
    pub chunks: usize,
    /// Bytes mapped for those chunks.
    pub mapped_bytes: usize,
    /// Number of times the heap had to be extended.
    pub extends: usize,
    /// Allocations not freed yet.
    pub live_allocations: usize,
    /// Block bytes (tags included) of those allocations.
    pub live_bytes: usize,
    /// Entries of the free list.
    pub free_blocks: usize,
}

/// Result of a full consistency walk, see [`Heap::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapReport {
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

/// Explicit free list allocator over chunks of mapped pages.
///
/// Every chunk obtained from the [`PageSource`] is carved into blocks with
/// boundary tags (see [`crate::block`]), and free blocks are indexed by a
/// doubly linked list stored in their own payloads. Allocation is first-fit
/// over that list, splitting the block when the remainder is big enough to
/// stand on its own. Freeing merges the block with its free neighbours in
/// memory.
///
/// A `Heap` is single threaded: it takes `&mut self` everywhere, callers
/// sharing one across threads must lock around it (see
/// [`crate::MemAlloc`]).
pub struct Heap<S: PageSource = Kernel> {
    source: S,
    config: HeapConfig,
    /// Chunks are always a multiple of this many bytes.
    granularity: usize,
    regions: RegionList,
    free_list: FreeList,
    stats: HeapStats,
}

// The heap exclusively owns the chunks its pointers refer to.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}

impl Heap<Kernel> {
    /// Heap backed by the operating system with the default configuration.
    pub fn with_kernel() -> Result<Self> {
        Self::new(Kernel, HeapConfig::default())
    }
}

impl<S: PageSource> Heap<S> {
    /// Creates a new heap and maps its first chunk, see [`Heap::init`].
    pub fn new(source: S, config: HeapConfig) -> Result<Self> {
        let granularity = config.chunk_granularity(source.page_size());

        let mut heap = Self {
            source,
            config,
            granularity,
            regions: RegionList::new(),
            free_list: FreeList::new(),
            stats: HeapStats::default(),
        };

        heap.init()?;

        Ok(heap)
    }

    /// Resets the heap to a single fresh chunk.
    ///
    /// Chunks mapped before are forgotten, not unmapped: pointers into them
    /// are no longer valid for [`Heap::free`].
    pub fn init(&mut self) -> Result<()> {
        self.regions = RegionList::new();
        self.free_list = FreeList::new();
        self.stats = HeapStats::default();

        let page_size = self.source.page_size();
        self.extend(page_size)?;

        debug!(
            "heap initialised: chunk granularity {} bytes, {} bytes mapped",
            self.granularity, self.stats.mapped_bytes
        );

        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[inline]
    pub fn page_source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            chunks: self.regions.len(),
            free_blocks: self.free_list.len(),
            ..self.stats
        }
    }

    /// Maps a new chunk whose free block can hold at least `min_block`
    /// bytes and pushes that block to the front of the free list.
    fn extend(&mut self, min_block: usize) -> Result<FreeBlock> {
        let size = chunk_size_for(min_block, self.granularity)
            .ok_or(HeapError::OutOfMemory { requested: min_block })?;

        let Some(addr) = (unsafe { self.source.map(size) }) else {
            warn!("out of memory: page source refused {size} bytes");
            return Err(HeapError::OutOfMemory { requested: size });
        };

        let (region, free) = unsafe { Region::format(addr, size, self.regions.head()) };
        self.regions.push(region);
        self.free_list.insert_front(free);

        self.stats.mapped_bytes += size;
        self.stats.extends += 1;

        debug!(
            "extended heap by {size} bytes at {addr:p} (free block of {} bytes)",
            free.size()
        );

        Ok(free)
    }

    /// Allocates a block able to hold `size` bytes. The returned pointer is
    /// aligned to [`ALIGNMENT`] bytes. A `size` of 0 gets a minimum block.
    ///
    /// The free list is searched first-fit. If nothing fits, a new chunk is
    /// mapped, and failing to map one is the only error.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let needed = block_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;

        let block = match self.free_list.first_fit(needed) {
            Some(block) => block,
            None => {
                self.extend(needed)?;
                self.free_list
                    .first_fit(needed)
                    .ok_or(HeapError::OutOfMemory { requested: needed })?
            }
        };

        let used = self.place(block, needed);

        self.stats.live_allocations += 1;
        self.stats.live_bytes += used.size();

        trace!(
            "allocate({size}) -> {:p} (block of {} bytes)",
            used.block().payload(),
            used.size()
        );

        Ok(used.block().payload())
    }

    /// Takes `block` out of the free list and marks `needed` bytes of it
    /// allocated. The rest becomes a new free block unless it would be too
    /// small to be worth tracking, in which case the whole block is granted.
    fn place(&mut self, block: FreeBlock, needed: usize) -> UsedBlock {
        self.free_list.remove(block);

        let size = block.size();
        let remainder = size - needed;

        if remainder <= MIN_BLOCK_SIZE {
            return block.into_used(size);
        }

        let used = block.into_used(needed);
        let rest = unsafe { FreeBlock::carve(used.block().next_in_memory(), remainder) };
        self.free_list.insert_front(rest);

        trace!(
            "split {size} bytes at {:p} into {needed} + {remainder}",
            used.block().payload()
        );

        used
    }

    /// Like [`Heap::allocate`], with the payload filled with zeroes.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.allocate(size)?;

        unsafe { ptr.as_ptr().write_bytes(0, size) };

        Ok(ptr)
    }

    /// Returns the block of `ptr` to the heap, merging it with the blocks
    /// right before and after it in memory when they are free.
    ///
    /// `ptr` is validated before anything is modified: freeing something
    /// this heap didn't hand out, freeing twice, or tags of the block or its
    /// neighbours that don't add up, is reported as an error and leaves the
    /// heap untouched.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let (region, used) = self.validate(ptr)?;

        let block = used.block();
        let next = next_neighbour(region, block)?;
        let prev = prev_neighbour(region, block)?;

        if self.config.verify_on_free && !next.is_epilogue() {
            next.check_tags()?;
        }

        let freed = used.size();
        self.stats.live_allocations -= 1;
        self.stats.live_bytes -= freed;

        let mut start = used.release().block();
        let mut size = freed;

        if let BlockState::Free(next) = next.classify() {
            self.free_list.remove(next);
            size += next.size();
        }

        if let BlockState::Free(prev) = prev.classify() {
            self.free_list.remove(prev);
            size += prev.size();
            start = prev.block();
        }

        let merged = unsafe { FreeBlock::carve(start, size) };
        self.free_list.insert_front(merged);

        trace!(
            "free({ptr:p}): {freed} bytes, coalesced into {size} bytes at {:p}",
            merged.block().payload()
        );

        Ok(())
    }

    /// Resizes the allocation at `ptr` to hold `new_size` bytes.
    ///
    /// The block is kept in place when it is already big enough. Otherwise
    /// a new block is allocated, the old payload copied over and the old
    /// block freed. On error the original allocation is left untouched.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let (_, used) = self.validate(ptr)?;

        let needed = block_size(new_size).ok_or(HeapError::OutOfMemory { requested: new_size })?;
        if needed <= used.size() {
            return Ok(ptr);
        }

        let old_len = used.payload_len();
        let new_ptr = self.allocate(new_size)?;

        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_len) };

        self.free(ptr)?;

        trace!("reallocate({ptr:p}, {new_size}) moved to {new_ptr:p}");

        Ok(new_ptr)
    }

    /// Number of payload bytes usable through `ptr`, at least what was
    /// requested when it was allocated.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        Ok(self.validate(ptr)?.1.payload_len())
    }

    /// Makes sure `ptr` is the payload of a live allocation of this heap
    /// and returns it along with the chunk that owns it.
    fn validate(&self, ptr: NonNull<u8>) -> Result<(&Region, UsedBlock)> {
        let addr = ptr.as_ptr() as usize;

        if !is_aligned(addr, ALIGNMENT) {
            warn!("rejecting misaligned pointer {ptr:p}");
            return Err(HeapError::InvalidFree { addr });
        }

        let Some(region) = self.regions.find(addr) else {
            warn!("rejecting pointer {ptr:p} outside of the heap");
            return Err(HeapError::InvalidFree { addr });
        };

        // The header of any address inside a chunk is readable.
        let block = unsafe { Block::from_payload(ptr) };
        let size = block.size();

        if size < MIN_BLOCK_SIZE || addr + size > region.end() {
            warn!("rejecting pointer {ptr:p}: not the start of a block");
            return Err(HeapError::InvalidFree { addr });
        }

        match block.classify() {
            BlockState::Free(_) => {
                warn!("double free of {ptr:p}");
                Err(HeapError::DoubleFree { addr })
            }
            BlockState::Used(used) => {
                block.check_tags()?;
                Ok((region, used))
            }
        }
    }

    /// Walks every chunk and the free list, checking all the invariants
    /// the allocator relies on:
    ///
    /// - header and footer of every block agree, and every payload is
    ///   aligned to [`ALIGNMENT`];
    /// - prologue and epilogue are intact;
    /// - no two free blocks are next to each other in memory;
    /// - the free list is symmetric, only holds free blocks and holds all of
    ///   them.
    pub fn check(&self) -> Result<HeapReport> {
        let mut report = HeapReport::default();

        for region in self.regions.iter() {
            let prologue = region.prologue();
            prologue.check_tags()?;
            if !prologue.is_allocated() || !region.epilogue().is_epilogue() {
                return Err(HeapError::CorruptedMetadata {
                    addr: region.start(),
                    header: prologue.header_tag(),
                    footer: region.epilogue().header_tag(),
                });
            }

            let mut prev_free = false;
            for block in region.blocks() {
                let block = block?;

                if !is_aligned(block.addr(), ALIGNMENT) {
                    return Err(HeapError::CorruptedMetadata {
                        addr: block.addr(),
                        header: block.header_tag(),
                        footer: block.footer_tag(),
                    });
                }

                match block.classify() {
                    BlockState::Free(free) => {
                        if prev_free {
                            return Err(HeapError::Uncoalesced { addr: block.addr() });
                        }
                        report.free_blocks += 1;
                        report.free_bytes += free.size();
                        prev_free = true;
                    }
                    BlockState::Used(used) => {
                        report.allocated_blocks += 1;
                        report.allocated_bytes += used.size();
                        prev_free = false;
                    }
                }
            }
        }

        let listed = self.free_list.check()?;
        if listed != report.free_blocks {
            return Err(HeapError::FreeCountMismatch {
                walked: report.free_blocks,
                listed,
            });
        }

        for block in &self.free_list {
            if self.regions.find(block.block().addr()).is_none() {
                return Err(HeapError::ListCorrupted {
                    addr: block.block().addr(),
                });
            }
        }

        Ok(report)
    }
}

/// Block right after `block`. Its header must describe a block that ends
/// inside `region`, or be the epilogue sitting at the very end of it.
fn next_neighbour(region: &Region, block: Block) -> Result<Block> {
    let next = block.next_in_memory();

    let fits = if next.addr() == region.end() {
        next.is_epilogue()
    } else {
        next.size() >= MIN_BLOCK_SIZE && next.addr() + next.size() <= region.end()
    };

    if !fits {
        warn!("corrupted header after the block at {:#x}", block.addr());
        return Err(HeapError::CorruptedMetadata {
            addr: next.addr(),
            header: next.header_tag(),
            footer: 0,
        });
    }

    Ok(next)
}

/// Block right before `block`, reached through its footer. The size in
/// that footer must land on a block of `region` (or on the prologue for
/// the first block) whose header holds the same tag.
fn prev_neighbour(region: &Region, block: Block) -> Result<Block> {
    let footer = block.prev_footer_tag();
    let size = unpack_size(footer);
    let first = region.first_block();

    let fits = if block == first {
        footer == pack(PROLOGUE_SIZE, true)
    } else {
        size >= MIN_BLOCK_SIZE
            && is_aligned(size, ALIGNMENT)
            && size <= block.addr() - first.addr()
    };

    if !fits {
        warn!("corrupted footer before the block at {:#x}", block.addr());
        return Err(HeapError::CorruptedMetadata {
            addr: block.addr().wrapping_sub(size),
            header: 0,
            footer,
        });
    }

    let prev = block.prev_in_memory();
    let header = prev.header_tag();

    if header != footer || (block != first && !region.contains_payload(prev.addr())) {
        warn!("corrupted block before {:#x}", block.addr());
        return Err(HeapError::CorruptedMetadata {
            addr: prev.addr(),
            header,
            footer,
        });
    }

    Ok(prev)
}
