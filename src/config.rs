/// Tunables of a [`crate::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Chunks are mapped in multiples of this many pages, rounded up to a
    /// power of two.
    pub chunk_pages: usize,
    /// Also compare header and footer of the block right after a freed one.
    /// The freed block and the block before it are always fully checked,
    /// the block after only has its header bounds checked otherwise.
    pub verify_on_free: bool,
}

impl HeapConfig {
    /// 4 pages per chunk, neighbour verification enabled.
    pub const fn new() -> Self {
        Self {
            chunk_pages: 4,
            verify_on_free: true,
        }
    }

    pub const fn with_chunk_pages(mut self, chunk_pages: usize) -> Self {
        self.chunk_pages = chunk_pages;
        self
    }

    pub const fn with_verify_on_free(mut self, verify_on_free: bool) -> Self {
        self.verify_on_free = verify_on_free;
        self
    }

    /// Size every chunk is rounded up to, for the given page size. A zero
    /// `chunk_pages` is treated as one page, and values too large to be
    /// mapped are clamped to the biggest power of two that fits.
    pub fn chunk_granularity(&self, page_size: usize) -> usize {
        let max_pages = 1 << (usize::MAX / page_size).ilog2();

        self.chunk_pages
            .max(1)
            .checked_next_power_of_two()
            .map_or(max_pages, |pages| pages.min(max_pages))
            * page_size
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
