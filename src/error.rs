use thiserror::Error;

/// Everything that can go wrong while managing the heap.
///
/// Apart from [`HeapError::OutOfMemory`], every variant means the heap was
/// misused (double free, foreign pointer, buffer overrun). They are detected
/// before the free list is touched so the heap itself stays consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The page source could not map a new chunk.
    #[error("out of memory: could not map a chunk of {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Header and footer of the block at `addr` disagree, or the size they
    /// store cannot describe a block.
    #[error("corrupted block metadata at {addr:#x} (header {header:#x}, footer {footer:#x})")]
    CorruptedMetadata {
        addr: usize,
        header: usize,
        footer: usize,
    },

    /// The pointer was never returned by this heap.
    #[error("invalid free of {addr:#x}: not a payload owned by this heap")]
    InvalidFree { addr: usize },

    /// The block at `addr` is already free.
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },

    /// The free list links around the node at `addr` are not symmetric, or
    /// the node is not a free block.
    #[error("free list corrupted at node {addr:#x}")]
    ListCorrupted { addr: usize },

    /// The free block at `addr` sits right after another free block, which
    /// coalescing should have prevented.
    #[error("free block at {addr:#x} was not coalesced with its neighbour")]
    Uncoalesced { addr: usize },

    /// Walking the chunks found a different number of free blocks than the
    /// free list holds.
    #[error("{walked} free blocks in the heap but {listed} in the free list")]
    FreeCountMismatch { walked: usize, listed: usize },
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, HeapError>;
