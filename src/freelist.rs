use std::marker::PhantomData;

use crate::{
    block::FreeBlock,
    error::{HeapError, Result},
};

/// Link to another free block, `None` terminates the list on both ends.
pub(crate) type Link = Option<FreeBlock>;

/// Free list metadata. It is written inside the payload of the free block
/// itself, which nobody else is using while the block is free:
///
/// ```text
/// +------------------------+
/// |         header         |
/// +------------------------+ <- payload
/// |       prev: Link       |
/// |       next: Link       |
/// +------------------------+
/// |      Free Payload      |
/// |        (unused)        |
/// +------------------------+
/// |         footer         |
/// +------------------------+
/// ```
#[repr(C)]
pub(crate) struct FreeNode {
    /// Previous free block in the list (not in memory).
    pub prev: Link,
    /// Next free block in the list (not in memory).
    pub next: Link,
}

/// Doubly linked list of every free [`FreeBlock`] of the heap.
///
/// The list does not own anything, it only indexes blocks that live in
/// the chunks. The order has nothing to do with addresses: new entries are
/// always pushed to the front, so a traversal sees the most recently freed
/// (or mapped) blocks first.
///
/// ```text
///                                     Free List
///
///   head         Next free block                Next free block
///    |     +----------------------+  +-----------------------------------+
///    v     |                      v  |                                   v
/// +--------|-----------------------------+      +-----------------------------------+
/// | Pro | Free | Block | Block | Free | Epi | -> | Pro | Block | Free | Block | Epi |
/// +--------------------------------------+      +-----------------------------------+
/// ```
pub(crate) struct FreeList {
    head: Link,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Link,
    remaining: usize,
    marker: PhantomData<&'a FreeList>,
}

impl FreeBlock {
    #[inline]
    pub fn prev(&self) -> Link {
        unsafe { (*self.node()).prev }
    }

    #[inline]
    pub fn next(&self) -> Link {
        unsafe { (*self.node()).next }
    }

    #[inline]
    fn set_prev(&self, prev: Link) {
        unsafe { (*self.node()).prev = prev }
    }

    #[inline]
    fn set_next(&self, next: Link) {
        unsafe { (*self.node()).next = next }
    }
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes `block` to the front of the list in O(1).
    pub fn insert_front(&mut self, block: FreeBlock) {
        block.set_prev(None);
        block.set_next(self.head);

        if let Some(head) = self.head {
            head.set_prev(Some(block));
        }

        self.head = Some(block);
        self.len += 1;
    }

    /// Unlinks `block` from the list in O(1), splicing its neighbours
    /// together. Missing neighbours simply mean `block` sits at one end.
    pub fn remove(&mut self, block: FreeBlock) {
        let prev = block.prev();
        let next = block.next();

        match prev {
            Some(prev) => prev.set_next(next),
            None => self.head = next,
        }

        if let Some(next) = next {
            next.set_prev(prev);
        }

        block.set_prev(None);
        block.set_next(None);
        self.len -= 1;
    }

    /// First-fit search: returns the first block in list order whose size
    /// is at least `needed` bytes.
    pub fn first_fit(&self, needed: usize) -> Link {
        self.iter().find(|block| block.size() >= needed)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }

    /// Walks the whole list verifying that it is symmetric
    /// (`node.next.prev == node`), that it holds exactly [`Self::len`]
    /// nodes and that every node is tagged free in header and footer.
    ///
    /// Returns the number of nodes visited.
    pub fn check(&self) -> Result<usize> {
        let mut visited = 0;
        let mut prev: Link = None;
        let mut current = self.head;

        while let Some(block) = current {
            let addr = block.block().addr();

            if visited == self.len || block.prev() != prev {
                return Err(HeapError::ListCorrupted { addr });
            }

            block.block().check_tags()?;
            if block.block().is_allocated() {
                return Err(HeapError::ListCorrupted { addr });
            }

            visited += 1;
            prev = current;
            current = block.next();
        }

        if visited != self.len {
            return Err(HeapError::ListCorrupted {
                addr: prev.map_or(0, |block| block.block().addr()),
            });
        }

        Ok(visited)
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        // Bounded by `remaining` so a corrupted cycle can't spin forever.
        if self.remaining == 0 {
            return None;
        }

        let block = self.current?;
        self.current = block.next();
        self.remaining -= 1;

        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a FreeList {
    type Item = FreeBlock;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
