//! The arena of block records, and the address-ordered block list threaded
//! through it.
//!
//! Blocks refer to each other by [`BlockId`] handles into the arena rather than
//! by pointers. Slot 0 always holds the boundary sentinel, a zero-sized,
//! permanently-allocated node that both opens and closes the circular
//! address-ordered list. Size-class heads also live in the arena (see
//! `classes.rs`) but are never linked into the address-ordered list.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

/// A stable handle to a block record in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(u32);

impl BlockId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The boundary sentinel's handle.
pub(crate) const BOUNDARY: BlockId = BlockId(0);

/// Links into a size-class free list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeLinks {
    pub(crate) prev: BlockId,
    pub(crate) next: BlockId,
}

/// A contiguous range of device memory, free or allocated.
#[derive(Clone, Debug)]
pub(crate) struct Block {
    pub(crate) address: u32,
    pub(crate) size: u32,
    pub(crate) allocated: bool,

    /// Address-order neighbours.
    pub(crate) prev: BlockId,
    pub(crate) next: BlockId,

    /// Size-class list neighbours. `Some` exactly when the block is registered
    /// in the free registry (and always `Some` for class heads).
    pub(crate) free: Option<FreeLinks>,
}

impl Block {
    /// A zero-sized, allocated node that links only to itself.
    pub(crate) fn sentinel(id: BlockId, address: u32) -> Self {
        Block {
            address,
            size: 0,
            allocated: true,
            prev: id,
            next: id,
            free: None,
        }
    }

    /// One past the last address covered by this block.
    pub(crate) fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// The block arena plus the address-ordered list rooted at [`BOUNDARY`].
#[derive(Debug)]
pub(crate) struct Blocks {
    slots: Vec<Option<Block>>,
    vacant: Vec<BlockId>,
}

impl Blocks {
    /// Create an arena holding only the boundary sentinel at `origin`.
    pub(crate) fn new(origin: u32) -> Self {
        Blocks {
            slots: alloc::vec![Some(Block::sentinel(BOUNDARY, origin))],
            vacant: Vec::new(),
        }
    }

    /// Store a new record in the arena, reusing a released slot if possible.
    /// The record is not linked into any list.
    pub(crate) fn insert(&mut self, make: impl FnOnce(BlockId) -> Block) -> BlockId {
        match self.vacant.pop() {
            Some(id) => {
                self.slots[id.index()] = Some(make(id));
                id
            }
            None => {
                let id = BlockId(
                    u32::try_from(self.slots.len()).expect("block arena outgrew u32 handles"),
                );
                self.slots.push(Some(make(id)));
                id
            }
        }
    }

    fn release(&mut self, id: BlockId) {
        debug_assert_ne!(id, BOUNDARY);
        let old = self.slots[id.index()].take();
        debug_assert!(old.is_some(), "double release of {id:?}");
        self.vacant.push(id);
    }

    /// Link the unlinked record `id` into the address-ordered list directly
    /// after `at`.
    fn link_after(&mut self, at: BlockId, id: BlockId) {
        let next = self[at].next;
        self[id].prev = at;
        self[id].next = next;
        self[next].prev = id;
        self[at].next = id;
    }

    /// Shrink `id` to `new_size` and link a new free block covering the
    /// remainder directly after it. Returns the new block.
    pub(crate) fn insert_after(&mut self, id: BlockId, new_size: u32) -> BlockId {
        let block = &self[id];
        debug_assert!(new_size < block.size);
        let tail_address = block.address + new_size;
        let tail_size = block.size - new_size;

        self[id].size = new_size;
        let tail = self.insert(|tail| Block {
            address: tail_address,
            size: tail_size,
            allocated: false,
            prev: tail,
            next: tail,
            free: None,
        });
        self.link_after(id, tail);
        tail
    }

    /// Link a new free block of `size` bytes starting at `address` as the last
    /// block before the boundary sentinel.
    pub(crate) fn append(&mut self, address: u32, size: u32) -> BlockId {
        let last = self[BOUNDARY].prev;
        debug_assert_eq!(
            address,
            if last == BOUNDARY {
                self[BOUNDARY].address
            } else {
                self[last].end()
            },
            "appended block must start where the list ends"
        );
        let id = self.insert(|id| Block {
            address,
            size,
            allocated: false,
            prev: id,
            next: id,
            free: None,
        });
        self.link_after(last, id);
        id
    }

    /// Absorb `b`, which must be `a`'s address-order successor, into `a`, and
    /// release `b`'s slot.
    pub(crate) fn merge(&mut self, a: BlockId, b: BlockId) {
        debug_assert_eq!(self[a].next, b);
        debug_assert_eq!(self[a].end(), self[b].address);
        debug_assert!(self[b].free.is_none(), "merging away a registered block");

        let after = self[b].next;
        self[a].size += self[b].size;
        self[a].next = after;
        self[after].prev = a;
        self.release(b);
    }

    /// Move the boundary between `id` and its successor so that `id` becomes
    /// `new_size` bytes long. The successor keeps covering the rest.
    pub(crate) fn move_boundary(&mut self, id: BlockId, new_size: u32) {
        let next = self[id].next;
        debug_assert_ne!(next, BOUNDARY);
        let total = self[id].size + self[next].size;
        debug_assert!(new_size < total);

        self[id].size = new_size;
        self[next].address = self[id].address + new_size;
        self[next].size = total - new_size;
    }

    /// Iterate the address-ordered list, from the lowest block up to the
    /// boundary sentinel (exclusive).
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            blocks: self,
            cursor: self[BOUNDARY].next,
        }
    }
}

impl Index<BlockId> for Blocks {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        self.slots[id.index()]
            .as_ref()
            .expect("dangling block handle")
    }
}

impl IndexMut<BlockId> for Blocks {
    fn index_mut(&mut self, id: BlockId) -> &mut Block {
        self.slots[id.index()]
            .as_mut()
            .expect("dangling block handle")
    }
}

/// Address-order iterator over `(handle, block)` pairs.
pub(crate) struct Iter<'a> {
    blocks: &'a Blocks,
    cursor: BlockId,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, &'a Block);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor;
        let block = &self.blocks[id];
        // Only the boundary sentinel is zero-sized.
        if block.size == 0 {
            return None;
        }
        self.cursor = block.next;
        Some((id, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(blocks: &Blocks) -> Vec<(u32, u32, bool)> {
        blocks
            .iter()
            .map(|(_, b)| (b.address, b.size, b.allocated))
            .collect()
    }

    #[test]
    fn append_split_and_merge_keep_the_list_contiguous() {
        let mut blocks = Blocks::new(0x1000);
        assert!(blocks.iter().next().is_none());

        let a = blocks.append(0x1000, 64);
        let b = blocks.append(0x1040, 32);
        assert_eq!(
            shape(&blocks),
            [(0x1000, 64, false), (0x1040, 32, false)]
        );

        let tail = blocks.insert_after(a, 16);
        assert_eq!(blocks[tail].address, 0x1010);
        assert_eq!(blocks[tail].next, b);
        assert_eq!(blocks[b].prev, tail);

        blocks.merge(tail, b);
        assert_eq!(shape(&blocks), [(0x1000, 16, false), (0x1010, 80, false)]);
        assert_eq!(blocks[BOUNDARY].prev, tail);
        assert_eq!(blocks[BOUNDARY].next, a);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut blocks = Blocks::new(0);
        let a = blocks.append(0, 16);
        let b = blocks.insert_after(a, 8);
        blocks.merge(a, b);
        let c = blocks.insert_after(a, 8);
        assert_eq!(b, c);
    }

    #[test]
    fn move_boundary_shifts_the_successor() {
        let mut blocks = Blocks::new(0x100);
        let a = blocks.append(0x100, 16);
        let b = blocks.append(0x110, 48);
        blocks.move_boundary(a, 40);
        assert_eq!(blocks[b].address, 0x128);
        assert_eq!(blocks[b].size, 24);
        assert_eq!(shape(&blocks), [(0x100, 40, false), (0x128, 24, false)]);
    }
}
