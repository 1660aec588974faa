//! Structural mutations that keep the block list, the free registry, and the
//! address index consistent with each other.

use super::block::BlockId;
use super::classes::class_of;
use super::{Heap, MIN_BLOCK_SIZE};

impl Heap {
    /// Allocate `size` bytes at the start of the free block `id`.
    ///
    /// When the leftover is large enough to stand alone it is split off into a
    /// new free block, otherwise the whole block is handed out.
    pub(super) fn place(&mut self, id: BlockId, size: u32) {
        debug_assert!(!self.blocks[id].allocated);
        debug_assert!(self.blocks[id].size >= size);

        self.registry.remove(&mut self.blocks, id);
        self.blocks[id].allocated = true;

        if self.blocks[id].size - size >= MIN_BLOCK_SIZE {
            // The block was free and therefore already coalesced, so the new
            // tail's successor is allocated.
            let tail = self.blocks.insert_after(id, size);
            self.index.insert(self.blocks[tail].address, tail);
            self.registry.add(&mut self.blocks, tail);
        }
    }

    /// Give the tail of the allocated block `id` back, keeping `size` bytes.
    pub(super) fn shrink(&mut self, id: BlockId, size: u32) {
        debug_assert!(self.blocks[id].allocated);
        debug_assert!(self.blocks[id].size >= size);

        if self.blocks[id].size - size < MIN_BLOCK_SIZE {
            return;
        }
        let tail = self.blocks.insert_after(id, size);
        self.index.insert(self.blocks[tail].address, tail);
        self.registry.add(&mut self.blocks, tail);
        self.coalesce(tail);
    }

    /// Grow the allocated block `id` to `size` bytes by taking space from its
    /// free successor.
    pub(super) fn extend(&mut self, id: BlockId, size: u32) {
        let next = self.blocks[id].next;
        debug_assert!(self.blocks[id].allocated);
        debug_assert!(!self.blocks[next].allocated);

        let combined = self.blocks[id].size + self.blocks[next].size;
        debug_assert!(combined >= size);

        if combined - size >= MIN_BLOCK_SIZE {
            let old_address = self.blocks[next].address;
            let old_size = self.blocks[next].size;
            self.index.delete(old_address);
            self.blocks.move_boundary(id, size);
            self.index.insert(self.blocks[next].address, next);
            self.registry.reclass(&mut self.blocks, next, old_size);
        } else {
            self.absorb(id, next);
        }
    }

    /// Merge the free block `id` with any free address-order neighbours.
    ///
    /// `id` must be registered. Returns the surviving block, which is
    /// registered under the class of its merged size.
    pub(super) fn coalesce(&mut self, id: BlockId) -> BlockId {
        debug_assert!(!self.blocks[id].allocated);
        debug_assert!(self.blocks[id].free.is_some());

        let mut survivor = id;
        let mut registered_size = self.blocks[id].size;

        let next = self.blocks[id].next;
        if !self.blocks[next].allocated {
            self.absorb(id, next);
        }

        let prev = self.blocks[id].prev;
        if !self.blocks[prev].allocated {
            registered_size = self.blocks[prev].size;
            self.absorb(prev, id);
            survivor = prev;
        }

        if class_of(registered_size) != class_of(self.blocks[survivor].size) {
            self.registry.remove(&mut self.blocks, survivor);
            self.registry.add(&mut self.blocks, survivor);
        }
        survivor
    }

    /// Fold `from`, `into`'s successor, into `into`, dropping `from` from the
    /// registry (when free), the index and the list.
    fn absorb(&mut self, into: BlockId, from: BlockId) {
        if self.blocks[from].free.is_some() {
            self.registry.remove(&mut self.blocks, from);
        }
        self.index.delete(self.blocks[from].address);
        self.blocks.merge(into, from);
    }
}
