//! The size-class free registry.
//!
//! Free blocks are segregated into [`NUM_SIZE_CLASSES`] circular lists, each
//! headed by a sentinel node in the block arena. Classes 0 through 7 hold
//! blocks of exactly 1 through 8 allocation units. From class 8 on, each
//! class doubles the upper size boundary of the previous one:
//!
//! | class | units          | bytes          |
//! |-------|----------------|----------------|
//! | 0..=7 | 1..=8          | 8..=64         |
//! | 8     | 9..=16         | 72..=128       |
//! | 9     | 17..=32        | 136..=256      |
//! | k     | 2^(k-5)+1..=2^(k-4) |           |
//!
//! The last class is a catch-all for everything larger.

use super::block::{Block, BlockId, Blocks, FreeLinks};

/// The granularity of every block size, in bytes.
pub const ALLOCATION_UNIT: u32 = 8;

/// The number of segregated free lists.
pub const NUM_SIZE_CLASSES: usize = 20;

/// Classes below this hold exactly one size each.
const EXACT_CLASSES: u32 = 8;

/// Get the size class for a block of `size` bytes.
///
/// This is non-decreasing in `size`.
pub fn class_of(size: u32) -> usize {
    let units = size.div_ceil(ALLOCATION_UNIT).max(1);
    let class = if units <= EXACT_CLASSES {
        units - 1
    } else {
        // ceil(log2(units)), which is at least 4 here.
        let ceil_log2 = u32::BITS - (units - 1).leading_zeros();
        ceil_log2 + 4
    };
    core::cmp::min(class as usize, NUM_SIZE_CLASSES - 1)
}

#[derive(Debug)]
pub(crate) struct FreeRegistry {
    heads: [BlockId; NUM_SIZE_CLASSES],
}

impl FreeRegistry {
    /// Install one empty head node per class into `blocks`.
    pub(crate) fn new(blocks: &mut Blocks) -> Self {
        let heads = core::array::from_fn(|_| {
            let head = blocks.insert(|id| Block::sentinel(id, 0));
            blocks[head].free = Some(FreeLinks {
                prev: head,
                next: head,
            });
            head
        });
        FreeRegistry { heads }
    }

    fn links(blocks: &mut Blocks, id: BlockId) -> &mut FreeLinks {
        blocks[id]
            .free
            .as_mut()
            .expect("free-list neighbour is not registered")
    }

    /// Register the free block `id` at the head of its size class.
    pub(crate) fn add(&self, blocks: &mut Blocks, id: BlockId) {
        debug_assert!(!blocks[id].allocated, "registering an allocated block");
        debug_assert!(blocks[id].free.is_none(), "block is already registered");

        let head = self.heads[class_of(blocks[id].size)];
        let first = Self::links(blocks, head).next;
        blocks[id].free = Some(FreeLinks {
            prev: head,
            next: first,
        });
        Self::links(blocks, first).prev = id;
        Self::links(blocks, head).next = id;
    }

    /// Unlink `id` from whichever class list it is in.
    pub(crate) fn remove(&self, blocks: &mut Blocks, id: BlockId) {
        let Some(FreeLinks { prev, next }) = blocks[id].free.take() else {
            debug_assert!(false, "removing unregistered block {id:?}");
            return;
        };
        Self::links(blocks, prev).next = next;
        Self::links(blocks, next).prev = prev;
    }

    /// Re-register `id` if its class changed since it was registered with
    /// `old_size`.
    pub(crate) fn reclass(&self, blocks: &mut Blocks, id: BlockId, old_size: u32) {
        if class_of(old_size) != class_of(blocks[id].size) {
            self.remove(blocks, id);
            self.add(blocks, id);
        }
    }

    /// Iterate the members of one class, most recently added first.
    pub(crate) fn iter_class<'a>(
        &self,
        blocks: &'a Blocks,
        class: usize,
    ) -> impl Iterator<Item = BlockId> + 'a {
        let head = self.heads[class];
        let mut cursor = head;
        core::iter::from_fn(move || {
            cursor = blocks[cursor].free.as_ref()?.next;
            (cursor != head).then_some(cursor)
        })
    }
}
