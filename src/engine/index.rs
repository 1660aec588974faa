//! The address index: a chained hash table from device address to block
//! handle.
//!
//! Every bucket owns a permanent inline head entry; colliding entries chain
//! off of it in heap-allocated nodes. Deleting a head with a successor
//! promotes the successor into the head slot in place, so a bucket is never
//! left pointing at a removed entry.

use super::block::BlockId;
use alloc::{boxed::Box, vec::Vec};

/// Configuration for the engine's address index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexConfig {
    /// The number of buckets the table starts with. Must be non-zero.
    pub initial_buckets: usize,

    /// Whether to double the bucket count (and rehash every entry) once the
    /// load factor exceeds one.
    pub grow: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            initial_buckets: 128,
            grow: true,
        }
    }
}

#[derive(Debug)]
struct Entry {
    key: u32,
    block: BlockId,
    next: Option<Box<Entry>>,
}

#[derive(Debug)]
pub(crate) struct AddressIndex {
    buckets: Vec<Option<Entry>>,
    len: usize,
    grow: bool,
}

/// 32-bit FNV-1a over the little-endian bytes of the address.
fn hash(key: u32) -> u32 {
    const BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.to_le_bytes()
        .iter()
        .fold(BASIS, |h, b| (h ^ u32::from(*b)).wrapping_mul(PRIME))
}

fn empty_buckets(n: usize) -> Vec<Option<Entry>> {
    let mut buckets = Vec::with_capacity(n);
    buckets.resize_with(n, || None);
    buckets
}

impl AddressIndex {
    pub(crate) fn new(config: IndexConfig) -> Self {
        AddressIndex {
            buckets: empty_buckets(config.initial_buckets.max(1)),
            len: 0,
            grow: config.grow,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(buckets: &[Option<Entry>], key: u32) -> usize {
        hash(key) as usize % buckets.len()
    }

    /// Insert into `buckets` without touching the count or growth policy.
    fn insert_into(buckets: &mut [Option<Entry>], key: u32, block: BlockId) {
        let index = Self::bucket_of(buckets, key);
        let entry = Entry {
            key,
            block,
            next: None,
        };
        let bucket = &mut buckets[index];
        match bucket {
            None => *bucket = Some(entry),
            Some(head) => {
                let mut slot = &mut head.next;
                while slot.is_some() {
                    slot = &mut slot.as_mut().expect("checked by loop condition").next;
                }
                *slot = Some(Box::new(entry));
            }
        }
    }

    /// Map `key` to `block`. A key that is already present is chained again at
    /// the tail rather than overwritten.
    pub(crate) fn insert(&mut self, key: u32, block: BlockId) {
        Self::insert_into(&mut self.buckets, key, block);
        self.len += 1;
        if self.grow && self.len > self.buckets.len() {
            self.double();
        }
    }

    fn double(&mut self) {
        let doubled = empty_buckets(self.buckets.len() * 2);
        let old = core::mem::replace(&mut self.buckets, doubled);
        log::trace!(
            "address index: growing to {} buckets for {} entries",
            self.buckets.len(),
            self.len
        );
        for head in old.into_iter().flatten() {
            let mut next = Some(Box::new(head));
            while let Some(entry) = next {
                Self::insert_into(&mut self.buckets, entry.key, entry.block);
                next = entry.next;
            }
        }
    }

    pub(crate) fn search(&self, key: u32) -> Option<BlockId> {
        let mut cursor = self.buckets[Self::bucket_of(&self.buckets, key)].as_ref();
        while let Some(entry) = cursor {
            if entry.key == key {
                return Some(entry.block);
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    /// Remove the first entry for `key`, returning the block it mapped to.
    pub(crate) fn delete(&mut self, key: u32) -> Option<BlockId> {
        let index = Self::bucket_of(&self.buckets, key);
        let bucket = &mut self.buckets[index];
        let head = bucket.as_mut()?;

        if head.key == key {
            let block = head.block;
            match head.next.take() {
                Some(successor) => *head = *successor,
                None => *bucket = None,
            }
            self.len -= 1;
            return Some(block);
        }

        let mut slot = &mut head.next;
        while slot.as_ref().is_some_and(|entry| entry.key != key) {
            slot = &mut slot.as_mut().expect("checked by loop condition").next;
        }
        let removed = slot.take()?;
        *slot = removed.next;
        self.len -= 1;
        Some(removed.block)
    }

    /// Iterate every `(address, block)` entry, in no particular order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, BlockId)> + '_ {
        self.buckets.iter().flat_map(|bucket| Chain {
            cursor: bucket.as_ref(),
        })
    }
}

struct Chain<'a> {
    cursor: Option<&'a Entry>,
}

impl Iterator for Chain<'_> {
    type Item = (u32, BlockId);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor?;
        self.cursor = entry.next.as_deref();
        Some((entry.key, entry.block))
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::{Block, Blocks};
    use super::*;

    /// Mint `n` distinct handles.
    fn handles(n: usize) -> Vec<BlockId> {
        let mut blocks = Blocks::new(0);
        (0..n)
            .map(|_| blocks.insert(|id| Block::sentinel(id, 0)))
            .collect()
    }

    fn colliding_keys(index: &AddressIndex, n: usize) -> Vec<u32> {
        let target = AddressIndex::bucket_of(&index.buckets, 0);
        (0..)
            .step_by(8)
            .filter(|k| AddressIndex::bucket_of(&index.buckets, *k) == target)
            .take(n)
            .collect()
    }

    #[test]
    fn insert_search_delete() {
        let ids = handles(3);
        let mut index = AddressIndex::new(IndexConfig::default());
        index.insert(0x1000, ids[0]);
        index.insert(0x1010, ids[1]);
        index.insert(0x2000, ids[2]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.search(0x1010), Some(ids[1]));
        assert_eq!(index.search(0x1018), None);

        assert_eq!(index.delete(0x1010), Some(ids[1]));
        assert_eq!(index.delete(0x1010), None);
        assert_eq!(index.search(0x1010), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn deleting_a_chain_head_promotes_its_successor() {
        let ids = handles(3);
        let mut index = AddressIndex::new(IndexConfig {
            initial_buckets: 4,
            grow: false,
        });
        let keys = colliding_keys(&index, 3);
        for (key, id) in keys.iter().zip(&ids) {
            index.insert(*key, *id);
        }

        assert_eq!(index.delete(keys[0]), Some(ids[0]));
        assert_eq!(index.search(keys[1]), Some(ids[1]));
        assert_eq!(index.search(keys[2]), Some(ids[2]));

        // Now delete from the middle of what remains, then the last one.
        assert_eq!(index.delete(keys[2]), Some(ids[2]));
        assert_eq!(index.search(keys[1]), Some(ids[1]));
        assert_eq!(index.delete(keys[1]), Some(ids[1]));
        assert_eq!(index.len(), 0);
        assert_eq!(index.entries().count(), 0);
    }

    #[test]
    fn grows_past_load_factor_one() {
        let ids = handles(10);
        let mut index = AddressIndex::new(IndexConfig {
            initial_buckets: 4,
            grow: true,
        });
        for (i, id) in ids.iter().enumerate() {
            index.insert(0x4000 + 8 * i as u32, *id);
        }
        assert_eq!(index.bucket_count(), 16);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.search(0x4000 + 8 * i as u32), Some(*id));
        }

        let mut keys: Vec<u32> = index.entries().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], 0x4000);
    }

    #[test]
    fn fixed_size_table_keeps_chaining() {
        let ids = handles(64);
        let mut index = AddressIndex::new(IndexConfig {
            initial_buckets: 2,
            grow: false,
        });
        for (i, id) in ids.iter().enumerate() {
            index.insert(8 * i as u32 + 8, *id);
        }
        assert_eq!(index.bucket_count(), 2);
        assert_eq!(index.search(8 * 40 + 8), Some(ids[40]));
        assert_eq!(index.len(), 64);
        assert_eq!(index.search(8 * 64 + 8), None);
    }
}
