//! The host-side allocator engine.
//!
//! The engine mirrors the device's heap region as an address-ordered list of
//! blocks. It decides where allocations go but never touches device memory
//! itself, and it never extends the region on its own: when nothing fits it
//! reports "no fit" and waits for the device to [`grow`][Engine::grow].
//!
//! Three structures describe the mirrored region and are kept mutually
//! consistent by every operation:
//!
//! 1. The address-ordered block list (`block.rs`), which covers
//!    `[origin, brk)` without gaps and never holds two adjacent free blocks.
//!
//! 2. The size-class free registry (`classes.rs`), which holds exactly the free
//!    blocks, each under the class of its size.
//!
//! 3. The address index (`index.rs`), which maps each block's address to its
//!    handle.
//!
//! [`Engine::verify`] checks all of the above.

mod block;
mod classes;
mod fit;
mod index;
mod mutators;

pub use classes::{class_of, ALLOCATION_UNIT, NUM_SIZE_CLASSES};
pub use fit::FitPolicy;
pub use index::IndexConfig;

use crate::error::{EngineError, Inconsistency, ParseNameError};
use block::{BlockId, Blocks, BOUNDARY};
use classes::FreeRegistry;
use core::{fmt, str::FromStr};
use index::AddressIndex;

/// Every block size is a multiple of this many bytes.
pub const ALIGNMENT: u32 = ALLOCATION_UNIT;

/// The smallest block the engine will split off.
pub const MIN_BLOCK_SIZE: u32 = ALLOCATION_UNIT;

/// Round a requested size up to a whole, non-empty number of allocation units.
///
/// Returns `None` when the rounded size does not fit in a `u32`.
pub fn aligned_size(size: u32) -> Option<u32> {
    size.checked_next_multiple_of(ALIGNMENT)
        .map(|size| size.max(MIN_BLOCK_SIZE))
}

/// How the engine finds the block that owns an address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Lookup {
    /// Consult the address index.
    #[default]
    Index,

    /// Walk the address-ordered list up to the boundary sentinel.
    Linear,
}

impl FromStr for Lookup {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(Lookup::Index),
            "linear" => Ok(Lookup::Linear),
            _ => Err(ParseNameError::new("lookup strategy", s)),
        }
    }
}

/// Configuration for an [`Engine`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// How free blocks are chosen.
    pub policy: FitPolicy,
    /// How blocks are found by address.
    pub lookup: Lookup,
    /// Sizing of the address index.
    pub index: IndexConfig,
}

impl EngineConfig {
    /// Set the fit policy.
    pub fn policy(mut self, policy: FitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the lookup strategy.
    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.lookup = lookup;
        self
    }

    /// Set the address index configuration.
    pub fn index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }
}

/// The engine's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Never initialized.
    Uninitialized,
    /// Mirroring a region.
    Ready,
    /// The session ended and the region was dropped.
    Closed,
}

/// A read-only view of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block's first byte.
    pub address: u32,
    /// The block's size in bytes, a multiple of [`ALIGNMENT`].
    pub size: u32,
    /// Whether the block is handed out.
    pub allocated: bool,
}

/// The structures describing one mirrored region.
#[derive(Debug)]
struct Heap {
    blocks: Blocks,
    registry: FreeRegistry,
    index: AddressIndex,
    brk: u32,
}

impl Heap {
    fn new(origin: u32, config: &EngineConfig) -> Self {
        let mut blocks = Blocks::new(origin);
        let registry = FreeRegistry::new(&mut blocks);
        Heap {
            blocks,
            registry,
            index: AddressIndex::new(config.index),
            brk: origin,
        }
    }

    fn origin(&self) -> u32 {
        self.blocks[BOUNDARY].address
    }

    fn find(&self, address: u32, lookup: Lookup) -> Option<BlockId> {
        match lookup {
            Lookup::Index => self.index.search(address),
            Lookup::Linear => self
                .blocks
                .iter()
                .find(|(_, block)| block.address == address)
                .map(|(id, _)| id),
        }
    }

    fn verify(&self) -> Result<(), Inconsistency> {
        let mut expected = self.origin();
        let mut prev_free = false;
        let mut count = 0;
        let mut free_count = 0;

        for (id, block) in self.blocks.iter() {
            let address = block.address;
            if self.blocks[block.next].prev != id || self.blocks[block.prev].next != id {
                return Err(Inconsistency::BrokenLink { address });
            }
            if address != expected {
                return Err(Inconsistency::Gap { address, expected });
            }
            if !block.allocated {
                if prev_free {
                    return Err(Inconsistency::AdjacentFree { address });
                }
                if block.free.is_none() {
                    return Err(Inconsistency::Unregistered { address });
                }
                free_count += 1;
            } else if block.free.is_some() {
                return Err(Inconsistency::RegisteredAllocated { address });
            }
            if self.index.search(address) != Some(id) {
                return Err(Inconsistency::IndexMissing { address });
            }
            prev_free = !block.allocated;
            expected = block.end();
            count += 1;
        }

        if expected != self.brk {
            return Err(Inconsistency::EndMismatch {
                end: expected,
                brk: self.brk,
            });
        }
        if self.index.len() != count {
            return Err(Inconsistency::IndexCount {
                indexed: self.index.len(),
                blocks: count,
            });
        }
        if let Some((address, _)) = self
            .index
            .entries()
            .find(|(address, id)| self.find(*address, Lookup::Linear) != Some(*id))
        {
            return Err(Inconsistency::IndexStale { address });
        }

        let mut registered = 0;
        for class in 0..NUM_SIZE_CLASSES {
            for id in self.registry.iter_class(&self.blocks, class) {
                let block = &self.blocks[id];
                if block.allocated {
                    return Err(Inconsistency::RegisteredAllocated {
                        address: block.address,
                    });
                }
                if class_of(block.size) != class {
                    return Err(Inconsistency::Misclassified {
                        address: block.address,
                        class,
                        expected: class_of(block.size),
                    });
                }
                registered += 1;
            }
        }
        if registered != free_count {
            return Err(Inconsistency::RegistryCount {
                registered,
                free: free_count,
            });
        }

        Ok(())
    }
}

#[derive(Debug)]
enum State {
    Uninitialized,
    Ready(Heap),
    Closed,
}

/// The allocator engine for one device region.
///
/// ```
/// use offload_heap::engine::{Engine, EngineConfig};
///
/// let mut engine = Engine::new(EngineConfig::default());
/// engine.init(0x1000);
/// assert_eq!(engine.allocate(16).unwrap(), None);
///
/// engine.grow(64).unwrap();
/// assert_eq!(engine.allocate(16).unwrap(), Some(0x1000));
/// assert_eq!(engine.allocate(16).unwrap(), Some(0x1010));
/// ```
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    state: State,
}

impl Engine {
    /// Create an uninitialized engine.
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            state: State::Uninitialized,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Where the engine is in its lifecycle.
    pub fn state(&self) -> EngineState {
        match self.state {
            State::Uninitialized => EngineState::Uninitialized,
            State::Ready(_) => EngineState::Ready,
            State::Closed => EngineState::Closed,
        }
    }

    fn heap(&self) -> Option<&Heap> {
        match &self.state {
            State::Ready(heap) => Some(heap),
            State::Uninitialized | State::Closed => None,
        }
    }

    fn heap_mut(&mut self) -> Result<&mut Heap, EngineError> {
        match &mut self.state {
            State::Ready(heap) => Ok(heap),
            State::Uninitialized | State::Closed => Err(EngineError::NotReady),
        }
    }

    /// Start mirroring an empty region whose first byte is at `origin`.
    ///
    /// Any previously mirrored region is discarded, so this also serves as the
    /// device's heap reset.
    pub fn init(&mut self, origin: u32) {
        if let State::Ready(heap) = &self.state {
            log::debug!(
                "engine: resetting region {:#010x}..{:#010x} to origin {origin:#010x}",
                heap.origin(),
                heap.brk
            );
        } else {
            log::debug!("engine: initializing at origin {origin:#010x}");
        }
        self.state = State::Ready(Heap::new(origin, &self.config));
    }

    /// Choose an address for `size` bytes.
    ///
    /// `Ok(None)` means no free block is large enough; the device has to grow
    /// its region and ask again.
    pub fn allocate(&mut self, size: u32) -> Result<Option<u32>, EngineError> {
        let policy = self.config.policy;
        let heap = self.heap_mut()?;

        if size == 0 {
            return Ok(None);
        }
        let Some(asize) = aligned_size(size) else {
            log::debug!("engine: allocation of {size} bytes can never fit");
            return Ok(None);
        };

        match fit::find_fit(&heap.blocks, &heap.registry, asize, policy) {
            Some(id) => {
                heap.place(id, asize);
                let address = heap.blocks[id].address;
                log::debug!("engine: allocate({size}) -> {address:#010x}");
                Ok(Some(address))
            }
            None => {
                log::debug!("engine: allocate({size}) -> no fit");
                Ok(None)
            }
        }
    }

    /// Free the block at `address`.
    ///
    /// Unknown addresses and blocks that are already free are reported as
    /// consistency warnings and otherwise ignored.
    pub fn deallocate(&mut self, address: u32) -> Result<(), EngineError> {
        let lookup = self.config.lookup;
        let heap = self.heap_mut()?;

        let Some(id) = heap.find(address, lookup) else {
            log::warn!("engine: deallocate of unknown address {address:#010x}");
            return Ok(());
        };
        if !heap.blocks[id].allocated {
            log::warn!("engine: deallocate of already-free block {address:#010x}");
            return Ok(());
        }

        heap.blocks[id].allocated = false;
        heap.registry.add(&mut heap.blocks, id);
        heap.coalesce(id);
        log::debug!("engine: deallocate({address:#010x})");
        Ok(())
    }

    /// Resize the block at `address` in place.
    ///
    /// Returns `Ok(Some(address))` when the block now holds at least `size`
    /// bytes, and `Ok(None)` when it cannot grow in place, in which case the
    /// caller must allocate, copy and deallocate. Unknown or free addresses are
    /// reported as consistency warnings and yield `Ok(None)`.
    pub fn resize(&mut self, address: u32, size: u32) -> Result<Option<u32>, EngineError> {
        let lookup = self.config.lookup;
        let heap = self.heap_mut()?;

        let Some(id) = heap.find(address, lookup) else {
            log::warn!("engine: resize of unknown address {address:#010x}");
            return Ok(None);
        };
        if !heap.blocks[id].allocated {
            log::warn!("engine: resize of free block {address:#010x}");
            return Ok(None);
        }
        let Some(asize) = aligned_size(size) else {
            return Ok(None);
        };

        let current = heap.blocks[id].size;
        if current >= asize {
            heap.shrink(id, asize);
            log::debug!("engine: resize({address:#010x}, {size}) -> shrunk in place");
            return Ok(Some(address));
        }

        let next = &heap.blocks[heap.blocks[id].next];
        if !next.allocated && u64::from(current) + u64::from(next.size) >= u64::from(asize) {
            heap.extend(id, asize);
            log::debug!("engine: resize({address:#010x}, {size}) -> extended in place");
            return Ok(Some(address));
        }

        log::debug!("engine: resize({address:#010x}, {size}) -> no fit");
        Ok(None)
    }

    /// Mirror the device extending its region by `increment` bytes.
    pub fn grow(&mut self, increment: u32) -> Result<(), EngineError> {
        let heap = self.heap_mut()?;
        if increment == 0 {
            return Ok(());
        }
        let brk = heap
            .brk
            .checked_add(increment)
            .ok_or(EngineError::AddressOverflow {
                brk: heap.brk,
                increment,
            })?;

        let id = heap.blocks.append(heap.brk, increment);
        heap.index.insert(heap.brk, id);
        heap.registry.add(&mut heap.blocks, id);
        heap.brk = brk;
        heap.coalesce(id);
        log::debug!("engine: grow({increment}) -> brk {brk:#010x}");
        Ok(())
    }

    /// Discard the mirrored region.
    pub fn close(&mut self) {
        log::debug!("engine: closing");
        self.state = State::Closed;
    }

    /// The first byte of the mirrored region.
    pub fn heap_lo(&self) -> Option<u32> {
        self.heap().map(Heap::origin)
    }

    /// One past the last byte of the mirrored region.
    pub fn heap_hi(&self) -> Option<u32> {
        self.heap().map(|heap| heap.brk)
    }

    /// The number of bytes mirrored.
    pub fn heap_size(&self) -> Option<u32> {
        self.heap().map(|heap| heap.brk - heap.origin())
    }

    /// Every block in address order. Empty unless the engine is ready.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.heap().into_iter().flat_map(|heap| {
            heap.blocks.iter().map(|(_, block)| BlockInfo {
                address: block.address,
                size: block.size,
                allocated: block.allocated,
            })
        })
    }

    /// Check every structural invariant of the mirrored region.
    pub fn verify(&self) -> Result<(), Inconsistency> {
        self.heap().map_or(Ok(()), Heap::verify)
    }
}

/// Dumps the block list, one block per line.
impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(heap) = self.heap() else {
            return writeln!(f, "engine not initialized");
        };
        writeln!(
            f,
            "boundary: origin {:#010x}, brk {:#010x}",
            heap.origin(),
            heap.brk
        )?;
        for (i, block) in self.blocks().enumerate() {
            writeln!(
                f,
                "block {i}: {:#010x} {:>8} bytes {}",
                block.address,
                block.size,
                if block.allocated { "allocated" } else { "free" }
            )?;
        }
        Ok(())
    }
}
