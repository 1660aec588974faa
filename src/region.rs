//! The device's heap region.
//!
//! The region is the only memory the allocator hands out. It starts empty at a
//! fixed base and can only be extended at its high end (or rewound to empty);
//! the host mirrors every extension.

use crate::error::RegionError;
use alloc::vec::Vec;

/// A grow-only device memory region.
pub trait Region {
    /// The region's first byte.
    fn base(&self) -> u32;

    /// One past the region's last byte.
    fn brk(&self) -> u32;

    /// Extend the region by `increment` bytes, returning the old `brk`.
    fn sbrk(&mut self, increment: u32) -> Result<u32, RegionError>;

    /// Rewind the region to empty.
    fn reset(&mut self);

    /// Copy `len` bytes from `src` to `dst` within the region. The ranges may
    /// overlap.
    fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), RegionError>;

    /// Fill `buf` from the region starting at `address`.
    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), RegionError>;

    /// Store `bytes` in the region starting at `address`.
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), RegionError>;

    /// The number of bytes between `base` and `brk`.
    fn heap_size(&self) -> u32 {
        self.brk() - self.base()
    }
}

/// A region backed by host memory, standing in for device RAM.
///
/// `limit` plays the part of the device's stack pointer: the region refuses
/// to grow past it.
#[derive(Clone, Debug)]
pub struct SimulatedRegion {
    base: u32,
    limit: u32,
    memory: Vec<u8>,
}

impl SimulatedRegion {
    /// Create an empty region at `base` that may grow up to `capacity` bytes.
    pub fn new(base: u32, capacity: u32) -> Self {
        SimulatedRegion {
            base,
            limit: base.saturating_add(capacity),
            memory: Vec::new(),
        }
    }

    /// The highest `brk` the region will grow to.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Move the limit, as a stack growing down towards the heap would.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    fn range(&self, address: u32, len: usize) -> Result<core::ops::Range<usize>, RegionError> {
        let start = address
            .checked_sub(self.base)
            .map(|offset| offset as usize)
            .filter(|start| start + len <= self.memory.len());
        match start {
            Some(start) => Ok(start..start + len),
            None => Err(RegionError::OutOfBounds { address, len }),
        }
    }
}

impl Region for SimulatedRegion {
    fn base(&self) -> u32 {
        self.base
    }

    fn brk(&self) -> u32 {
        // The memory never outgrows `limit - base`, which fits in a `u32`.
        self.base + self.memory.len() as u32
    }

    fn sbrk(&mut self, increment: u32) -> Result<u32, RegionError> {
        let brk = self.brk();
        match brk.checked_add(increment) {
            Some(end) if end <= self.limit => {
                self.memory.resize(self.memory.len() + increment as usize, 0);
                Ok(brk)
            }
            _ => Err(RegionError::Exhausted {
                brk,
                increment,
                limit: self.limit,
            }),
        }
    }

    fn reset(&mut self) {
        self.memory.clear();
    }

    fn copy(&mut self, dst: u32, src: u32, len: u32) -> Result<(), RegionError> {
        let src = self.range(src, len as usize)?;
        let dst = self.range(dst, len as usize)?;
        self.memory.copy_within(src, dst.start);
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), RegionError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), RegionError> {
        let range = self.range(address, bytes.len())?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// The device's stack-overflow watchdog check.
///
/// The stack grows down towards the heap's high end; once the gap between
/// them closes to `margin` bytes the device must halt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapGuard {
    /// The smallest gap allowed between the heap and the stack.
    pub margin: u32,
}

impl HeapGuard {
    /// Create a guard with the given margin in bytes.
    pub const fn new(margin: u32) -> Self {
        HeapGuard { margin }
    }

    /// Is the stack still clear of the heap?
    pub fn check(&self, heap_hi: u32, stack_pointer: u32) -> bool {
        u64::from(heap_hi) + u64::from(self.margin) <= u64::from(stack_pointer)
    }
}
