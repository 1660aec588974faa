//! Error types.

use alloc::string::{String, ToString};
use thiserror::Error;

/// A name that does not match any known value of a configuration enum.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
}

impl ParseNameError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        ParseNameError {
            kind,
            value: value.to_string(),
        }
    }
}

/// Errors from the allocator engine.
///
/// Running out of space is not an error: it is reported as "no fit".
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine was never initialized, or has been closed.
    #[error("the engine has no region to operate on")]
    NotReady,

    /// A grow would carry the region past the end of the address space.
    #[error("growing brk {brk:#010x} by {increment} overflows the address space")]
    AddressOverflow {
        /// The region's high end before the grow.
        brk: u32,
        /// The requested increment.
        increment: u32,
    },
}

/// The first structural invariant found broken by
/// [`Engine::verify`][crate::engine::Engine::verify].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Inconsistency {
    /// A block's neighbours do not link back to it.
    #[error("block {address:#010x} is not linked back by its neighbours")]
    BrokenLink {
        /// The block's address.
        address: u32,
    },

    /// The list has a hole or an overlap.
    #[error("block {address:#010x} does not start where its predecessor ends ({expected:#010x})")]
    Gap {
        /// The block's address.
        address: u32,
        /// Where its predecessor ends.
        expected: u32,
    },

    /// Two free blocks sit next to each other.
    #[error("block {address:#010x} and its predecessor are both free")]
    AdjacentFree {
        /// The second block's address.
        address: u32,
    },

    /// A free block is missing from the registry.
    #[error("free block {address:#010x} is not in the free registry")]
    Unregistered {
        /// The block's address.
        address: u32,
    },

    /// An allocated block is in the registry.
    #[error("allocated block {address:#010x} is in the free registry")]
    RegisteredAllocated {
        /// The block's address.
        address: u32,
    },

    /// A free block is in the wrong size class.
    #[error("free block {address:#010x} is registered in class {class} instead of {expected}")]
    Misclassified {
        /// The block's address.
        address: u32,
        /// The class it is registered in.
        class: usize,
        /// The class of its size.
        expected: usize,
    },

    /// The registry and the list disagree on how many blocks are free.
    #[error("the free registry holds {registered} blocks but the list has {free} free blocks")]
    RegistryCount {
        /// Blocks in the registry.
        registered: usize,
        /// Free blocks in the list.
        free: usize,
    },

    /// A block cannot be found through the index.
    #[error("block {address:#010x} is missing from the address index")]
    IndexMissing {
        /// The block's address.
        address: u32,
    },

    /// An index entry points at the wrong block.
    #[error("the address index maps {address:#010x} to a block that does not start there")]
    IndexStale {
        /// The entry's key.
        address: u32,
    },

    /// The index and the list disagree on how many blocks there are.
    #[error("the address index holds {indexed} entries for {blocks} blocks")]
    IndexCount {
        /// Entries in the index.
        indexed: usize,
        /// Blocks in the list.
        blocks: usize,
    },

    /// The list does not end at the tracked high end.
    #[error("the block list ends at {end:#010x} but brk is {brk:#010x}")]
    EndMismatch {
        /// Where the last block ends.
        end: u32,
        /// The tracked high end.
        brk: u32,
    },
}

/// Errors in framing, validating, or sequencing protocol messages.
///
/// Every one of these desynchronizes the session.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The device did not receive the handshake it expected.
    #[error("the first message from the host was not the handshake")]
    HandshakeMismatch,

    /// A frame carried an operation tag outside `0..=3`.
    #[error("unknown operation tag {0}")]
    UnknownOperation(u32),

    /// A grow frame set both of its fields.
    #[error("grow message carries both a size ({size}) and an address ({address:#010x})")]
    MalformedGrow {
        /// The frame's size field.
        size: u32,
        /// The frame's address field.
        address: u32,
    },

    /// `GrowBy(0)` and `SetOrigin(0)` would read back as the end of the
    /// session.
    #[error("a grow or origin message with a zero argument would read as the end of the session")]
    AmbiguousGrow,

    /// A grow increment that would leave later blocks misaligned.
    #[error("grow increment {0} is not a multiple of the allocation unit")]
    MisalignedGrow(u32),

    /// A heap origin that would leave every block misaligned.
    #[error("heap origin {0:#010x} is not aligned to the allocation unit")]
    MisalignedOrigin(u32),

    /// The device's first request was not `SetOrigin`.
    #[error("the device's first request did not set the heap origin")]
    MissingOrigin,

    /// A wide reply answered some other request.
    #[error("reply correlation id {actual} does not match request id {expected}")]
    CorrelationMismatch {
        /// The id of the request in flight.
        expected: u32,
        /// The id the reply carried.
        actual: u32,
    },

    /// The size does not fit the packed encoding's 30-bit field.
    #[error("size {0} does not fit in a packed 30-bit size field")]
    PackedSizeOverflow(u32),

    /// A frame of the wrong length for the codec.
    #[error("expected a {expected}-byte frame, got {actual} bytes")]
    FrameLength {
        /// The codec's frame length.
        expected: usize,
        /// The length actually given.
        actual: usize,
    },

    /// bincode failed to encode a frame.
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// bincode failed to decode a frame.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// A frame arrived after `EndSession` or an abort.
    #[error("message received after the session ended")]
    SessionEnded,
}

/// Errors moving bytes between the device and the host.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other end went away, or a short read hit end of stream.
    #[error("the connection is closed")]
    Closed,

    /// The underlying stream failed.
    #[cfg(feature = "std")]
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the device memory region.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    /// Growing would run past the region's limit.
    #[error("cannot grow brk {brk:#010x} by {increment} past the limit {limit:#010x}")]
    Exhausted {
        /// The high end before the grow.
        brk: u32,
        /// The requested increment.
        increment: u32,
        /// The highest `brk` the region allows.
        limit: u32,
    },

    /// An access outside `[base, brk)`.
    #[error("{len} bytes at {address:#010x} lie outside the region")]
    OutOfBounds {
        /// The first byte accessed.
        address: u32,
        /// The number of bytes accessed.
        len: usize,
    },
}

/// Errors from the device-side client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client halted after a bad handshake or a stack collision.
    #[error("the client has halted")]
    Halted,

    /// The session has not started, or has finished.
    #[error("the client is not running a session")]
    NotReady,

    /// The watchdog found the stack inside the heap's guard margin.
    #[error("stack pointer {stack_pointer:#010x} ran into the heap (brk {heap_hi:#010x})")]
    StackCollision {
        /// The heap's high end.
        heap_hi: u32,
        /// The stack pointer the watchdog saw.
        stack_pointer: u32,
    },

    /// A protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A region error.
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Errors from a host session.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A frame was handled before the handshake was produced.
    #[error("a frame arrived before the handshake was sent")]
    NotStarted,

    /// A protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors parsing or replaying an allocation trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The trace text is malformed.
    #[error("line {line}: {message}")]
    Parse {
        /// The 1-based line number, or 0 for a truncated header.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// A replay correctness check failed.
    #[error("op {op}: {message}")]
    Check {
        /// The index of the failing operation.
        op: usize,
        /// What was wrong.
        message: String,
    },

    /// The client failed while replaying.
    #[error("op {op}: {source}")]
    Client {
        /// The index of the failing operation.
        op: usize,
        /// The client's error.
        source: ClientError,
    },
}
