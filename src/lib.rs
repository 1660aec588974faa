#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod client;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod region;
pub mod server;
pub mod trace;
pub mod transport;

pub use client::{Client, ClientConfig, Privilege, Unprivileged};
pub use engine::{Engine, EngineConfig, FitPolicy, Lookup};
pub use error::{
    ClientError, EngineError, Inconsistency, ProtocolError, RegionError, ServerError,
    TraceError, TransportError,
};
pub use protocol::{Codec, Encoding, Endian, Reply, Request};
pub use region::{HeapGuard, Region, SimulatedRegion};
pub use server::{HostSession, Outcome, SessionState, SessionSummary};
pub use transport::{BlockTransfer, BlockTransport, CompletionFlag, Loopback, Transport};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        pub use transport::Stream;
    }
}
