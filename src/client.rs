//! The device side of the protocol.
//!
//! The [`Client`] is what application code on the device calls instead of a
//! local allocator. It owns the device's [`Region`], forwards every request to
//! the host, and extends the region (and tells the host about it) when the
//! host reports that nothing fits.

use crate::engine::aligned_size;
use crate::error::{ClientError, ProtocolError};
use crate::protocol::{Codec, Encoding, Request};
use crate::region::{HeapGuard, Region};
use crate::transport::Transport;
use alloc::vec;

/// The capability to talk to the transport hardware.
///
/// Some devices only allow privileged code to touch the link, so the client
/// acquires the capability before each request and releases it afterwards.
pub trait Privilege {
    /// Gain the right to use the link.
    fn acquire(&mut self);

    /// Give the right back.
    fn release(&mut self);
}

/// For devices where any code may use the link.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unprivileged;

impl Privilege for Unprivileged {
    fn acquire(&mut self) {}
    fn release(&mut self) {}
}

/// Configuration for a [`Client`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// The frame layout shared with the host.
    pub codec: Codec,

    /// How many bytes to grow the region by when the session starts.
    pub initial_heap: u32,

    /// The minimum number of bytes to grow the region by when an allocation
    /// does not fit.
    pub chunk_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            codec: Codec::default(),
            initial_heap: 4096,
            chunk_size: 4096,
        }
    }
}

impl ClientConfig {
    /// Set the frame layout.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set how many bytes to grow the region by when the session starts.
    pub fn initial_heap(mut self, bytes: u32) -> Self {
        self.initial_heap = bytes;
        self
    }

    /// Set the minimum number of bytes to grow by on a failed allocation.
    pub fn chunk_size(mut self, bytes: u32) -> Self {
        self.chunk_size = bytes;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Running,
    Finished,
    Halted,
}

/// A device-side allocator that delegates every decision to the host.
#[derive(Debug)]
pub struct Client<T, R, P = Unprivileged> {
    transport: T,
    region: R,
    privilege: P,
    config: ClientConfig,
    state: State,
    next_id: u32,
}

impl<T: Transport, R: Region> Client<T, R> {
    /// Create a client for a link any code may use. Call
    /// [`init`][Client::init] before anything else.
    pub fn new(transport: T, region: R, config: ClientConfig) -> Self {
        Client::with_privilege(transport, region, Unprivileged, config)
    }
}

impl<T, R, P> Client<T, R, P>
where
    T: Transport,
    R: Region,
    P: Privilege,
{
    /// Create a client that holds `privilege` around every request.
    pub fn with_privilege(transport: T, region: R, privilege: P, config: ClientConfig) -> Self {
        Client {
            transport,
            region,
            privilege,
            config,
            state: State::Uninitialized,
            next_id: 0,
        }
    }

    /// The device heap region.
    pub fn region(&self) -> &R {
        &self.region
    }

    /// Direct access to the region, for the application to read and write
    /// its allocations.
    pub fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }

    /// The link to the host.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Take the client apart.
    pub fn into_parts(self) -> (T, R, P) {
        (self.transport, self.region, self.privilege)
    }

    /// Has the client halted for good?
    pub fn is_halted(&self) -> bool {
        self.state == State::Halted
    }

    fn running(&self) -> Result<(), ClientError> {
        match self.state {
            State::Running => Ok(()),
            State::Halted => Err(ClientError::Halted),
            State::Uninitialized | State::Finished => Err(ClientError::NotReady),
        }
    }

    /// Run `f` while holding the privilege capability.
    fn privileged<U>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<U, ClientError>,
    ) -> Result<U, ClientError> {
        self.privilege.acquire();
        let result = f(self);
        self.privilege.release();
        result
    }

    fn send(&mut self, request: Request) -> Result<u32, ClientError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let frame = self.config.codec.encode_request(id, &request)?;
        log::debug!("client: request {id}: {request:?}");
        self.transport.send(&frame)?;
        Ok(id)
    }

    /// Send a request the host answers with an address.
    fn request_address(&mut self, request: Request) -> Result<Option<u32>, ClientError> {
        let id = self.send(request)?;
        let mut buf = vec![0; self.config.codec.reply_len()];
        self.transport.receive(&mut buf)?;
        let reply = self.config.codec.decode_reply(&buf)?;
        if self.config.codec.encoding == Encoding::Wide && reply.id != id {
            return Err(ProtocolError::CorrelationMismatch {
                expected: id,
                actual: reply.id,
            }
            .into());
        }
        Ok(reply.address)
    }

    /// Extend the region and tell the host. Returns `false` when the region
    /// cannot grow.
    fn grow(&mut self, increment: u32) -> Result<bool, ClientError> {
        if increment == 0 {
            return Ok(true);
        }
        if let Err(e) = self.region.sbrk(increment) {
            log::warn!("client: {e}");
            return Ok(false);
        }
        self.send(Request::GrowBy(increment))?;
        Ok(true)
    }

    /// Wait for the host's handshake, announce the region's origin, and grow
    /// the initial heap.
    pub fn init(&mut self) -> Result<(), ClientError> {
        if self.state == State::Halted {
            return Err(ClientError::Halted);
        }
        self.privileged(|client| {
            let mut handshake = vec![0; client.config.codec.reply_len()];
            let checked = client
                .transport
                .receive(&mut handshake)
                .map_err(ClientError::from)
                .and_then(|()| Ok(client.config.codec.check_handshake(&handshake)?));
            if let Err(e) = checked {
                log::error!("client: no valid handshake: {e}");
                client.state = State::Halted;
                return Err(e);
            }

            client.region.reset();
            client.send(Request::SetOrigin(client.region.base()))?;
            client.state = State::Running;

            let initial = aligned_size(client.config.initial_heap).unwrap_or(0);
            if client.config.initial_heap > 0 && !client.grow(initial)? {
                log::warn!("client: could not grow the initial {initial}-byte heap");
            }
            Ok(())
        })
    }

    /// Allocate `size` bytes, growing the region once if the host finds no
    /// room. `Ok(None)` means out of memory.
    pub fn allocate(&mut self, size: u32) -> Result<Option<u32>, ClientError> {
        self.running()?;
        if size == 0 {
            return Ok(None);
        }
        self.privileged(|client| client.allocate_with_retry(size))
    }

    fn allocate_with_retry(&mut self, size: u32) -> Result<Option<u32>, ClientError> {
        if let Some(address) = self.request_address(Request::Allocate { size })? {
            return Ok(Some(address));
        }

        let Some(needed) = aligned_size(size) else {
            return Ok(None);
        };
        let increment = aligned_size(needed.max(self.config.chunk_size)).unwrap_or(needed);
        if !self.grow(increment)? {
            return Ok(None);
        }
        let address = self.request_address(Request::Allocate { size })?;
        if address.is_none() {
            log::debug!("client: allocate({size}) out of memory after growing");
        }
        Ok(address)
    }

    /// Free the allocation at `address`. The host does not answer.
    pub fn deallocate(&mut self, address: u32) -> Result<(), ClientError> {
        self.running()?;
        self.privileged(|client| client.send(Request::Deallocate { address }).map(drop))
    }

    /// Resize the allocation at `address` to `size` bytes, moving it (and its
    /// contents) if it cannot be resized in place.
    ///
    /// A zero `address` allocates. A zero `size` frees and returns `None`. When
    /// the allocation has to move and no room can be found, `Ok(None)` is
    /// returned and the original allocation is left untouched.
    pub fn resize(&mut self, address: u32, size: u32) -> Result<Option<u32>, ClientError> {
        self.running()?;
        if address == 0 {
            return self.allocate(size);
        }
        if size == 0 {
            self.deallocate(address)?;
            return Ok(None);
        }

        self.privileged(|client| {
            if let Some(resized) = client.request_address(Request::Resize { address, size })? {
                return Ok(Some(resized));
            }
            if !(client.region.base()..client.region.brk()).contains(&address) {
                log::warn!("client: resize of {address:#010x}, which is outside the heap");
                return Ok(None);
            }
            let Some(moved) = client.allocate_with_retry(size)? else {
                return Ok(None);
            };
            let len = size.min(client.region.brk() - address);
            client.region.copy(moved, address, len)?;
            client.send(Request::Deallocate { address })?;
            Ok(Some(moved))
        })
    }

    /// Rewind the region to empty and have the host start over.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.running()?;
        self.privileged(|client| {
            client.region.reset();
            client.send(Request::SetOrigin(client.region.base())).map(drop)
        })
    }

    /// End the session.
    pub fn finish(&mut self) -> Result<(), ClientError> {
        self.running()?;
        self.privileged(|client| client.send(Request::EndSession))?;
        self.state = State::Finished;
        Ok(())
    }

    /// The periodic stack check. If the stack has run into the heap, end the
    /// session and halt; every later call fails with [`ClientError::Halted`].
    pub fn watchdog(&mut self, guard: &HeapGuard, stack_pointer: u32) -> Result<(), ClientError> {
        let heap_hi = self.region.brk();
        if guard.check(heap_hi, stack_pointer) {
            return Ok(());
        }

        log::error!(
            "client: stack pointer {stack_pointer:#010x} ran into the heap at {heap_hi:#010x}"
        );
        if self.state == State::Running {
            let _ = self.privileged(|client| client.send(Request::EndSession));
        }
        self.state = State::Halted;
        Err(ClientError::StackCollision {
            heap_hi,
            stack_pointer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, EngineState, FitPolicy};
    use crate::protocol::Endian;
    use crate::region::SimulatedRegion;
    use crate::server::{HostSession, SessionState};
    use crate::error::TransportError;
    use crate::transport::Loopback;

    type TestClient<P = Unprivileged> = Client<Loopback, SimulatedRegion, P>;

    fn connect(config: ClientConfig, base: u32, capacity: u32) -> TestClient {
        let _ = env_logger::try_init();
        let session = HostSession::new(
            config.codec,
            EngineConfig::default().policy(FitPolicy::FirstFit),
        );
        let mut client = Client::new(
            Loopback::new(session).unwrap(),
            SimulatedRegion::new(base, capacity),
            config,
        );
        client.init().unwrap();
        client
    }

    fn small_chunks() -> ClientConfig {
        ClientConfig::default().initial_heap(32).chunk_size(32)
    }

    #[test]
    fn end_to_end_first_fit_scenario() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        assert_eq!(client.allocate(16).unwrap(), Some(0x1000));
        assert_eq!(client.allocate(16).unwrap(), Some(0x1010));
        client.deallocate(0x1000).unwrap();

        // The freed hole is too small and the heap is full: the host reports
        // no fit, the client grows by a chunk and the retry lands at the old
        // high end.
        assert_eq!(client.region().brk(), 0x1020);
        assert_eq!(client.allocate(32).unwrap(), Some(0x1020));
        assert_eq!(client.region().brk(), 0x1040);

        let engine = client.transport().session().engine();
        assert_eq!(engine.heap_hi(), Some(0x1040));
        engine.verify().unwrap();

        client.finish().unwrap();
        let session = client.transport().session();
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.summary().failed_allocations, 1);
        assert!(matches!(client.allocate(8), Err(ClientError::NotReady)));
    }

    #[test]
    fn unaligned_chunk_sizes_are_rounded_up() {
        let config = ClientConfig::default().initial_heap(0).chunk_size(20);
        let mut client = connect(config, 0x1000, 4096);
        assert_eq!(client.allocate(8).unwrap(), Some(0x1000));
        assert_eq!(client.region().brk(), 0x1018);
        assert_eq!(client.allocate(8).unwrap(), Some(0x1008));
        client.transport().session().engine().verify().unwrap();
    }

    #[test]
    fn packed_sessions_work_too() {
        let config = small_chunks().codec(Codec::new(Encoding::Packed, Endian::Big));
        let mut client = connect(config, 0x2000_0000, 4096);
        let a = client.allocate(100).unwrap().unwrap();
        let b = client.allocate(100).unwrap().unwrap();
        assert_ne!(a, b);
        client.finish().unwrap();
    }

    #[test]
    fn allocation_fails_once_the_region_is_exhausted() {
        let mut client = connect(small_chunks(), 0x1000, 64);
        assert_eq!(client.allocate(64).unwrap(), None);
        assert_eq!(client.allocate(32).unwrap(), Some(0x1000));
        assert_eq!(client.allocate(32).unwrap(), Some(0x1020));
        assert_eq!(client.allocate(8).unwrap(), None);
        assert_eq!(client.allocate(0).unwrap(), None);
    }

    #[test]
    fn resize_moves_contents_when_it_cannot_grow_in_place() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        let a = client.allocate(8).unwrap().unwrap();
        let _b = client.allocate(8).unwrap().unwrap();
        client
            .region
            .write(a, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        let moved = client.resize(a, 24).unwrap().unwrap();
        assert_ne!(moved, a);
        let mut buf = [0; 8];
        client.region().read(moved, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        // The old block was freed on the host.
        let engine = client.transport().session().engine();
        let old = engine.blocks().find(|b| b.address == a).unwrap();
        assert!(!old.allocated);
        engine.verify().unwrap();
    }

    #[test]
    fn resize_special_cases() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        let a = client.resize(0, 16).unwrap().unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(client.resize(a, 8).unwrap(), Some(a));
        assert_eq!(client.resize(a, 0).unwrap(), None);

        let engine = client.transport().session().engine();
        assert!(engine.blocks().all(|b| !b.allocated));
    }

    #[test]
    fn reset_rewinds_both_sides() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        client.allocate(16).unwrap();
        client.reset().unwrap();
        assert_eq!(client.region().brk(), 0x1000);
        assert_eq!(
            client.transport().session().engine().heap_size(),
            Some(0)
        );
        assert_eq!(client.allocate(16).unwrap(), Some(0x1000));
    }

    /// A link whose host side is a fixed byte sequence.
    struct Canned {
        inbox: alloc::collections::VecDeque<u8>,
        sent: usize,
    }

    impl Transport for Canned {
        fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent += bytes.len();
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
            if self.inbox.len() < buf.len() {
                return Err(TransportError::Closed);
            }
            for b in buf.iter_mut() {
                *b = self.inbox.pop_front().ok_or(TransportError::Closed)?;
            }
            Ok(())
        }
    }

    #[test]
    fn wrong_handshake_halts_without_sending_anything() {
        let _ = env_logger::try_init();
        for codec in [
            Codec::new(Encoding::Wide, Endian::Little),
            Codec::new(Encoding::Packed, Endian::Big),
        ] {
            // A frame of the right length with one field off.
            let mut frame = codec.handshake().unwrap();
            let last = frame.len() - 1;
            frame[last] ^= 0x02;

            let mut client = Client::new(
                Canned {
                    inbox: frame.into_iter().collect(),
                    sent: 0,
                },
                SimulatedRegion::new(0x1000, 4096),
                ClientConfig::default().codec(codec),
            );
            assert!(matches!(
                client.init(),
                Err(ClientError::Protocol(ProtocolError::HandshakeMismatch))
            ));
            assert!(client.is_halted());
            assert_eq!(client.transport().sent, 0);
            assert_eq!(client.region().brk(), 0x1000);
            assert!(matches!(client.init(), Err(ClientError::Halted)));
        }
    }

    #[test]
    fn allocation_fails_when_the_stack_limit_moves_down() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        assert_eq!(client.region().limit(), 0x2000);
        let brk = client.region().brk();
        client.region_mut().set_limit(brk + 16);

        assert_eq!(client.allocate(32).unwrap(), Some(0x1000));
        // Growing by a whole chunk would cross the limit.
        assert_eq!(client.allocate(8).unwrap(), None);
        assert_eq!(client.region().brk(), brk);
        client.transport().session().engine().verify().unwrap();
    }

    #[test]
    fn closed_link_before_the_handshake_halts() {
        let _ = env_logger::try_init();
        let codec = Codec::default();
        let session = HostSession::new(
            Codec::new(Encoding::Packed, Endian::Little),
            EngineConfig::default(),
        );
        let mut client = Client::new(
            Loopback::new(session).unwrap(),
            SimulatedRegion::new(0x1000, 4096),
            ClientConfig::default().codec(codec),
        );
        // The packed handshake is too short to be a wide handshake, so the
        // wide client runs out of bytes.
        assert!(client.init().is_err());
        assert!(client.is_halted());
        assert!(matches!(client.allocate(8), Err(ClientError::Halted)));
        assert_eq!(
            client.transport().session().engine().state(),
            EngineState::Uninitialized
        );
    }

    #[test]
    fn watchdog_ends_the_session_and_halts() {
        let mut client = connect(small_chunks(), 0x1000, 4096);
        let guard = HeapGuard::new(0);
        client.watchdog(&guard, 0x8000).unwrap();

        assert!(matches!(
            client.watchdog(&guard, 0x1010),
            Err(ClientError::StackCollision {
                heap_hi: 0x1020,
                stack_pointer: 0x1010
            })
        ));
        assert_eq!(
            client.transport().session().state(),
            SessionState::Ended
        );
        assert!(matches!(client.allocate(8), Err(ClientError::Halted)));
        assert!(matches!(client.finish(), Err(ClientError::Halted)));
    }

    #[derive(Default)]
    struct CountingPrivilege {
        held: bool,
        acquisitions: usize,
    }

    impl Privilege for CountingPrivilege {
        fn acquire(&mut self) {
            assert!(!self.held);
            self.held = true;
            self.acquisitions += 1;
        }

        fn release(&mut self) {
            assert!(self.held);
            self.held = false;
        }
    }

    #[test]
    fn every_request_runs_privileged() {
        let _ = env_logger::try_init();
        let config = small_chunks();
        let session = HostSession::new(config.codec, EngineConfig::default());
        let mut client: TestClient<CountingPrivilege> = Client::with_privilege(
            Loopback::new(session).unwrap(),
            SimulatedRegion::new(0x1000, 4096),
            CountingPrivilege::default(),
            config,
        );
        client.init().unwrap();
        let a = client.allocate(8).unwrap().unwrap();
        client.deallocate(a).unwrap();
        client.finish().unwrap();

        let (_, _, privilege) = client.into_parts();
        assert!(!privilege.held);
        assert_eq!(privilege.acquisitions, 4);
    }
}
