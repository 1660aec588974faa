//! The host side of one protocol session.

use crate::engine::{Engine, EngineConfig};
use crate::error::{ProtocolError, ServerError};
use crate::protocol::{Codec, Reply, Request};
use crate::transport::Transport;
use alloc::{vec, vec::Vec};
use core::fmt;

/// Where a [`HostSession`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The handshake has not been sent yet.
    Handshake,

    /// Waiting for the device to announce its heap origin.
    AwaitingOrigin,

    /// Answering requests.
    Serving,

    /// The device ended the session, or the session aborted.
    Ended,
}

/// What the host does in response to one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Send these bytes back to the device.
    Reply(Vec<u8>),

    /// Nothing to send.
    Silent,

    /// The device ended the session.
    Ended,
}

/// Per-operation counters for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Allocate requests served.
    pub allocations: u64,
    /// Allocate requests answered with "no fit".
    pub failed_allocations: u64,
    /// Deallocate requests served.
    pub deallocations: u64,
    /// Resize requests served.
    pub resizes: u64,
    /// Resize requests that could not be done in place.
    pub failed_resizes: u64,
    /// Grow requests served.
    pub grows: u64,
    /// Total bytes the region grew by.
    pub grown_bytes: u64,
    /// Origin announcements after the first.
    pub resets: u64,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocations ({} without fit), {} deallocations, {} resizes ({} not in place), \
             {} grows ({} bytes), {} resets",
            self.allocations,
            self.failed_allocations,
            self.deallocations,
            self.resizes,
            self.failed_resizes,
            self.grows,
            self.grown_bytes,
            self.resets
        )
    }
}

/// The host's state for one connection: an [`Engine`] plus the session
/// protocol around it.
#[derive(Debug)]
pub struct HostSession {
    codec: Codec,
    engine: Engine,
    state: SessionState,
    summary: SessionSummary,
}

impl HostSession {
    /// Create a session that has not sent its handshake yet.
    pub fn new(codec: Codec, config: EngineConfig) -> Self {
        HostSession {
            codec,
            engine: Engine::new(config),
            state: SessionState::Handshake,
            summary: SessionSummary::default(),
        }
    }

    /// The session's frame layout.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// The engine mirroring the device's region.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Where the session is in its lifecycle.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The counters so far.
    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Produce the handshake frame that opens the session.
    pub fn handshake(&mut self) -> Result<Vec<u8>, ServerError> {
        if self.state != SessionState::Handshake {
            return Err(ProtocolError::HandshakeMismatch.into());
        }
        let bytes = self.codec.handshake()?;
        log::info!("session: sending {} handshake", self.codec);
        self.state = SessionState::AwaitingOrigin;
        Ok(bytes)
    }

    fn abort(&mut self, error: ServerError) -> ServerError {
        log::error!("session: aborting: {error}");
        self.engine.close();
        self.state = SessionState::Ended;
        error
    }

    /// Handle one request frame from the device.
    ///
    /// Any error ends the session.
    pub fn handle(&mut self, frame: &[u8]) -> Result<Outcome, ServerError> {
        match self.state {
            SessionState::Handshake => return Err(ServerError::NotStarted),
            SessionState::Ended => return Err(ProtocolError::SessionEnded.into()),
            SessionState::AwaitingOrigin | SessionState::Serving => {}
        }

        let (id, request) = match self.codec.decode_request(frame) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.abort(e.into())),
        };
        log::debug!("session: request {id}: {request:?}");

        if self.state == SessionState::AwaitingOrigin {
            let Request::SetOrigin(origin) = request else {
                return Err(self.abort(ProtocolError::MissingOrigin.into()));
            };
            self.engine.init(origin);
            self.state = SessionState::Serving;
            return Ok(Outcome::Silent);
        }

        let outcome = match self.serve_request(id, request) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abort(e)),
        };
        debug_assert_eq!(
            matches!(outcome, Outcome::Reply(_)),
            request.expects_reply()
        );
        log::trace!("session: heap after request {id}:\n{}", self.engine);
        Ok(outcome)
    }

    fn serve_request(&mut self, id: u32, request: Request) -> Result<Outcome, ServerError> {
        let address = match request {
            Request::Allocate { size } => {
                let address = self.engine.allocate(size)?;
                self.summary.allocations += 1;
                self.summary.failed_allocations += u64::from(address.is_none());
                address
            }
            Request::Resize { address, size } => {
                let resized = self.engine.resize(address, size)?;
                self.summary.resizes += 1;
                self.summary.failed_resizes += u64::from(resized.is_none());
                resized
            }
            Request::Deallocate { address } => {
                self.engine.deallocate(address)?;
                self.summary.deallocations += 1;
                return Ok(Outcome::Silent);
            }
            Request::GrowBy(increment) => {
                self.engine.grow(increment)?;
                self.summary.grows += 1;
                self.summary.grown_bytes += u64::from(increment);
                return Ok(Outcome::Silent);
            }
            Request::SetOrigin(origin) => {
                self.engine.init(origin);
                self.summary.resets += 1;
                return Ok(Outcome::Silent);
            }
            Request::EndSession => {
                self.engine.close();
                self.state = SessionState::Ended;
                log::info!("session: ended: {}", self.summary);
                return Ok(Outcome::Ended);
            }
        };

        let reply = self.codec.encode_reply(&Reply { id, address })?;
        Ok(Outcome::Reply(reply))
    }

    /// Run a whole session over `transport`: send the handshake, then serve
    /// requests until the device ends the session.
    pub fn serve<T: Transport>(&mut self, mut transport: T) -> Result<SessionSummary, ServerError> {
        let handshake = self.handshake()?;
        if let Err(e) = transport.send(&handshake) {
            return Err(self.abort(e.into()));
        }

        let mut frame = vec![0; self.codec.request_len()];
        loop {
            if let Err(e) = transport.receive(&mut frame) {
                return Err(self.abort(e.into()));
            }
            match self.handle(&frame)? {
                Outcome::Reply(reply) => {
                    if let Err(e) = transport.send(&reply) {
                        return Err(self.abort(e.into()));
                    }
                }
                Outcome::Silent => {}
                Outcome::Ended => return Ok(self.summary),
            }
        }
    }
}
