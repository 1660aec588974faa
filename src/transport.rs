//! Byte transports between the device and the host.
//!
//! The protocol assumes a reliable, ordered link and never times out, so a
//! transport only has to move exact byte counts.

use crate::error::{ServerError, TransportError};
use crate::server::{HostSession, Outcome};
use alloc::{collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

/// A reliable, ordered, blocking byte link.
pub trait Transport {
    /// Send all of `bytes`.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block until `buf` is completely filled.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).receive(buf)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use std::io::{self, Read, Write};

        /// A transport over a blocking byte stream, such as a serial device
        /// file or a socket.
        #[derive(Debug)]
        pub struct Stream<S> {
            inner: S,
        }

        impl<S: Read + Write> Stream<S> {
            /// Wrap a stream.
            pub fn new(inner: S) -> Self {
                Stream { inner }
            }

            /// Unwrap the stream.
            pub fn into_inner(self) -> S {
                self.inner
            }
        }

        impl<S: Read + Write> Transport for Stream<S> {
            fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
                self.inner.write_all(bytes)?;
                self.inner.flush()?;
                Ok(())
            }

            fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
                self.inner.read_exact(buf).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => TransportError::Closed,
                    _ => TransportError::Io(e),
                })
            }
        }
    }
}

/// A busy-wait flag set by a transfer-complete interrupt.
///
/// The interrupt handler only ever calls [`complete`][Self::complete].
#[derive(Debug, Default)]
pub struct CompletionFlag(AtomicBool);

impl CompletionFlag {
    /// Create a flag with no transfer in flight.
    pub const fn new() -> Self {
        CompletionFlag(AtomicBool::new(false))
    }

    /// Mark a transfer as in flight.
    pub fn arm(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Mark the in-flight transfer as finished.
    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Has the last armed transfer finished?
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Spin until the in-flight transfer finishes.
    pub fn wait(&self) {
        while !self.is_complete() {
            core::hint::spin_loop();
        }
    }
}

/// Block-transfer hardware, such as a DMA-driven UART.
///
/// A transfer is started, then runs without the CPU until the hardware's
/// transfer-complete interrupt sets the matching [`CompletionFlag`].
pub trait BlockTransfer {
    /// Begin transmitting `bytes`.
    fn start_send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Begin receiving `len` bytes into the hardware's buffer.
    fn start_receive(&mut self, len: usize) -> Result<(), TransportError>;

    /// Copy a finished reception out of the hardware's buffer.
    fn take_received(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// The flag the transmit-complete interrupt sets.
    fn send_done(&self) -> &CompletionFlag;

    /// The flag the receive-complete interrupt sets.
    fn receive_done(&self) -> &CompletionFlag;
}

/// A transport over [`BlockTransfer`] hardware that busy-waits on the
/// completion flags.
#[derive(Debug)]
pub struct BlockTransport<H> {
    hardware: H,
}

impl<H: BlockTransfer> BlockTransport<H> {
    /// Drive `hardware`.
    pub fn new(hardware: H) -> Self {
        BlockTransport { hardware }
    }

    /// The driven hardware.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Give the hardware back.
    pub fn into_inner(self) -> H {
        self.hardware
    }
}

impl<H: BlockTransfer> Transport for BlockTransport<H> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.hardware.send_done().arm();
        self.hardware.start_send(bytes)?;
        self.hardware.send_done().wait();
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.hardware.receive_done().arm();
        self.hardware.start_receive(buf.len())?;
        self.hardware.receive_done().wait();
        self.hardware.take_received(buf)
    }
}

/// An in-process link from a device-side client straight into a
/// [`HostSession`].
///
/// Request frames sent by the client are handed to the session as soon as a
/// whole frame has arrived; the session's replies queue up for the client to
/// receive. The session's handshake is queued on construction.
#[derive(Debug)]
pub struct Loopback {
    session: HostSession,
    pending: Vec<u8>,
    inbox: VecDeque<u8>,
    failure: Option<ServerError>,
}

impl Loopback {
    /// Connect to `session`, queueing its handshake for the client.
    pub fn new(mut session: HostSession) -> Result<Self, ServerError> {
        let handshake = session.handshake()?;
        Ok(Loopback {
            session,
            pending: Vec::new(),
            inbox: handshake.into_iter().collect(),
            failure: None,
        })
    }

    /// The host end of the link.
    pub fn session(&self) -> &HostSession {
        &self.session
    }

    /// Disconnect, returning the host end.
    pub fn into_session(self) -> HostSession {
        self.session
    }

    /// The error that made the host drop the connection, if any.
    pub fn failure(&self) -> Option<&ServerError> {
        self.failure.as_ref()
    }
}

impl Transport for Loopback {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.failure.is_some() {
            return Err(TransportError::Closed);
        }
        self.pending.extend_from_slice(bytes);

        let frame_len = self.session.codec().request_len();
        while self.pending.len() >= frame_len {
            let frame: Vec<u8> = self.pending.drain(..frame_len).collect();
            match self.session.handle(&frame) {
                Ok(Outcome::Reply(reply)) => self.inbox.extend(reply),
                Ok(Outcome::Silent | Outcome::Ended) => {}
                Err(e) => {
                    log::error!("loopback: host dropped the connection: {e}");
                    self.failure = Some(e);
                    return Err(TransportError::Closed);
                }
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let len = buf.len();
        if self.inbox.len() < len {
            return Err(TransportError::Closed);
        }
        for (dst, src) in buf.iter_mut().zip(self.inbox.drain(..len)) {
            *dst = src;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::protocol::{Codec, Request};
    use crate::server::SessionState;

    /// Hardware that finishes every transfer immediately, echoing what it sent.
    #[derive(Default)]
    struct EchoHardware {
        wire: VecDeque<u8>,
        receiving: usize,
        send_done: CompletionFlag,
        receive_done: CompletionFlag,
    }

    impl BlockTransfer for EchoHardware {
        fn start_send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.wire.extend(bytes);
            self.send_done.complete();
            Ok(())
        }

        fn start_receive(&mut self, len: usize) -> Result<(), TransportError> {
            if self.wire.len() < len {
                return Err(TransportError::Closed);
            }
            self.receiving = len;
            self.receive_done.complete();
            Ok(())
        }

        fn take_received(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
            assert_eq!(buf.len(), self.receiving);
            for b in buf.iter_mut() {
                *b = self.wire.pop_front().ok_or(TransportError::Closed)?;
            }
            Ok(())
        }

        fn send_done(&self) -> &CompletionFlag {
            &self.send_done
        }

        fn receive_done(&self) -> &CompletionFlag {
            &self.receive_done
        }
    }

    #[test]
    fn block_transport_waits_for_completion() {
        let mut transport = BlockTransport::new(EchoHardware::default());
        transport.send(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0; 4];
        transport.receive(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(transport.hardware().receive_done().is_complete());
        assert!(matches!(
            transport.receive(&mut buf),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn completion_flag_rearms() {
        let flag = CompletionFlag::new();
        flag.complete();
        flag.wait();
        flag.arm();
        assert!(!flag.is_complete());
    }

    #[test]
    fn loopback_delivers_frames_in_pieces() {
        let codec = Codec::default();
        let mut loopback =
            Loopback::new(HostSession::new(codec, EngineConfig::default())).unwrap();

        let mut handshake = [0; 8];
        loopback.receive(&mut handshake).unwrap();
        codec.check_handshake(&handshake).unwrap();

        let origin = codec.encode_request(0, &Request::SetOrigin(0x1000)).unwrap();
        let grow = codec.encode_request(1, &Request::GrowBy(64)).unwrap();
        let allocate = codec
            .encode_request(2, &Request::Allocate { size: 8 })
            .unwrap();
        loopback.send(&origin[..5]).unwrap();
        loopback.send(&origin[5..]).unwrap();
        loopback.send(&[grow, allocate].concat()).unwrap();

        let mut reply = [0; 8];
        loopback.receive(&mut reply).unwrap();
        let reply = codec.decode_reply(&reply).unwrap();
        assert_eq!(reply.id, 2);
        assert_eq!(reply.address, Some(0x1000));
        assert_eq!(loopback.session().state(), SessionState::Serving);

        let session = loopback.into_session();
        assert_eq!(session.summary().allocations, 1);
        assert_eq!(session.summary().grown_bytes, 64);
    }

    #[test]
    fn loopback_closes_when_the_host_fails() {
        let codec = Codec::default();
        let mut loopback =
            Loopback::new(HostSession::new(codec, EngineConfig::default())).unwrap();
        let allocate = codec
            .encode_request(0, &Request::Allocate { size: 8 })
            .unwrap();
        assert!(matches!(
            loopback.send(&allocate),
            Err(TransportError::Closed)
        ));
        assert!(loopback.failure().is_some());
        assert!(matches!(
            loopback.send(&allocate),
            Err(TransportError::Closed)
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn stream_reports_eof_as_closed() {
        use std::io::Cursor;

        let mut transport = Stream::new(Cursor::new(std::vec![7u8, 8, 9]));
        let mut buf = [0; 2];
        transport.receive(&mut buf).unwrap();
        assert_eq!(buf, [7, 8]);
        assert!(matches!(
            transport.receive(&mut buf),
            Err(TransportError::Closed)
        ));
    }
}
