//! Wire framing for requests, replies, and the session handshake.
//!
//! Every message is a fixed-size record of fixed-width integers, serialized
//! with bincode in the deployment's byte order. There are two encodings:
//!
//! * [`Encoding::Wide`] frames carry four full `u32` fields (operation,
//!   correlation id, size, address) for 16 bytes. Replies echo the id next to
//!   the address for 8 bytes.
//!
//! * [`Encoding::Packed`] frames squeeze a 2-bit operation tag and a 30-bit size
//!   into one word, followed by the address, for 8 bytes. Replies are the bare
//!   address. There is no correlation id: at most one request is outstanding.
//!
//! The host opens a session by sending a reply-sized handshake whose every
//! field is 1. All device-side grow, origin, and end-of-session messages share
//! the grow operation and are told apart by which of size and address are zero.

use crate::engine::ALIGNMENT;
use crate::error::{ParseNameError, ProtocolError};
use alloc::{format, vec::Vec};
use bincode::{config, Decode, Encode};
use core::{fmt, str::FromStr};

/// Frame operation tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    /// Allocate a block.
    Allocate = 0,
    /// Free a block.
    Deallocate = 1,
    /// Resize a block in place.
    Resize = 2,
    /// Grow the region, set its origin, or end the session.
    Grow = 3,
}

impl TryFrom<u32> for Operation {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Operation::Allocate),
            1 => Ok(Operation::Deallocate),
            2 => Ok(Operation::Resize),
            3 => Ok(Operation::Grow),
            _ => Err(ProtocolError::UnknownOperation(tag)),
        }
    }
}

/// A request from the device to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Choose an address for `size` bytes.
    Allocate {
        /// The requested size in bytes.
        size: u32,
    },

    /// Free the block at `address`.
    Deallocate {
        /// The block's address.
        address: u32,
    },

    /// Resize the block at `address` in place to `size` bytes.
    Resize {
        /// The block's address.
        address: u32,
        /// The new size in bytes.
        size: u32,
    },

    /// The device extended its region by this many bytes.
    GrowBy(u32),

    /// The device's (possibly reset) region starts at this address.
    SetOrigin(u32),

    /// The device is done; the host discards its view of the region.
    EndSession,
}

impl Request {
    /// The frame tag this request travels under.
    pub fn operation(&self) -> Operation {
        match self {
            Request::Allocate { .. } => Operation::Allocate,
            Request::Deallocate { .. } => Operation::Deallocate,
            Request::Resize { .. } => Operation::Resize,
            Request::GrowBy(_) | Request::SetOrigin(_) | Request::EndSession => Operation::Grow,
        }
    }

    /// Does the host answer this request?
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Allocate { .. } | Request::Resize { .. })
    }

    /// Flatten into `(operation, size, address)` wire fields.
    fn fields(&self) -> Result<(Operation, u32, u32), ProtocolError> {
        let operation = self.operation();
        match *self {
            Request::Allocate { size } => Ok((operation, size, 0)),
            Request::Deallocate { address } => Ok((operation, 0, address)),
            Request::Resize { address, size } => Ok((operation, size, address)),
            Request::GrowBy(0) | Request::SetOrigin(0) => Err(ProtocolError::AmbiguousGrow),
            Request::GrowBy(size) => Ok((operation, size, 0)),
            Request::SetOrigin(address) => Ok((operation, 0, address)),
            Request::EndSession => Ok((operation, 0, 0)),
        }
    }

    fn from_fields(operation: Operation, size: u32, address: u32) -> Result<Self, ProtocolError> {
        Ok(match operation {
            Operation::Allocate => Request::Allocate { size },
            Operation::Deallocate => Request::Deallocate { address },
            Operation::Resize => Request::Resize { address, size },
            Operation::Grow => match (size, address) {
                (0, 0) => Request::EndSession,
                (0, address) if address % ALIGNMENT != 0 => {
                    return Err(ProtocolError::MisalignedOrigin(address))
                }
                (0, address) => Request::SetOrigin(address),
                (size, 0) if size % ALIGNMENT != 0 => {
                    return Err(ProtocolError::MisalignedGrow(size))
                }
                (size, 0) => Request::GrowBy(size),
                (size, address) => return Err(ProtocolError::MalformedGrow { size, address }),
            },
        })
    }
}

/// A reply from the host to an allocate or resize request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    /// The id of the request being answered. Always 0 in the packed encoding.
    pub id: u32,

    /// The chosen address, or `None` when nothing fits.
    pub address: Option<u32>,
}

/// Which frame layout a session uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Four-word frames with correlation ids.
    #[default]
    Wide,
    /// Two-word frames with a 2-bit tag and a 30-bit size.
    Packed,
}

/// The byte order of every integer on the link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endian {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl FromStr for Encoding {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wide" => Ok(Encoding::Wide),
            "packed" => Ok(Encoding::Packed),
            _ => Err(ParseNameError::new("encoding", s)),
        }
    }
}

impl FromStr for Endian {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "little" => Ok(Endian::Little),
            "big" => Ok(Endian::Big),
            _ => Err(ParseNameError::new("byte order", s)),
        }
    }
}

#[derive(Encode, Decode)]
struct WideFrame {
    operation: u32,
    id: u32,
    size: u32,
    address: u32,
}

#[derive(Encode, Decode)]
struct PackedFrame {
    word: u32,
    address: u32,
}

#[derive(Encode, Decode)]
struct WideReply {
    id: u32,
    address: u32,
}

#[derive(Encode, Decode)]
struct PackedReply {
    address: u32,
}

const PACKED_SIZE_BITS: u32 = 30;
const PACKED_SIZE_MASK: u32 = (1 << PACKED_SIZE_BITS) - 1;

/// The frame layout both ends of a session agree on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Codec {
    /// The frame layout.
    pub encoding: Encoding,
    /// The byte order.
    pub endian: Endian,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = match self.encoding {
            Encoding::Wide => "wide",
            Encoding::Packed => "packed",
        };
        let endian = match self.endian {
            Endian::Little => "little-endian",
            Endian::Big => "big-endian",
        };
        write!(f, "{encoding} {endian}")
    }
}

impl Codec {
    /// Create a codec.
    pub const fn new(encoding: Encoding, endian: Endian) -> Self {
        Codec { encoding, endian }
    }

    /// The size of a request frame in bytes.
    pub fn request_len(&self) -> usize {
        match self.encoding {
            Encoding::Wide => 16,
            Encoding::Packed => 8,
        }
    }

    /// The size of a reply (and of the handshake) in bytes.
    pub fn reply_len(&self) -> usize {
        match self.encoding {
            Encoding::Wide => 8,
            Encoding::Packed => 4,
        }
    }

    fn encode<T: Encode>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        let result = match self.endian {
            Endian::Little => bincode::encode_to_vec(
                value,
                config::standard()
                    .with_little_endian()
                    .with_fixed_int_encoding(),
            ),
            Endian::Big => bincode::encode_to_vec(
                value,
                config::standard().with_big_endian().with_fixed_int_encoding(),
            ),
        };
        result.map_err(|e| ProtocolError::Encode(format!("{e:?}")))
    }

    fn decode<T: Decode<()>>(&self, bytes: &[u8], expected: usize) -> Result<T, ProtocolError> {
        if bytes.len() != expected {
            return Err(ProtocolError::FrameLength {
                expected,
                actual: bytes.len(),
            });
        }
        let result = match self.endian {
            Endian::Little => bincode::decode_from_slice(
                bytes,
                config::standard()
                    .with_little_endian()
                    .with_fixed_int_encoding(),
            ),
            Endian::Big => bincode::decode_from_slice(
                bytes,
                config::standard().with_big_endian().with_fixed_int_encoding(),
            ),
        };
        let (value, _) = result.map_err(|e| ProtocolError::Decode(format!("{e:?}")))?;
        Ok(value)
    }

    /// Encode `request` with correlation id `id`, which the packed encoding
    /// drops.
    pub fn encode_request(&self, id: u32, request: &Request) -> Result<Vec<u8>, ProtocolError> {
        let (operation, size, address) = request.fields()?;
        match self.encoding {
            Encoding::Wide => self.encode(&WideFrame {
                operation: operation as u32,
                id,
                size,
                address,
            }),
            Encoding::Packed => {
                if size > PACKED_SIZE_MASK {
                    return Err(ProtocolError::PackedSizeOverflow(size));
                }
                self.encode(&PackedFrame {
                    word: (operation as u32) << PACKED_SIZE_BITS | size,
                    address,
                })
            }
        }
    }

    /// Decode and validate a request frame, returning its correlation id
    /// (always 0 when packed) and the request.
    pub fn decode_request(&self, bytes: &[u8]) -> Result<(u32, Request), ProtocolError> {
        let (operation, id, size, address) = match self.encoding {
            Encoding::Wide => {
                let frame: WideFrame = self.decode(bytes, self.request_len())?;
                (frame.operation, frame.id, frame.size, frame.address)
            }
            Encoding::Packed => {
                let frame: PackedFrame = self.decode(bytes, self.request_len())?;
                (
                    frame.word >> PACKED_SIZE_BITS,
                    0,
                    frame.word & PACKED_SIZE_MASK,
                    frame.address,
                )
            }
        };
        let operation = Operation::try_from(operation)?;
        Ok((id, Request::from_fields(operation, size, address)?))
    }

    /// Encode a reply. `None` is sent as address 0.
    pub fn encode_reply(&self, reply: &Reply) -> Result<Vec<u8>, ProtocolError> {
        let address = reply.address.unwrap_or(0);
        match self.encoding {
            Encoding::Wide => self.encode(&WideReply {
                id: reply.id,
                address,
            }),
            Encoding::Packed => self.encode(&PackedReply { address }),
        }
    }

    /// Decode a reply. Address 0 decodes as `None`.
    pub fn decode_reply(&self, bytes: &[u8]) -> Result<Reply, ProtocolError> {
        let (id, address) = match self.encoding {
            Encoding::Wide => {
                let reply: WideReply = self.decode(bytes, self.reply_len())?;
                (reply.id, reply.address)
            }
            Encoding::Packed => {
                let reply: PackedReply = self.decode(bytes, self.reply_len())?;
                (0, reply.address)
            }
        };
        Ok(Reply {
            id,
            address: (address != 0).then_some(address),
        })
    }

    /// The handshake the host sends to open a session.
    pub fn handshake(&self) -> Result<Vec<u8>, ProtocolError> {
        self.encode_reply(&Reply {
            id: 1,
            address: Some(1),
        })
    }

    /// Check that `bytes` is the handshake.
    pub fn check_handshake(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let expected = Reply {
            id: match self.encoding {
                Encoding::Wide => 1,
                Encoding::Packed => 0,
            },
            address: Some(1),
        };
        match self.decode_reply(bytes) {
            Ok(reply) if reply == expected => Ok(()),
            _ => Err(ProtocolError::HandshakeMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITTLE_WIDE: Codec = Codec::new(Encoding::Wide, Endian::Little);
    const BIG_PACKED: Codec = Codec::new(Encoding::Packed, Endian::Big);

    #[test]
    fn wide_frames_are_four_words() {
        let bytes = LITTLE_WIDE
            .encode_request(7, &Request::Resize {
                address: 0x1000,
                size: 24,
            })
            .unwrap();
        assert_eq!(
            bytes,
            [2, 0, 0, 0, 7, 0, 0, 0, 24, 0, 0, 0, 0x00, 0x10, 0, 0]
        );
        assert_eq!(
            LITTLE_WIDE.decode_request(&bytes).unwrap(),
            (
                7,
                Request::Resize {
                    address: 0x1000,
                    size: 24
                }
            )
        );
    }

    #[test]
    fn packed_frames_carry_the_tag_in_the_top_bits() {
        let bytes = BIG_PACKED
            .encode_request(99, &Request::GrowBy(4096))
            .unwrap();
        assert_eq!(bytes, [0xc0, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
        assert_eq!(
            BIG_PACKED.decode_request(&bytes).unwrap(),
            (0, Request::GrowBy(4096))
        );

        assert_eq!(
            BIG_PACKED.encode_request(0, &Request::Allocate { size: 1 << 30 }),
            Err(ProtocolError::PackedSizeOverflow(1 << 30))
        );
    }

    #[test]
    fn grow_variants_are_told_apart_by_zero_fields() {
        for codec in [LITTLE_WIDE, BIG_PACKED] {
            for request in [
                Request::GrowBy(64),
                Request::SetOrigin(0x2000_0000),
                Request::EndSession,
            ] {
                let bytes = codec.encode_request(1, &request).unwrap();
                assert_eq!(codec.decode_request(&bytes).unwrap().1, request, "{codec}");
            }
            assert_eq!(
                codec.encode_request(1, &Request::SetOrigin(0)),
                Err(ProtocolError::AmbiguousGrow)
            );
            assert_eq!(
                codec.encode_request(1, &Request::GrowBy(0)),
                Err(ProtocolError::AmbiguousGrow)
            );
        }
    }

    #[test]
    fn structurally_invalid_frames_are_rejected() {
        let malformed_grow = [3, 0, 0, 0, 1, 0, 0, 0, 8, 0, 0, 0, 8, 0, 0, 0];
        assert_eq!(
            LITTLE_WIDE.decode_request(&malformed_grow),
            Err(ProtocolError::MalformedGrow { size: 8, address: 8 })
        );

        let unaligned_grow = [3, 0, 0, 0, 1, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            LITTLE_WIDE.decode_request(&unaligned_grow),
            Err(ProtocolError::MisalignedGrow(12))
        );
        let unaligned_origin = [3, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0x04, 0x10, 0, 0];
        assert_eq!(
            LITTLE_WIDE.decode_request(&unaligned_origin),
            Err(ProtocolError::MisalignedOrigin(0x1004))
        );

        let unknown = [9, 0, 0, 0, 1, 0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            LITTLE_WIDE.decode_request(&unknown),
            Err(ProtocolError::UnknownOperation(9))
        );

        assert_eq!(
            LITTLE_WIDE.decode_request(&unknown[..10]),
            Err(ProtocolError::FrameLength {
                expected: 16,
                actual: 10
            })
        );
    }

    #[test]
    fn zero_reply_address_means_no_fit() {
        for codec in [LITTLE_WIDE, BIG_PACKED] {
            let bytes = codec
                .encode_reply(&Reply {
                    id: 0,
                    address: None,
                })
                .unwrap();
            assert_eq!(bytes.len(), codec.reply_len());
            assert!(bytes.iter().all(|b| *b == 0));
            assert_eq!(codec.decode_reply(&bytes).unwrap().address, None);
        }
    }

    #[test]
    fn handshake_is_all_ones() {
        assert_eq!(LITTLE_WIDE.handshake().unwrap(), [1, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(BIG_PACKED.handshake().unwrap(), [0, 0, 0, 1]);
        for codec in [LITTLE_WIDE, BIG_PACKED] {
            codec.check_handshake(&codec.handshake().unwrap()).unwrap();
        }

        let reply = LITTLE_WIDE
            .encode_reply(&Reply {
                id: 1,
                address: Some(0x1000),
            })
            .unwrap();
        assert_eq!(
            LITTLE_WIDE.check_handshake(&reply),
            Err(ProtocolError::HandshakeMismatch)
        );
        assert_eq!(
            LITTLE_WIDE.check_handshake(&[1, 0, 0, 0]),
            Err(ProtocolError::HandshakeMismatch)
        );
    }

    #[test]
    fn names_parse() {
        assert_eq!("packed".parse::<Encoding>().unwrap(), Encoding::Packed);
        assert_eq!("big".parse::<Endian>().unwrap(), Endian::Big);
        assert!("middle".parse::<Endian>().is_err());
    }
}
