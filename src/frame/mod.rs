use crate::payload::Payload;
use std::fmt;

mod codec;
pub use codec::{apply_mask, decode, encode, DecodeError, EncodeError, RawFrame, MAX_PAYLOAD_LEN};

/// Frame opcode. Values without a meaning are kept as `Reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(v) => v & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// The two fixed bytes at the start of every frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv: [bool; 3],
    pub opcode: Opcode,
    pub mask: bool,
    /// The raw 7-bit length field.
    pub payload_len: u8,
}

impl FrameHeader {
    /// A final, unmasked header with the reserved bits cleared.
    pub const fn new(opcode: Opcode, payload_len: u8) -> Self {
        Self {
            fin: true,
            rsv: [false; 3],
            opcode,
            mask: false,
            payload_len,
        }
    }

    pub fn parse(bytes: [u8; 2]) -> Self {
        let [first, second] = bytes;
        Self {
            fin: first & 0x80 != 0,
            rsv: [first & 0x40 != 0, first & 0x20 != 0, first & 0x10 != 0],
            opcode: Opcode::from_u8(first),
            mask: second & 0x80 != 0,
            payload_len: second & 0x7F,
        }
    }

    /// Serializes the header. Reserved bits are always written as zero.
    pub fn to_bytes(&self) -> [u8; 2] {
        let fin = if self.fin { 0x80 } else { 0 };
        let mask = if self.mask { 0x80 } else { 0 };
        [fin | self.opcode.as_u8(), mask | (self.payload_len & 0x7F)]
    }
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeader")
            .field("fin", &self.fin)
            .field("opcode", &self.opcode)
            .field("mask", &self.mask)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

/// A decoded frame that owns its unmasked payload.
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Payload,
}

impl Frame {
    pub const fn new(header: FrameHeader, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("payload", &self.payload)
            .finish()
    }
}
