use super::{Frame, FrameHeader, Opcode};
use crate::payload::{Budget, Exhausted, Payload};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Largest payload expressible without an extended length field.
pub const MAX_PAYLOAD_LEN: usize = 125;

const HEADER_LEN: usize = 2;
const MASK_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ends before the frame does.
    #[error("frame incomplete, {needed} more bytes required")]
    Incomplete { needed: usize },

    /// The length field holds one of the extended-length escapes (126, 127).
    #[error("extended payload length {0} is not supported")]
    UnsupportedLength(u8),

    #[error(transparent)]
    Exhausted(#[from] Exhausted),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the 125 byte limit")]
    PayloadTooLong(usize),
}

/// A frame located in a receive buffer, payload still masked.
#[derive(Debug)]
pub struct RawFrame<'a> {
    header: FrameHeader,
    mask: Option<[u8; 4]>,
    payload: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Locates one frame at the start of `raw`. Trailing bytes are left for
    /// the next call.
    pub fn parse(raw: &'a [u8]) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::Incomplete {
                needed: HEADER_LEN - raw.len(),
            });
        }

        let header = FrameHeader::parse([raw[0], raw[1]]);
        if usize::from(header.payload_len) > MAX_PAYLOAD_LEN {
            return Err(DecodeError::UnsupportedLength(header.payload_len));
        }

        let mask_len = if header.mask { MASK_LEN } else { 0 };
        let payload_start = HEADER_LEN + mask_len;
        let total = payload_start + usize::from(header.payload_len);
        if raw.len() < total {
            return Err(DecodeError::Incomplete {
                needed: total - raw.len(),
            });
        }

        let mask = if header.mask {
            Some([raw[2], raw[3], raw[4], raw[5]])
        } else {
            None
        };

        Ok(Self {
            header,
            mask,
            payload: &raw[payload_start..total],
        })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        let mask_len = if self.mask.is_some() { MASK_LEN } else { 0 };
        HEADER_LEN + mask_len + self.payload.len()
    }

    /// Copies the payload out of the receive buffer, unmasked.
    pub fn into_payload(self, budget: &Budget) -> Result<Payload, Exhausted> {
        Payload::copy_from(self.payload, self.mask, budget)
    }

    pub fn into_frame(self, budget: &Budget) -> Result<Frame, Exhausted> {
        let header = self.header;
        let payload = self.into_payload(budget)?;

        trace!(
            fin = header.fin,
            opcode = ?header.opcode,
            masked = header.mask,
            payload_len = header.payload_len,
            "decoded websocket frame"
        );

        Ok(Frame::new(header, payload))
    }
}

/// Decodes the frame at the start of `raw` into an owned `Frame`.
pub fn decode(raw: &[u8], budget: &Budget) -> Result<Frame, DecodeError> {
    Ok(RawFrame::parse(raw)?.into_frame(budget)?)
}

/// XORs `buf` with `key`, repeating the key every four bytes. Applying the
/// same key twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i % MASK_LEN];
    }
}

/// Serializes a final, unmasked server frame.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Result<Bytes, EncodeError> {
    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLong(len));
    }

    let mut write_buf = BytesMut::with_capacity(HEADER_LEN + len);
    write_buf.put_slice(&FrameHeader::new(opcode, len as u8).to_bytes());
    write_buf.put_slice(payload);

    trace!(opcode = ?opcode, payload_len = len, "encoded websocket frame");

    Ok(write_buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HELLO_KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn decode_unmasked_text_frame() {
        let data = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        let frame = decode(&data, &Budget::unlimited()).unwrap();

        assert!(frame.header.fin);
        assert_eq!(frame.opcode(), Opcode::Text);
        assert!(!frame.header.mask);
        assert_eq!(frame.payload.as_bytes(), b"Hello");
    }

    #[test]
    fn decode_masked_text_frame() {
        let data = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let raw = RawFrame::parse(&data).unwrap();
        assert_eq!(raw.mask(), Some(HELLO_KEY));
        assert_eq!(raw.wire_len(), data.len());

        let frame = raw.into_frame(&Budget::unlimited()).unwrap();
        assert_eq!(frame.header.payload_len, 5);
        assert_eq!(frame.payload.as_bytes(), b"Hello");
    }

    #[test]
    fn extended_lengths_are_rejected() {
        let mut data = vec![0x81, 0xFE, 0x00, 0x7E];
        data.extend_from_slice(&[0; 130]);
        assert_eq!(
            RawFrame::parse(&data).unwrap_err(),
            DecodeError::UnsupportedLength(126)
        );

        let data = [0x82, 0x7F, 0, 0, 0, 0, 0, 0, 0x01, 0x00];
        assert_eq!(
            RawFrame::parse(&data).unwrap_err(),
            DecodeError::UnsupportedLength(127)
        );
    }

    #[test]
    fn short_buffers_report_missing_bytes() {
        assert_eq!(
            RawFrame::parse(&[]).unwrap_err(),
            DecodeError::Incomplete { needed: 2 }
        );
        assert_eq!(
            RawFrame::parse(&[0x81, 0x85, 0x37]).unwrap_err(),
            DecodeError::Incomplete { needed: 8 }
        );
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let data = [0x89, 0x00, 0x81, 0x01, b'x'];
        let raw = RawFrame::parse(&data).unwrap();
        assert_eq!(raw.header().opcode, Opcode::Ping);
        assert_eq!(raw.wire_len(), 2);

        let next = RawFrame::parse(&data[2..]).unwrap();
        assert_eq!(next.header().opcode, Opcode::Text);
    }

    #[test]
    fn decode_charges_the_budget() {
        let data = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        assert_eq!(
            decode(&data, &Budget::new(4)).unwrap_err(),
            DecodeError::Exhausted(Exhausted { len: 5 })
        );
    }

    #[test]
    fn encode_empty_pong() {
        let bytes = encode(Opcode::Pong, &[]).unwrap();
        assert_eq!(&bytes[..], &[0x8A, 0x00]);
    }

    #[test]
    fn encode_text_frame() {
        let bytes = encode(Opcode::Text, b"Hello").unwrap();
        assert_eq!(&bytes[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn encode_refuses_long_payloads() {
        assert!(encode(Opcode::Text, &[0; MAX_PAYLOAD_LEN]).is_ok());
        assert_eq!(
            encode(Opcode::Text, &[0; MAX_PAYLOAD_LEN + 1]).unwrap_err(),
            EncodeError::PayloadTooLong(126)
        );
    }

    proptest! {
        #[test]
        fn mask_is_an_involution(key in any::<[u8; 4]>(), payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut buf = payload.clone();
            apply_mask(&mut buf, key);
            apply_mask(&mut buf, key);
            prop_assert_eq!(buf, payload);
        }

        #[test]
        fn text_survives_encode_then_decode(payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN)) {
            let bytes = encode(Opcode::Text, &payload).unwrap();
            let frame = decode(&bytes, &Budget::unlimited()).unwrap();
            prop_assert_eq!(frame.opcode(), Opcode::Text);
            prop_assert_eq!(frame.payload.as_bytes(), &payload[..]);
        }

        #[test]
        fn masked_client_frames_decode_to_plaintext(key in any::<[u8; 4]>(), payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN)) {
            let mut data = vec![0x81, 0x80 | payload.len() as u8];
            data.extend_from_slice(&key);
            let mut masked = payload.clone();
            apply_mask(&mut masked, key);
            data.extend_from_slice(&masked);

            let frame = decode(&data, &Budget::unlimited()).unwrap();
            prop_assert_eq!(frame.payload.as_bytes(), &payload[..]);
        }
    }
}
