//! WebSocket frame representation and serialization (RFC 6455 Section 5.2).
//!
//! Parsing lives in [`crate::protocol::decoder`], which handles byte streams
//! that arrive in arbitrary pieces. This module only knows how to put a
//! complete frame on the wire.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::OpCode;
use crate::protocol::mask::apply_mask_fast;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// A single WebSocket frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                         Masking key (if present)              |
/// +---------------------------------------------------------------+
/// |                     Payload data                              |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Set on the first frame of a compressed message.
    pub rsv1: bool,
    /// Must be 0; no extension we speak uses it.
    pub rsv2: bool,
    /// Must be 0; no extension we speak uses it.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, data)
    }

    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// Close frame carrying an optional status code and reason.
    ///
    /// The reason is dropped when no code is given, since RFC 6455 only allows
    /// a reason after a code.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = BytesMut::with_capacity(2 + reason.len());
                data.put_u16(code);
                data.extend_from_slice(reason.as_bytes());
                data.freeze()
            }
            None => Bytes::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    #[must_use]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, data)
    }

    #[must_use]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, data)
    }

    /// Mark the payload as compressed.
    #[must_use]
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Check the structural rules every frame must satisfy.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedBitsSet` if RSV2/RSV3 are set, or RSV1 on a control frame
    /// - `Error::FragmentedControlFrame` if a control frame has FIN=0
    /// - `Error::ControlFrameTooLarge` if a control frame payload exceeds 125 bytes
    pub fn validate(&self) -> Result<()> {
        if self.rsv2 || self.rsv3 {
            return Err(Error::ReservedBitsSet);
        }

        if self.opcode.is_control() {
            if self.rsv1 {
                return Err(Error::ReservedBitsSet);
            }
            if !self.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::ControlFrameTooLarge(self.payload.len()));
            }
        }

        Ok(())
    }

    /// Append the wire form of this frame to `buf`.
    ///
    /// The shortest length encoding is always chosen. When `mask` is given the
    /// mask bit is set and the payload is XORed with the key.
    pub fn encode_into(&self, buf: &mut BytesMut, mask: Option<[u8; 4]>) {
        let payload_len = self.payload.len();
        buf.reserve(self.wire_size(mask.is_some()));

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        buf.put_u8(byte0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        if payload_len <= 125 {
            buf.put_u8(mask_bit | payload_len as u8);
        } else if let Ok(len) = u16::try_from(payload_len) {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(payload_len as u64);
        }

        match mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.extend_from_slice(&self.payload);
                apply_mask_fast(&mut buf[start..], key);
            }
            None => buf.extend_from_slice(&self.payload),
        }
    }

    /// Encode this frame into a fresh buffer.
    #[must_use]
    pub fn encode(&self, mask: Option<[u8; 4]>) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_size(mask.is_some()));
        self.encode_into(&mut buf, mask);
        buf
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let payload_len = self.payload.len();
        let extended_len_size = if payload_len <= 125 {
            0
        } else if payload_len <= 65535 {
            2
        } else {
            8
        };
        let mask_size = if masked { 4 } else { 0 };
        2 + extended_len_size + mask_size + payload_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_unmasked_text_frame() {
        let frame = Frame::text("Hello");
        assert_eq!(
            &frame.encode(None)[..],
            &[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]
        );
    }

    #[test]
    fn test_encode_masked_text_frame() {
        let frame = Frame::text("Hello");
        let wire = frame.encode(Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(
            &wire[..],
            &[
                0x81, 0x85, // FIN + Text, MASK + len=5
                0x37, 0xfa, 0x21, 0x3d, // Mask key
                0x7f, 0x9f, 0x4d, 0x51, 0x58, // Masked "Hello"
            ]
        );
    }

    #[test]
    fn test_encode_length_boundaries() {
        let cases: [(usize, &[u8]); 4] = [
            (125, &[0x82, 125]),
            (126, &[0x82, 126, 0x00, 0x7e]),
            (65535, &[0x82, 126, 0xff, 0xff]),
            (65536, &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]),
        ];
        for (len, header) in cases {
            let frame = Frame::binary(vec![0u8; len]);
            let wire = frame.encode(None);
            assert_eq!(&wire[..header.len()], header, "len {len}");
            assert_eq!(wire.len(), frame.wire_size(false));
        }
    }

    #[test]
    fn test_encode_rsv1_bit() {
        let wire = Frame::text("x").with_rsv1(true).encode(None);
        assert_eq!(wire[0], 0xC1);
    }

    #[test]
    fn test_close_frame_with_reason() {
        let frame = Frame::close(Some(1001), "bye");
        assert_eq!(frame.payload(), &[0x03, 0xe9, b'b', b'y', b'e']);
    }

    #[test]
    fn test_close_frame_without_code_has_no_payload() {
        assert!(Frame::close(None, "ignored").payload().is_empty());
    }

    #[test]
    fn test_validate_fragmented_control_frame() {
        let frame = Frame::new(false, OpCode::Ping, Vec::new());
        assert_eq!(frame.validate(), Err(Error::FragmentedControlFrame));
    }

    #[test]
    fn test_validate_control_frame_too_large() {
        let frame = Frame::ping(vec![0u8; 126]);
        assert_eq!(frame.validate(), Err(Error::ControlFrameTooLarge(126)));
        assert!(Frame::ping(vec![0u8; MAX_CONTROL_FRAME_PAYLOAD]).validate().is_ok());
    }

    #[test]
    fn test_validate_reserved_bits() {
        let mut frame = Frame::text("a");
        frame.rsv2 = true;
        assert_eq!(frame.validate(), Err(Error::ReservedBitsSet));

        let compressed_ping = Frame::ping("a").with_rsv1(true);
        assert_eq!(compressed_ping.validate(), Err(Error::ReservedBitsSet));

        assert!(Frame::text("a").with_rsv1(true).validate().is_ok());
    }

    #[test]
    fn test_wire_size() {
        assert_eq!(Frame::text("").wire_size(false), 2);
        assert_eq!(Frame::text("").wire_size(true), 6);
        assert_eq!(Frame::binary(vec![0; 200]).wire_size(true), 2 + 2 + 4 + 200);
        assert_eq!(Frame::binary(vec![0; 70000]).wire_size(false), 2 + 8 + 70000);
    }
}
