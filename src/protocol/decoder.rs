//! Resumable frame decoder.
//!
//! Bytes are pushed in with [`FrameDecoder::feed`] in whatever pieces the
//! transport produced, and complete frames are pulled out with
//! [`FrameDecoder::next_frame`]. The decoder walks the header one field at a
//! time:
//!
//! ```text
//! AwaitingHeader -> AwaitingExtendedLength -> AwaitingMaskKey -> AwaitingPayload
//!       ^                                                              |
//!       +--------------------------- frame complete -------------------+
//! ```
//!
//! Every header rule is checked as soon as the field carrying it is known, so
//! an illegal frame is rejected before any of its payload is buffered.

use bytes::{Buf, BytesMut};

use crate::config::Limits;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::frame::MAX_CONTROL_FRAME_PAYLOAD;
use crate::protocol::mask::apply_mask_at;
use crate::protocol::{Frame, OpCode};

/// Where the decoder is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    AwaitingHeader,
    AwaitingExtendedLength,
    AwaitingMaskKey,
    AwaitingPayload,
}

#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    masked: bool,
}

#[derive(Debug)]
enum DecodeState {
    AwaitingHeader,
    AwaitingExtendedLength {
        head: FrameHead,
        width: usize,
    },
    AwaitingMaskKey {
        head: FrameHead,
        len: usize,
    },
    AwaitingPayload {
        head: FrameHead,
        len: usize,
        mask: Option<[u8; 4]>,
        payload: BytesMut,
    },
}

/// Incremental RFC 6455 frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_frame_size: usize,
    allow_rsv1: bool,
    buf: BytesMut,
    state: DecodeState,
}

impl FrameDecoder {
    /// Create a decoder for frames received by `role`.
    ///
    /// A client decoder rejects masked frames; a server decoder requires them.
    #[must_use]
    pub fn new(role: Role, limits: &Limits) -> Self {
        Self {
            role,
            max_frame_size: limits.max_frame_size,
            allow_rsv1: false,
            buf: BytesMut::new(),
            state: DecodeState::AwaitingHeader,
        }
    }

    /// Permit RSV1 on the first frame of data messages.
    ///
    /// Enabled once permessage-deflate has been negotiated.
    pub fn set_compression(&mut self, enabled: bool) {
        self.allow_rsv1 = enabled;
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    #[must_use]
    pub fn phase(&self) -> DecodePhase {
        match self.state {
            DecodeState::AwaitingHeader => DecodePhase::AwaitingHeader,
            DecodeState::AwaitingExtendedLength { .. } => DecodePhase::AwaitingExtendedLength,
            DecodeState::AwaitingMaskKey { .. } => DecodePhase::AwaitingMaskKey,
            DecodeState::AwaitingPayload { .. } => DecodePhase::AwaitingPayload,
        }
    }

    /// Bytes fed but not yet consumed by a state transition.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Advance as far as the buffered bytes allow.
    ///
    /// Returns `Ok(None)` when more input is needed. After an error the decoder
    /// must be discarded.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedOpcode` for opcodes outside RFC 6455
    /// - `Error::ReservedBitsSet` for RSV2/RSV3, or RSV1 where it is not allowed
    /// - `Error::MaskedServerFrame` / `Error::UnmaskedClientFrame` on a mask bit mismatch
    /// - `Error::FragmentedControlFrame` / `Error::ControlFrameTooLarge`
    /// - `Error::InvalidPayloadLength` if the 64-bit length has its high bit set
    /// - `Error::FrameTooLarge` if the length exceeds the configured limit
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::AwaitingHeader) {
                DecodeState::AwaitingHeader => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    let byte0 = self.buf.get_u8();
                    let byte1 = self.buf.get_u8();
                    let head = self.parse_head(byte0, byte1)?;

                    self.state = match byte1 & 0x7F {
                        126 => DecodeState::AwaitingExtendedLength { head, width: 2 },
                        127 => DecodeState::AwaitingExtendedLength { head, width: 8 },
                        len => self.after_length(head, u64::from(len))?,
                    };
                }
                DecodeState::AwaitingExtendedLength { head, width } => {
                    if self.buf.len() < width {
                        self.state = DecodeState::AwaitingExtendedLength { head, width };
                        return Ok(None);
                    }
                    let len = if width == 2 {
                        u64::from(self.buf.get_u16())
                    } else {
                        self.buf.get_u64()
                    };
                    if len & (1 << 63) != 0 {
                        return Err(Error::InvalidPayloadLength(len));
                    }
                    self.state = self.after_length(head, len)?;
                }
                DecodeState::AwaitingMaskKey { head, len } => {
                    if self.buf.len() < 4 {
                        self.state = DecodeState::AwaitingMaskKey { head, len };
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    self.buf.copy_to_slice(&mut key);
                    self.state = DecodeState::AwaitingPayload {
                        head,
                        len,
                        mask: Some(key),
                        payload: BytesMut::new(),
                    };
                }
                DecodeState::AwaitingPayload {
                    head,
                    len,
                    mask,
                    mut payload,
                } => {
                    let take = (len - payload.len()).min(self.buf.len());
                    if take > 0 {
                        let mut chunk = self.buf.split_to(take);
                        if let Some(key) = mask {
                            apply_mask_at(&mut chunk, key, payload.len());
                        }
                        if payload.is_empty() {
                            payload = chunk;
                        } else {
                            payload.extend_from_slice(&chunk);
                        }
                    }

                    if payload.len() < len {
                        self.state = DecodeState::AwaitingPayload {
                            head,
                            len,
                            mask,
                            payload,
                        };
                        return Ok(None);
                    }

                    let frame = Frame::new(head.fin, head.opcode, payload.freeze())
                        .with_rsv1(head.rsv1);
                    tracing::trace!(opcode = %frame.opcode, fin = frame.fin, len, "decoded frame");
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn parse_head(&self, byte0: u8, byte1: u8) -> Result<FrameHead> {
        let fin = byte0 & 0x80 != 0;
        let rsv1 = byte0 & 0x40 != 0;
        if byte0 & 0x30 != 0 {
            return Err(Error::ReservedBitsSet);
        }
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;

        if rsv1 && (!self.allow_rsv1 || !opcode.starts_message()) {
            return Err(Error::ReservedBitsSet);
        }
        if opcode.is_control() && !fin {
            return Err(Error::FragmentedControlFrame);
        }

        let masked = byte1 & 0x80 != 0;
        match (self.role.expects_masked(), masked) {
            (false, true) => return Err(Error::MaskedServerFrame),
            (true, false) => return Err(Error::UnmaskedClientFrame),
            _ => {}
        }

        Ok(FrameHead {
            fin,
            rsv1,
            opcode,
            masked,
        })
    }

    fn after_length(&self, head: FrameHead, len: u64) -> Result<DecodeState> {
        let size = usize::try_from(len).unwrap_or(usize::MAX);
        if head.opcode.is_control() && size > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::ControlFrameTooLarge(size));
        }
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        Ok(if head.masked {
            DecodeState::AwaitingMaskKey { head, len: size }
        } else {
            DecodeState::AwaitingPayload {
                head,
                len: size,
                mask: None,
                payload: BytesMut::new(),
            }
        })
    }
}
