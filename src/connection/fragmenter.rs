//! Splitting outgoing messages into frames.

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::protocol::mask::random_mask_key;
use crate::protocol::{Frame, OpCode};

/// Yields the frames of one outgoing message.
///
/// The first frame carries the message opcode (and RSV1 for a compressed
/// message); the rest are continuations. Chunks share the payload's buffer.
#[derive(Debug)]
pub struct MessageFragmenter {
    rest: Bytes,
    /// Opcode for the next frame; `None` once the final frame was produced.
    opcode: Option<OpCode>,
    rsv1: bool,
    fragment_size: usize,
}

impl MessageFragmenter {
    /// `None` keeps the whole message in one frame.
    #[inline]
    #[must_use]
    pub fn new(payload: Bytes, opcode: OpCode, fragment_size: Option<usize>) -> Self {
        Self {
            rest: payload,
            opcode: Some(opcode),
            rsv1: false,
            fragment_size: fragment_size.map_or(usize::MAX, |size| size.max(1)),
        }
    }

    /// Set RSV1 on the first frame.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.rsv1 = compressed;
        self
    }

    /// Encode the whole message as masked client frames, ready for one write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the system RNG is unavailable.
    pub fn encode_masked(self) -> Result<Bytes> {
        encode_masked(self)
    }
}

/// Mask every frame with a fresh key and concatenate them.
pub(crate) fn encode_masked(frames: impl IntoIterator<Item = Frame>) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for frame in frames {
        out.reserve(frame.wire_size(true));
        frame.encode_into(&mut out, Some(random_mask_key()?));
    }
    Ok(out.freeze())
}

impl Iterator for MessageFragmenter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let opcode = self.opcode?;
        let take = self.rest.len().min(self.fragment_size);
        let chunk = self.rest.split_to(take);
        let fin = self.rest.is_empty();

        let frame = Frame::new(fin, opcode, chunk).with_rsv1(self.rsv1);
        self.rsv1 = false;
        self.opcode = (!fin).then_some(OpCode::Continuation);
        Some(frame)
    }
}
