//! Reassembly of fragmented data messages (RFC 6455 Section 5.4).

use bytes::{Bytes, BytesMut};

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::protocol::{Frame, OpCode};

/// The message currently being accumulated.
#[derive(Debug)]
struct InFlight {
    opcode: OpCode,
    compressed: bool,
    buffer: BytesMut,
    fragments: usize,
}

/// Reassembles fragmented WebSocket messages.
///
/// Only data frames are pushed here; control frames are handled by the caller
/// and may arrive between fragments without touching the in-flight message.
#[derive(Debug)]
pub struct MessageAssembler {
    in_flight: Option<InFlight>,
    limits: Limits,
}

impl MessageAssembler {
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            in_flight: None,
            limits,
        }
    }

    /// Add a data frame.
    ///
    /// Returns `Some` once a frame with FIN=1 completes the message.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a continuation with nothing in flight,
    ///   a new message while one is in flight, or a control frame
    /// - `Error::TooManyFragments` / `Error::MessageTooLarge` when limits are exceeded
    pub fn push(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        if frame.opcode.is_control() {
            return Err(Error::ProtocolViolation(format!(
                "{} frame passed to message assembler",
                frame.opcode
            )));
        }

        let fin = frame.fin;
        let mut in_flight = match (frame.opcode, self.in_flight.take()) {
            (OpCode::Continuation, None) => {
                return Err(Error::ProtocolViolation(
                    "continuation frame without a message in progress".into(),
                ));
            }
            (OpCode::Continuation, Some(in_flight)) => in_flight,
            (opcode, None) => {
                if fin {
                    // Unfragmented: no need to copy into the accumulator.
                    let size = frame.payload().len();
                    self.limits.check_message_size(size)?;
                    return Ok(Some(AssembledMessage {
                        opcode,
                        compressed: frame.rsv1,
                        payload: frame.into_payload(),
                    }));
                }
                InFlight {
                    opcode,
                    compressed: frame.rsv1,
                    buffer: BytesMut::new(),
                    fragments: 0,
                }
            }
            (opcode, Some(_)) => {
                return Err(Error::ProtocolViolation(format!(
                    "{opcode} frame received while a fragmented message is in progress"
                )));
            }
        };

        self.limits.check_fragment_count(in_flight.fragments + 1)?;
        self.limits
            .check_message_size(in_flight.buffer.len() + frame.payload().len())?;
        in_flight.buffer.extend_from_slice(frame.payload());
        in_flight.fragments += 1;

        if fin {
            Ok(Some(AssembledMessage {
                opcode: in_flight.opcode,
                compressed: in_flight.compressed,
                payload: in_flight.buffer.freeze(),
            }))
        } else {
            self.in_flight = Some(in_flight);
            Ok(None)
        }
    }

    #[must_use]
    pub fn is_assembling(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// A complete data message, still compressed if `compressed` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// `Text` or `Binary`.
    pub opcode: OpCode,
    /// RSV1 was set on the first frame.
    pub compressed: bool,
    pub payload: Bytes,
}
