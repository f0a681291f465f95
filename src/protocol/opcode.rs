//! Frame opcodes (RFC 6455 Section 5.2).

use crate::error::{Error, Result};

/// WebSocket frame opcode.
///
/// Only the six opcodes defined by RFC 6455 exist; the remaining 4-bit values
/// are reserved and rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented data message (0x0).
    Continuation = 0x0,
    /// UTF-8 text data (0x1).
    Text = 0x1,
    /// Binary data (0x2).
    Binary = 0x2,
    /// Connection close (0x8).
    Close = 0x8,
    /// Ping (0x9).
    Ping = 0x9,
    /// Pong (0xA).
    Pong = 0xA,
}

impl OpCode {
    /// Decode the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedOpcode`] for 0x3-0x7, 0xB-0xF and anything
    /// outside the 4-bit range.
    pub const fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::ReservedOpcode(other)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Continuation, Text and Binary.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }

    /// Text or Binary, i.e. an opcode that can start a message.
    #[inline]
    #[must_use]
    pub const fn starts_message(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_u8(value)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}
