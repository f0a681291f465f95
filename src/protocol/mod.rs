//! WebSocket protocol core (RFC 6455): frames, masking, the upgrade handshake
//! and message reassembly.

pub mod assembler;
pub mod decoder;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;

pub use assembler::{AssembledMessage, MessageAssembler};
pub use decoder::{DecodePhase, FrameDecoder};
pub use frame::Frame;
pub use handshake::{HandshakeRequest, HandshakeResponse, WS_GUID, compute_accept_key};
pub use mask::{apply_mask, apply_mask_fast};
pub use opcode::OpCode;
