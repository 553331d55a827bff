//! Error types for wire encoding and decoding.

use crate::message::Opcode;

/// Errors that can occur while decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer is shorter than the message it claims to hold.
    #[error("truncated {opcode:?} message: need {need} bytes, have {have}")]
    Truncated {
        /// Opcode of the message being decoded (`None` if the header itself
        /// was incomplete).
        opcode: Option<Opcode>,
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// The opcode byte does not name a known operation.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// The header carries a protocol version we do not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}
