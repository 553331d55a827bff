//! Wire protocol of the remote object store.
//!
//! Every message is an 8-byte [`MessageHeader`] followed by an
//! opcode-specific fixed-layout body. All numeric fields are big-endian.
//! Body fields sit at their natural alignment, so a body carrying a `u64`
//! after a `u32` has four bytes of padding in between.
//!
//! - [`Opcode`]: the twelve stable one-byte operation codes.
//! - [`Message`] / [`Body`]: typed messages with `encode` / `decode`.
//! - [`MessageBuf`]: a cache-line aligned send buffer.

mod error;
mod message;


pub use error::WireError;
pub use message::{
    Body, HEADER_LEN, LOCK_STATUS_ACQUIRED, LOCK_STATUS_BUSY, MAX_MESSAGE_LEN, Message, MessageBuf,
    MessageHeader, Opcode, peek_header,
};
