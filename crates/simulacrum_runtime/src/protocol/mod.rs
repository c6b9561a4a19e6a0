//! Wire protocols between the model authority and device processes
//!
//! Both channels share one length-prefixed frame format:
//!
//! ```text
//! +-----------+------+-----------------+
//! | len (u32) | type | payload         |
//! | BE        | u8   | len - 1 bytes   |
//! +-----------+------+-----------------+
//! ```
//!
//! - The broadcast channel sends every snapshot as a `Metadata` frame (JSON)
//!   immediately followed by a `Payload` frame. Subscribers always read both.
//! - The command channel carries one `Request` frame and waits for exactly
//!   one `Reply` frame before sending the next.

mod broadcast;
mod command;
mod frame;

pub use broadcast::*;
pub use command::*;
pub use frame::*;

use simulacrum_types::SnapshotError;

/// Errors on either wire protocol
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Frame boundaries no longer line up; the connection must be dropped
    #[error("Protocol desync: expected {expected:?} frame, got {actual:?}")]
    Desync { expected: FrameType, actual: FrameType },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Connection closed")]
    Closed,
}
