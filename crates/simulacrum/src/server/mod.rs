//! WebSocket Server
//!
//! Exposes a process's PVs to clients over a WebSocket API.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
