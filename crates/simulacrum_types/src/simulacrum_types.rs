//! Simulacrum Types - Data shared by every Simulacrum process
//!
//! This crate contains the pure data structures that cross process
//! boundaries: channel values, broadcast snapshots and command messages.
//! It has no async or networking dependencies.

mod command;
mod snapshot;
mod value;

pub use command::*;
pub use snapshot::*;
pub use value::*;
