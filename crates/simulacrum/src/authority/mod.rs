//! Model Authority
//!
//! The single owner of the physics model. Device processes mutate it over the
//! command channel and follow it through the broadcast channel.

pub mod engine;
pub mod lattice;
pub mod lattice_engine;
pub mod optics;
pub mod service;
pub mod tables;

pub use engine::{EngineError, ModelEngine};
pub use lattice::{Element, ElementKind, Lattice, LatticeError};
pub use lattice_engine::LatticeEngine;
pub use service::{AuthorityEndpoints, AuthorityMessage, AuthoritySettings, ModelService, TableNames};

use simulacrum_runtime::RoutingError;
use simulacrum_types::SnapshotError;

/// Error type for authority operations
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Refused instruction: {0}")]
    Refused(String),

    #[error("Unparseable engine output: {0}")]
    Parse(String),

    #[error("No twiss marker found among {0:?}")]
    NoMarker(Vec<String>),

    #[error("Unknown snapshot kind: {0}")]
    UnknownSnapshot(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
