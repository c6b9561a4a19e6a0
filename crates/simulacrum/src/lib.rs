//! Simulacrum
//!
//! A simulated accelerator control system. One process is the model
//! authority that owns the lattice and publishes optics; the others host
//! device PVs (BPMs, magnets, static channels) backed by that model.

pub mod authority;
pub mod config;
pub mod devices;
pub mod launch;
pub mod server;
