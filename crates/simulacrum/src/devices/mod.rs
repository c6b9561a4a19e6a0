//! Device Services
//!
//! Each device process owns one [`RoutingTable`] inside a [`DeviceService`].
//! A [`Device`] registers its routes and static channels at startup and
//! optionally follows authority snapshots.

mod black_hole;
mod bpm;
mod host;
mod magnet;
mod static_pvs;

pub use black_hole::BlackHole;
pub use bpm::BpmDevice;
pub use host::{DeviceMessage, DeviceService};
pub use magnet::{MagnetDevice, MagnetState};
pub use static_pvs::{parse_static_pvs, StaticPv, StaticPvs};

use async_trait::async_trait;

use simulacrum_runtime::{CommandError, ProtocolError, PvClient, RoutingError, RoutingTable};
use simulacrum_types::{Snapshot, SnapshotError};

/// Error type for device setup and snapshot handling
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Unexpected model output: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-specific behaviour hosted by a [`DeviceService`]
#[async_trait]
pub trait Device: Send + 'static {
    /// Service id and display name
    fn name(&self) -> (&'static str, &'static str);

    /// Register routes and static channels
    ///
    /// `pv` reaches this process's own table and is only safe to `post` with.
    async fn setup(&mut self, table: &mut RoutingTable, pv: &PvClient) -> Result<(), DeviceError>;

    /// Snapshot tags this device consumes. Empty means no broadcast subscription.
    fn snapshot_tags(&self) -> &'static [&'static str] {
        &[]
    }

    /// Apply a snapshot with one of [`Device::snapshot_tags`]
    fn on_snapshot(&mut self, _table: &mut RoutingTable, _snapshot: Snapshot) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Split `PREFIX:AREA:UNIT:ATTR` into the device name and attribute
pub(crate) fn split_attribute(name: &str) -> Option<(&str, &str)> {
    name.rsplit_once(':')
}
