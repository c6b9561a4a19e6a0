//! A device with no routes
//!
//! Every name resolves through the default factory, so the process answers
//! for any PV as a disconnected read-write float.

use async_trait::async_trait;

use simulacrum_runtime::{PvClient, RoutingTable};

use super::{Device, DeviceError};

pub struct BlackHole;

#[async_trait]
impl Device for BlackHole {
    fn name(&self) -> (&'static str, &'static str) {
        ("black-hole", "Black Hole")
    }

    async fn setup(&mut self, _table: &mut RoutingTable, _pv: &PvClient) -> Result<(), DeviceError> {
        Ok(())
    }
}
