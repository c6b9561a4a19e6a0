//! Beam position monitors
//!
//! `X` and `Y` follow the `orbit` snapshot. `Z` is the monitor's position
//! along the line, read from the model once at startup. `TMIT` is served but
//! never driven by the model.

use async_trait::async_trait;

use simulacrum_runtime::{PvClient, RouteHandlerSet, RoutingTable, SharedCommandClient, ValueType};
use simulacrum_types::{tags, Snapshot};

use super::{Device, DeviceError};

pub const BPM_PATTERN: &str = r"^BPMS:.+:[0-9]+:(X|Y|TMIT|Z)$";

/// A monitor element and the device it is exposed as
#[derive(Debug, Clone, PartialEq)]
struct Monitor {
    element: String,
    device: Option<String>,
    z: f64,
}

impl Monitor {
    /// Parse a `show ele` row: `idx name s device kind strength`
    fn parse(line: &str) -> Result<Self, DeviceError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(DeviceError::Model(format!("short element row: {}", line)));
        }
        let z = fields[2]
            .parse()
            .map_err(|_| DeviceError::Model(format!("bad position in: {}", line)))?;

        Ok(Self {
            element: fields[1].to_string(),
            device: (fields[3] != "-").then(|| fields[3].to_string()),
            z,
        })
    }
}

pub struct BpmDevice {
    client: SharedCommandClient,
    monitors: Vec<Monitor>,
}

impl BpmDevice {
    pub fn new(client: SharedCommandClient) -> Self {
        Self {
            client,
            monitors: Vec::new(),
        }
    }
}

#[async_trait]
impl Device for BpmDevice {
    fn name(&self) -> (&'static str, &'static str) {
        ("bpm", "BPM Service")
    }

    async fn setup(&mut self, table: &mut RoutingTable, _pv: &PvClient) -> Result<(), DeviceError> {
        table.register(BPM_PATTERN, RouteHandlerSet::new(ValueType::Float))?;

        let rows = self.client.evaluate("show ele monitor::*").await?;
        let mut monitors = rows.iter().map(|row| Monitor::parse(row)).collect::<Result<Vec<_>, _>>()?;
        monitors.sort_by(|a, b| a.z.total_cmp(&b.z));

        for monitor in &monitors {
            if let Some(device) = &monitor.device {
                table.post(&format!("{}:Z", device), monitor.z.into())?;
            }
        }
        tracing::info!(monitors = monitors.len(), "Published BPM positions");
        self.monitors = monitors;

        // Request an initial orbit broadcast
        self.client.mark_dirty(Some(tags::ORBIT)).await?;
        Ok(())
    }

    fn snapshot_tags(&self) -> &'static [&'static str] {
        &[tags::ORBIT]
    }

    fn on_snapshot(&mut self, table: &mut RoutingTable, snapshot: Snapshot) -> Result<(), DeviceError> {
        apply_orbit(table, &self.monitors, &snapshot)
    }
}

/// Post the x and y rows of an orbit snapshot to the monitors' channels
fn apply_orbit(table: &mut RoutingTable, monitors: &[Monitor], snapshot: &Snapshot) -> Result<(), DeviceError> {
    let orbit = snapshot.decode_array()?;
    let (Some(x), Some(y)) = (orbit.row(0), orbit.row(1)) else {
        return Err(DeviceError::Model(format!("orbit shape {:?}", orbit.shape())));
    };
    if x.len() != monitors.len() {
        return Err(DeviceError::Model(format!(
            "orbit has {} monitors, expected {}",
            x.len(),
            monitors.len()
        )));
    }

    for (i, monitor) in monitors.iter().enumerate() {
        let Some(device) = &monitor.device else {
            continue;
        };
        table.post(&format!("{}:X", device), x[i].into())?;
        table.post(&format!("{}:Y", device), y[i].into())?;
    }
    tracing::trace!(
        first = monitors.first().map(|m| m.element.as_str()).unwrap_or("-"),
        "Orbit applied"
    );
    Ok(())
}
