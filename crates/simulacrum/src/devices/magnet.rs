//! Magnets
//!
//! Correctors, quadrupoles and bends expose `BCON`, `BDES`, `BACT`, `BCTRL`
//! and `CTRL`. Setpoints live in a shared map that every route handler reads
//! and writes; actuating a magnet copies `BDES` into `BACT` and pushes the
//! new strength into the model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use simulacrum_runtime::{
    ChannelValue, HandlerError, HandlerResult, PvClient, RouteHandlerSet, RoutingTable, SharedCommandClient,
    ValueType,
};
use simulacrum_types::tags;

use super::{split_attribute, Device, DeviceError};

const MAGNET_PREFIX: &str = r"^(XCOR|YCOR|QUAD|BEND):.+:[0-9]+:";

/// The model attribute a magnet family drives
pub fn strength_attribute(device: &str) -> Option<&'static str> {
    match device.split(':').next()? {
        "XCOR" => Some("hkick"),
        "YCOR" => Some("vkick"),
        "QUAD" => Some("k1"),
        "BEND" => Some("angle"),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Magnet State
// ─────────────────────────────────────────────────────────────────────────────

/// Requests accepted by the `CTRL` channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Perturb,
    Trim,
    BconToBdes,
    SaveBdes,
    LoadBdes,
    UndoBdes,
    Unsupported,
}

impl ControlAction {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "PERTURB" => ControlAction::Perturb,
            "TRIM" => ControlAction::Trim,
            "BCON_TO_BDES" => ControlAction::BconToBdes,
            "SAVE_BDES" => ControlAction::SaveBdes,
            "LOAD_BDES" => ControlAction::LoadBdes,
            "UNDO_BDES" => ControlAction::UndoBdes,
            _ => ControlAction::Unsupported,
        }
    }
}

/// Setpoints of one magnet
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetState {
    pub element: String,
    pub attribute: &'static str,
    pub bcon: f64,
    pub bdes: f64,
    pub bact: f64,
    pub saved_bdes: Option<f64>,
    pub bdes_for_undo: Option<f64>,
}

impl MagnetState {
    pub fn new(element: impl Into<String>, attribute: &'static str, strength: f64) -> Self {
        Self {
            element: element.into(),
            attribute,
            bcon: strength,
            bdes: strength,
            bact: strength,
            saved_bdes: None,
            bdes_for_undo: None,
        }
    }

    /// Change BDES, remembering the old value for undo
    pub fn set_bdes(&mut self, value: f64) {
        self.bdes_for_undo = Some(self.bdes);
        self.bdes = value;
    }

    /// Apply `action` to the setpoints. Returns true when BDES must now be actuated.
    pub fn apply(&mut self, action: ControlAction) -> bool {
        match action {
            ControlAction::Perturb | ControlAction::Trim => return true,
            ControlAction::BconToBdes => self.set_bdes(self.bcon),
            ControlAction::SaveBdes => self.saved_bdes = Some(self.bdes),
            ControlAction::LoadBdes => {
                if let Some(saved) = self.saved_bdes {
                    self.set_bdes(saved);
                }
            }
            ControlAction::UndoBdes => {
                if let Some(previous) = self.bdes_for_undo {
                    self.set_bdes(previous);
                }
            }
            ControlAction::Unsupported => {}
        }
        false
    }

    fn actuation(&self) -> String {
        format!("set ele {} {} = {}", self.element, self.attribute, self.bdes)
    }
}

type Magnets = Arc<Mutex<HashMap<String, MagnetState>>>;

fn with_magnet<T>(magnets: &Magnets, name: &str, f: impl FnOnce(&mut MagnetState) -> T) -> HandlerResult<T> {
    let device = split_attribute(name).map(|(device, _)| device).unwrap_or(name);
    let mut magnets = magnets.lock();
    let magnet = magnets
        .get_mut(device)
        .ok_or_else(|| HandlerError::failed(format!("{} is not a known magnet", device)))?;
    Ok(f(magnet))
}

fn float(value: &ChannelValue) -> HandlerResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| HandlerError::failed(format!("{} is not a number", value)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Actuator
// ─────────────────────────────────────────────────────────────────────────────

/// What the route handlers share
#[derive(Clone)]
struct Actuator {
    magnets: Magnets,
    client: SharedCommandClient,
    pv: PvClient,
    settle: Duration,
}

impl Actuator {
    fn post(&self, name: String, value: f64) -> HandlerResult<()> {
        self.pv.post(name, value).map_err(|e| HandlerError::failed(e.to_string()))
    }

    /// Drive the model to BDES and report it as BACT
    async fn actuate(&self, name: &str, settle: bool) -> HandlerResult<()> {
        if settle {
            tokio::time::sleep(self.settle).await;
        }

        let instruction = with_magnet(&self.magnets, name, |magnet| magnet.actuation())?;
        self.client
            .evaluate(&instruction)
            .await
            .map_err(|e| HandlerError::Remote(e.to_string()))?;
        self.client
            .mark_dirty(Some(tags::ORBIT))
            .await
            .map_err(|e| HandlerError::Remote(e.to_string()))?;

        let (element, bact) = with_magnet(&self.magnets, name, |magnet| {
            magnet.bact = magnet.bdes;
            (magnet.element.clone(), magnet.bact)
        })?;
        tracing::debug!(element = %element, bact, "Magnet actuated");

        let prefix = split_attribute(name).map(|(device, _)| device).unwrap_or(name);
        self.post(format!("{}:BACT", prefix), bact)
    }

    /// Route serving one setpoint read straight from the magnet map
    fn readback(&self, read: fn(&MagnetState) -> f64) -> RouteHandlerSet {
        let magnets = self.magnets.clone();
        RouteHandlerSet::new(ValueType::Float).on_get(move |name| {
            let value = with_magnet(&magnets, &name, |magnet| read(magnet));
            async move { value.map(|v| Some(ChannelValue::Float(v))) }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

pub struct MagnetDevice {
    client: SharedCommandClient,
    settle: Duration,
    magnets: Magnets,
}

impl MagnetDevice {
    pub fn new(client: SharedCommandClient, settle: Duration) -> Self {
        Self {
            client,
            settle,
            magnets: Arc::default(),
        }
    }

    fn register_routes(&self, table: &mut RoutingTable, pv: &PvClient) -> Result<(), DeviceError> {
        let actuator = Actuator {
            magnets: self.magnets.clone(),
            client: self.client.clone(),
            pv: pv.clone(),
            settle: self.settle,
        };
        let pattern = |attribute: &str| format!("{}{}$", MAGNET_PREFIX, attribute);

        let magnets = self.magnets.clone();
        table.register(
            &pattern("BCON"),
            actuator.readback(|m| m.bcon).on_put(move |name, value| {
                let stored = float(&value).and_then(|v| with_magnet(&magnets, &name, |m| m.bcon = v));
                async move { stored.map(|_| value) }
            }),
        )?;

        let magnets = self.magnets.clone();
        table.register(
            &pattern("BDES"),
            actuator.readback(|m| m.bdes).on_put(move |name, value| {
                let stored = float(&value).and_then(|v| with_magnet(&magnets, &name, |m| m.set_bdes(v)));
                async move { stored.map(|_| value) }
            }),
        )?;

        table.register(&pattern("BACT"), actuator.readback(|m| m.bact))?;

        let bctrl = actuator.clone();
        table.register(
            &pattern("BCTRL"),
            actuator.readback(|m| m.bact).on_put(move |name, value| {
                let actuator = bctrl.clone();
                async move {
                    let v = float(&value)?;
                    with_magnet(&actuator.magnets, &name, |m| m.set_bdes(v))?;
                    if let Some((device, _)) = split_attribute(&name) {
                        actuator.post(format!("{}:BDES", device), v)?;
                    }
                    actuator.actuate(&name, false).await?;
                    Ok::<_, HandlerError>(value)
                }
            }),
        )?;

        let ctrl = actuator.clone();
        table.register(
            &pattern("CTRL"),
            RouteHandlerSet::new(ValueType::String)
                .on_get(|_| async { Ok(Some(ChannelValue::from("Ready"))) })
                .on_put(move |name, value| {
                    let actuator = ctrl.clone();
                    async move {
                        let text = value.to_string();
                        let action = ControlAction::parse(&text);
                        if action == ControlAction::Unsupported {
                            tracing::warn!(name = %name, request = %text, "Unsupported magnet control function");
                        }

                        let (actuate, bdes) = with_magnet(&actuator.magnets, &name, |m| {
                            let before = m.bdes;
                            let actuate = m.apply(action);
                            (actuate, (m.bdes != before).then_some(m.bdes))
                        })?;
                        if let (Some(bdes), Some((device, _))) = (bdes, split_attribute(&name)) {
                            actuator.post(format!("{}:BDES", device), bdes)?;
                        }
                        if actuate {
                            actuator.actuate(&name, action == ControlAction::Trim).await?;
                        }
                        Ok::<_, HandlerError>(ChannelValue::from("Ready"))
                    }
                }),
        )?;

        Ok(())
    }
}

/// Parse a `show ele` row into a magnet, if the element drives one
fn parse_magnet(line: &str) -> Result<Option<(String, MagnetState)>, DeviceError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(DeviceError::Model(format!("short element row: {}", line)));
    }
    let device = fields[3];
    let Some(attribute) = strength_attribute(device) else {
        return Ok(None);
    };
    let strength = fields[5]
        .parse()
        .map_err(|_| DeviceError::Model(format!("bad strength in: {}", line)))?;

    Ok(Some((device.to_string(), MagnetState::new(fields[1], attribute, strength))))
}

#[async_trait]
impl Device for MagnetDevice {
    fn name(&self) -> (&'static str, &'static str) {
        ("magnet", "Magnet Service")
    }

    async fn setup(&mut self, table: &mut RoutingTable, pv: &PvClient) -> Result<(), DeviceError> {
        let rows = self.client.evaluate("show ele *").await?;
        let mut found = HashMap::new();
        for row in &rows {
            if let Some((device, state)) = parse_magnet(row)? {
                found.insert(device, state);
            }
        }
        tracing::info!(magnets = found.len(), "Discovered magnets");
        *self.magnets.lock() = found;

        self.register_routes(table, pv)
    }
}
