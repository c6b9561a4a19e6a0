//! Generic static PVs loaded from a text file
//!
//! One channel per line: `NAME TYPE [INITIAL]`. Everything after the type
//! is the initial value, so string values may contain spaces. Lines starting
//! with `#` are comments.

use std::path::Path;

use async_trait::async_trait;

use simulacrum_runtime::{AccessMode, ChannelValue, PvClient, RoutingError, RoutingTable, ValueType};

use super::{Device, DeviceError};

/// One line of the PV file
#[derive(Debug, Clone, PartialEq)]
pub struct StaticPv {
    pub name: String,
    pub value_type: ValueType,
    pub initial: ChannelValue,
}

fn split_word(text: &str) -> (&str, Option<&str>) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (text, None),
    }
}

/// Parse a PV file. Unknown types and unparseable initial values are configuration errors.
pub fn parse_static_pvs(text: &str) -> Result<Vec<StaticPv>, RoutingError> {
    let mut pvs = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, rest) = split_word(line);
        let rest = rest.ok_or_else(|| RoutingError::Configuration(format!("line {}: {} has no type", number + 1, name)))?;
        let (type_name, initial) = split_word(rest);

        let value_type: ValueType = type_name
            .parse()
            .map_err(|e| RoutingError::Configuration(format!("line {}: {}", number + 1, e)))?;
        let initial = match initial {
            Some(text) => value_type
                .parse_value(text)
                .map_err(|e| RoutingError::Configuration(format!("line {}: {}", number + 1, e)))?,
            None => value_type.default_value(),
        };

        pvs.push(StaticPv {
            name: name.to_string(),
            value_type,
            initial,
        });
    }

    Ok(pvs)
}

/// Serves the channels of a PV file as static read-write PVs
pub struct StaticPvs {
    pvs: Vec<StaticPv>,
}

impl StaticPvs {
    pub fn new(pvs: Vec<StaticPv>) -> Self {
        Self { pvs }
    }

    /// Read and parse a PV file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::new(parse_static_pvs(&text)?))
    }

    pub fn len(&self) -> usize {
        self.pvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pvs.is_empty()
    }
}

#[async_trait]
impl Device for StaticPvs {
    fn name(&self) -> (&'static str, &'static str) {
        ("static-pvs", "Static PVs")
    }

    async fn setup(&mut self, table: &mut RoutingTable, _pv: &PvClient) -> Result<(), DeviceError> {
        for pv in &self.pvs {
            table.register_static(&pv.name, pv.value_type, pv.initial.clone(), AccessMode::ReadWrite)?;
        }
        tracing::info!(count = self.pvs.len(), "Static PVs registered");
        Ok(())
    }
}
