//! Lattice definitions
//!
//! A lattice is an ordered list of elements read from TOML:
//!
//! ```toml
//! name = "demo"
//! energy = 135.0e6
//!
//! [start]
//! beta_x = 10.0
//! beta_y = 10.0
//!
//! [[element]]
//! name = "QF1"
//! kind = "quadrupole"
//! l = 0.2
//! k1 = 1.2
//! device = "QUAD:IN20:361"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Error type for lattice loading
#[derive(Debug, thiserror::Error)]
pub enum LatticeError {
    #[error("Failed to read lattice: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse lattice: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid lattice: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Elements
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Marker,
    Drift,
    Quadrupole,
    Hkicker,
    Vkicker,
    /// Treated as a drift by the optics
    Sbend,
    /// Beam position monitor
    Monitor,
    /// Profile screen (OTR or YAG)
    Profile,
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Marker => "marker",
            ElementKind::Drift => "drift",
            ElementKind::Quadrupole => "quadrupole",
            ElementKind::Hkicker => "hkicker",
            ElementKind::Vkicker => "vkicker",
            ElementKind::Sbend => "sbend",
            ElementKind::Monitor => "monitor",
            ElementKind::Profile => "profile",
        }
    }

    /// The strength attribute a magnet of this kind is driven through
    pub fn strength_attribute(self) -> Option<&'static str> {
        match self {
            ElementKind::Quadrupole => Some("k1"),
            ElementKind::Hkicker => Some("hkick"),
            ElementKind::Vkicker => Some("vkick"),
            ElementKind::Sbend => Some("angle"),
            _ => None,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub kind: ElementKind,

    /// Length in metres
    #[serde(default)]
    pub l: f64,

    /// Quadrupole strength (1/m^2, or integrated 1/m when `l` is zero)
    #[serde(default)]
    pub k1: f64,

    /// Horizontal kick in radians
    #[serde(default)]
    pub hkick: f64,

    /// Vertical kick in radians
    #[serde(default)]
    pub vkick: f64,

    /// Bend angle in radians
    #[serde(default)]
    pub angle: f64,

    /// Control-system device name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Element {
    /// Read a settable attribute
    pub fn attribute(&self, attribute: &str) -> Option<f64> {
        match attribute {
            "l" if self.kind != ElementKind::Marker => Some(self.l),
            "k1" if self.kind == ElementKind::Quadrupole => Some(self.k1),
            "hkick" if self.kind == ElementKind::Hkicker => Some(self.hkick),
            "vkick" if self.kind == ElementKind::Vkicker => Some(self.vkick),
            "angle" if self.kind == ElementKind::Sbend => Some(self.angle),
            _ => None,
        }
    }

    /// Write a settable attribute. Returns false if the element has no such attribute.
    pub fn set_attribute(&mut self, attribute: &str, value: f64) -> bool {
        let slot = match attribute {
            "l" if self.kind != ElementKind::Marker => &mut self.l,
            "k1" if self.kind == ElementKind::Quadrupole => &mut self.k1,
            "hkick" if self.kind == ElementKind::Hkicker => &mut self.hkick,
            "vkick" if self.kind == ElementKind::Vkicker => &mut self.vkick,
            "angle" if self.kind == ElementKind::Sbend => &mut self.angle,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Current value of the strength attribute, zero for non-magnets
    pub fn strength(&self) -> f64 {
        self.kind
            .strength_attribute()
            .and_then(|attribute| self.attribute(attribute))
            .unwrap_or(0.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lattice
// ─────────────────────────────────────────────────────────────────────────────

/// Twiss parameters at the start of the line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialTwiss {
    pub beta_x: f64,
    #[serde(default)]
    pub alpha_x: f64,
    pub beta_y: f64,
    #[serde(default)]
    pub alpha_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub name: String,

    /// Reference particle energy in eV
    pub energy: f64,

    pub start: InitialTwiss,

    #[serde(rename = "element")]
    pub elements: Vec<Element>,
}

const DEMO_LATTICE: &str = r#"
name = "demo"
energy = 135.0e6

[start]
beta_x = 10.0
alpha_x = -0.5
beta_y = 8.0
alpha_y = 0.5

[[element]]
name = "BEGIN"
kind = "marker"

[[element]]
name = "D1"
kind = "drift"
l = 1.0

[[element]]
name = "XC1"
kind = "hkicker"
l = 0.1
device = "XCOR:IN20:381"

[[element]]
name = "YC1"
kind = "vkicker"
l = 0.1
device = "YCOR:IN20:382"

[[element]]
name = "D2"
kind = "drift"
l = 0.5

[[element]]
name = "QF1"
kind = "quadrupole"
l = 0.2
k1 = 1.2
device = "QUAD:IN20:361"

[[element]]
name = "D3"
kind = "drift"
l = 1.0

[[element]]
name = "BPM1"
kind = "monitor"
device = "BPMS:IN20:221"

[[element]]
name = "D4"
kind = "drift"
l = 1.0

[[element]]
name = "QD1"
kind = "quadrupole"
l = 0.2
k1 = -1.2
device = "QUAD:IN20:371"

[[element]]
name = "D5"
kind = "drift"
l = 1.0

[[element]]
name = "BPM2"
kind = "monitor"
device = "BPMS:IN20:235"

[[element]]
name = "D6"
kind = "drift"
l = 0.5

[[element]]
name = "BX1"
kind = "sbend"
l = 0.5
device = "BEND:IN20:751"

[[element]]
name = "D7"
kind = "drift"
l = 0.5

[[element]]
name = "OTR1"
kind = "profile"
device = "OTRS:IN20:571"

[[element]]
name = "D8"
kind = "drift"
l = 1.0

[[element]]
name = "QF2"
kind = "quadrupole"
l = 0.2
k1 = 1.2
device = "QUAD:IN20:425"

[[element]]
name = "D9"
kind = "drift"
l = 1.0

[[element]]
name = "BPM3"
kind = "monitor"
device = "BPMS:IN20:425"

[[element]]
name = "D10"
kind = "drift"
l = 1.0

[[element]]
name = "YAG1"
kind = "profile"
device = "YAGS:IN20:841"

[[element]]
name = "D11"
kind = "drift"
l = 0.5

[[element]]
name = "UNDSTART"
kind = "marker"

[[element]]
name = "BPM4"
kind = "monitor"
device = "BPMS:UND1:100"
"#;

impl Lattice {
    /// Parse and validate a TOML lattice
    pub fn from_toml_str(text: &str) -> Result<Self, LatticeError> {
        let lattice: Lattice = toml::from_str(text)?;
        lattice.validate()?;
        Ok(lattice)
    }

    /// Load a lattice file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LatticeError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let lattice = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            name = %lattice.name,
            elements = lattice.elements.len(),
            "Lattice loaded"
        );
        Ok(lattice)
    }

    /// The built-in demonstration beamline
    pub fn demo() -> Result<Self, LatticeError> {
        Self::from_toml_str(DEMO_LATTICE)
    }

    fn validate(&self) -> Result<(), LatticeError> {
        if self.elements.is_empty() {
            return Err(LatticeError::Invalid("lattice has no elements".to_string()));
        }
        if self.energy <= 0.0 {
            return Err(LatticeError::Invalid("energy must be positive".to_string()));
        }
        if self.start.beta_x <= 0.0 || self.start.beta_y <= 0.0 {
            return Err(LatticeError::Invalid("initial beta must be positive".to_string()));
        }

        let mut names = HashSet::new();
        let mut devices = HashSet::new();
        for element in &self.elements {
            if !names.insert(element.name.as_str()) {
                return Err(LatticeError::Invalid(format!("duplicate element {}", element.name)));
            }
            if let Some(device) = &element.device {
                if !devices.insert(device.as_str()) {
                    return Err(LatticeError::Invalid(format!("duplicate device {}", device)));
                }
            }
            if element.l < 0.0 {
                return Err(LatticeError::Invalid(format!("{} has negative length", element.name)));
            }
            if element.kind == ElementKind::Marker && element.l != 0.0 {
                return Err(LatticeError::Invalid(format!("marker {} has a length", element.name)));
            }
        }
        Ok(())
    }

    /// Index of the element called `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    /// Longitudinal position at the end of each element
    pub fn positions(&self) -> Vec<f64> {
        self.elements
            .iter()
            .scan(0.0, |s, element| {
                *s += element.l;
                Some(*s)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_lattice_is_valid() {
        let lattice = Lattice::demo().unwrap();
        assert_eq!(lattice.elements[0].name, "BEGIN");
        assert!(lattice.position("UNDSTART").is_some());

        let monitors = lattice
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Monitor)
            .count();
        assert_eq!(monitors, 4);

        let positions = lattice.positions();
        assert_eq!(positions.len(), lattice.elements.len());
        assert!(positions.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_attributes_follow_kind() {
        let mut lattice = Lattice::demo().unwrap();
        let quad = lattice.element_mut("QF1").unwrap();
        assert_eq!(quad.attribute("k1"), Some(1.2));
        assert_eq!(quad.attribute("hkick"), None);
        assert!(quad.set_attribute("k1", 0.8));
        assert_eq!(quad.strength(), 0.8);
        assert!(!quad.set_attribute("angle", 0.1));

        let marker = lattice.element_mut("BEGIN").unwrap();
        assert!(!marker.set_attribute("l", 1.0));
        assert_eq!(marker.strength(), 0.0);
    }

    #[test]
    fn test_rejects_invalid_lattices() {
        let duplicate = r#"
name = "bad"
energy = 1.0e9
[start]
beta_x = 1.0
beta_y = 1.0
[[element]]
name = "A"
kind = "drift"
l = 1.0
[[element]]
name = "A"
kind = "drift"
l = 1.0
"#;
        assert!(matches!(Lattice::from_toml_str(duplicate), Err(LatticeError::Invalid(_))));

        let unknown_kind = r#"
name = "bad"
energy = 1.0e9
[start]
beta_x = 1.0
beta_y = 1.0
[[element]]
name = "A"
kind = "wiggler"
"#;
        assert!(matches!(Lattice::from_toml_str(unknown_kind), Err(LatticeError::Toml(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.toml");
        tokio::fs::write(&path, DEMO_LATTICE).await.unwrap();

        let lattice = Lattice::load(&path).await.unwrap();
        assert_eq!(lattice, Lattice::demo().unwrap());
    }
}
