//! Built-in lattice engine
//!
//! Instructions:
//!
//! - `set ele <element> <attribute> = <value>`
//! - `set particle_start <x|px|y|py> = <value>`
//! - `show ele [<kind>::]<glob>` rows `<idx> <element> <s> <device|-> <kind> <strength>`
//! - `show data orbit.<x|y|e|profx|profy>` one value per line
//! - `show twiss <element>` lines `<key> = <value>`
//! - `show lattice [design]` one row per element, see [`LATTICE_COLUMNS`]
//! - `show rmat [design]` rows `<idx> <element> <device|-> <s> r11 .. r66`

use wildmatch::WildMatch;

use super::engine::{EngineError, ModelEngine};
use super::lattice::{ElementKind, Lattice};
use super::optics::{propagate, ElementOptics, ParticleStart};

/// Column order of `show lattice` rows
pub const LATTICE_COLUMNS: [&str; 20] = [
    "idx", "element", "kind", "device", "s", "l", "p0c", "alpha_x", "beta_x", "eta_x", "etap_x", "psi_x",
    "alpha_y", "beta_y", "eta_y", "etap_y", "psi_y", "x", "y", "strength",
];

/// Live lattice, its design copy and the launch position
#[derive(Debug, Clone)]
pub struct LatticeEngine {
    design: Lattice,
    live: Lattice,
    start: ParticleStart,
}

impl LatticeEngine {
    pub fn new(lattice: Lattice) -> Self {
        Self {
            design: lattice.clone(),
            live: lattice,
            start: ParticleStart::default(),
        }
    }

    pub fn live(&self) -> &Lattice {
        &self.live
    }

    pub fn particle_start(&self) -> ParticleStart {
        self.start
    }

    fn set_element(&mut self, name: &str, attribute: &str, value: &str) -> Result<Vec<String>, EngineError> {
        let value = parse_number(value)?;
        let element = self
            .live
            .element_mut(name)
            .ok_or_else(|| EngineError::UnknownElement(name.to_string()))?;
        if !element.set_attribute(attribute, value) {
            return Err(EngineError::UnknownAttribute {
                element: name.to_string(),
                attribute: attribute.to_string(),
            });
        }
        tracing::debug!(element = name, attribute, value, "Element updated");
        Ok(Vec::new())
    }

    fn set_particle_start(&mut self, coordinate: &str, value: &str) -> Result<Vec<String>, EngineError> {
        let value = parse_number(value)?;
        let slot = match coordinate {
            "x" => &mut self.start.x,
            "px" => &mut self.start.px,
            "y" => &mut self.start.y,
            "py" => &mut self.start.py,
            _ => {
                return Err(EngineError::UnknownAttribute {
                    element: "particle_start".to_string(),
                    attribute: coordinate.to_string(),
                })
            }
        };
        *slot = value;
        Ok(Vec::new())
    }

    fn show_elements(&self, pattern: &str) -> Result<Vec<String>, EngineError> {
        let (kind, glob) = match pattern.split_once("::") {
            Some((kind, glob)) => (Some(parse_kind(kind)?), glob),
            None => (None, pattern),
        };
        let matcher = WildMatch::new(glob);
        let positions = self.live.positions();

        Ok(self
            .live
            .elements
            .iter()
            .enumerate()
            .filter(|(_, e)| kind.is_none_or(|k| e.kind == k) && matcher.matches(&e.name))
            .map(|(idx, e)| {
                format!(
                    "{} {} {} {} {} {}",
                    idx,
                    e.name,
                    positions[idx],
                    e.device.as_deref().unwrap_or("-"),
                    e.kind,
                    e.strength()
                )
            })
            .collect())
    }

    fn show_data(&self, datum: &str) -> Result<Vec<String>, EngineError> {
        let (kind, value): (ElementKind, fn(&ElementOptics, f64) -> f64) = match datum {
            "orbit.x" => (ElementKind::Monitor, |o, _| o.orbit[0]),
            "orbit.y" => (ElementKind::Monitor, |o, _| o.orbit[2]),
            "orbit.e" => (ElementKind::Monitor, |_, energy| energy),
            "orbit.profx" => (ElementKind::Profile, |o, _| o.orbit[0]),
            "orbit.profy" => (ElementKind::Profile, |o, _| o.orbit[2]),
            _ => return Err(EngineError::UnknownDatum(datum.to_string())),
        };

        let optics = propagate(&self.live, &self.start);
        Ok(self
            .live
            .elements
            .iter()
            .zip(&optics)
            .filter(|(e, _)| e.kind == kind)
            .map(|(_, o)| value(o, self.live.energy).to_string())
            .collect())
    }

    fn show_twiss(&self, name: &str) -> Result<Vec<String>, EngineError> {
        let idx = self
            .live
            .position(name)
            .ok_or_else(|| EngineError::UnknownElement(name.to_string()))?;
        let optics = propagate(&self.live, &self.start);
        let o = &optics[idx];

        Ok(vec![
            format!("s = {}", o.s),
            format!("beta_x = {}", o.twiss_x.beta),
            format!("alpha_x = {}", o.twiss_x.alpha),
            format!("eta_x = {}", o.twiss_x.eta),
            format!("phi_x = {}", o.twiss_x.psi),
            format!("beta_y = {}", o.twiss_y.beta),
            format!("alpha_y = {}", o.twiss_y.alpha),
            format!("eta_y = {}", o.twiss_y.eta),
            format!("phi_y = {}", o.twiss_y.psi),
        ])
    }

    fn lattice_for(&self, which: Option<&str>) -> Result<(&Lattice, ParticleStart), EngineError> {
        match which {
            None => Ok((&self.live, self.start)),
            Some("design") => Ok((&self.design, ParticleStart::default())),
            Some(other) => Err(EngineError::UnknownCommand(format!("show ... {}", other))),
        }
    }

    fn show_lattice(&self, which: Option<&str>) -> Result<Vec<String>, EngineError> {
        let (lattice, start) = self.lattice_for(which)?;
        let optics = propagate(lattice, &start);

        Ok(lattice
            .elements
            .iter()
            .zip(&optics)
            .enumerate()
            .map(|(idx, (e, o))| {
                let (tx, ty) = (&o.twiss_x, &o.twiss_y);
                format!(
                    "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
                    idx,
                    e.name,
                    e.kind,
                    e.device.as_deref().unwrap_or("-"),
                    o.s,
                    e.l,
                    lattice.energy,
                    tx.alpha,
                    tx.beta,
                    tx.eta,
                    tx.etap,
                    tx.psi,
                    ty.alpha,
                    ty.beta,
                    ty.eta,
                    ty.etap,
                    ty.psi,
                    o.orbit[0],
                    o.orbit[2],
                    e.strength()
                )
            })
            .collect())
    }

    fn show_rmat(&self, which: Option<&str>) -> Result<Vec<String>, EngineError> {
        let (lattice, start) = self.lattice_for(which)?;
        let optics = propagate(lattice, &start);

        Ok(lattice
            .elements
            .iter()
            .zip(&optics)
            .enumerate()
            .map(|(idx, (e, o))| {
                let mut row = format!(
                    "{} {} {} {}",
                    idx,
                    e.name,
                    e.device.as_deref().unwrap_or("-"),
                    o.s
                );
                for value in o.rmat.iter().flatten() {
                    row.push(' ');
                    row.push_str(&value.to_string());
                }
                row
            })
            .collect())
    }
}

fn parse_number(text: &str) -> Result<f64, EngineError> {
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| EngineError::InvalidValue(text.to_string()))
}

fn parse_kind(text: &str) -> Result<ElementKind, EngineError> {
    serde_json::from_value(serde_json::Value::String(text.to_ascii_lowercase()))
        .map_err(|_| EngineError::InvalidPattern(text.to_string()))
}

impl ModelEngine for LatticeEngine {
    type Checkpoint = (Lattice, ParticleStart);

    fn execute(&mut self, instruction: &str) -> Result<Vec<String>, EngineError> {
        let normalized = instruction.replace('=', " = ");
        let words: Vec<&str> = normalized.split_whitespace().collect();

        match words.as_slice() {
            [] => Err(EngineError::Empty),
            ["set", "ele", name, attribute, "=", value] => self.set_element(name, attribute, value),
            ["set", "particle_start", coordinate, "=", value] => self.set_particle_start(coordinate, value),
            ["show", "ele", pattern] => self.show_elements(pattern),
            ["show", "data", datum] => self.show_data(datum),
            ["show", "twiss", name] => self.show_twiss(name),
            ["show", "lattice"] => self.show_lattice(None),
            ["show", "lattice", which] => self.show_lattice(Some(which)),
            ["show", "rmat"] => self.show_rmat(None),
            ["show", "rmat", which] => self.show_rmat(Some(which)),
            _ => Err(EngineError::UnknownCommand(instruction.trim().to_string())),
        }
    }

    fn checkpoint(&self) -> Self::Checkpoint {
        (self.live.clone(), self.start)
    }

    fn restore(&mut self, checkpoint: Self::Checkpoint) {
        let (live, start) = checkpoint;
        self.live = live;
        self.start = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LatticeEngine {
        LatticeEngine::new(Lattice::demo().unwrap())
    }

    #[test]
    fn test_set_element_changes_live_only() {
        let mut engine = engine();
        engine.execute("set ele QF1 k1 = 0.5").unwrap();
        engine.execute("set ele QD1 k1=-0.4").unwrap();

        let live = engine.execute("show lattice").unwrap();
        let design = engine.execute("show lattice design").unwrap();
        let qf1_live: Vec<&str> = live[5].split_whitespace().collect();
        let qf1_design: Vec<&str> = design[5].split_whitespace().collect();
        assert_eq!(qf1_live[1], "QF1");
        assert_eq!(qf1_live[19], "0.5");
        assert_eq!(qf1_design[19], "1.2");
        assert_eq!(qf1_live.len(), LATTICE_COLUMNS.len());
    }

    #[test]
    fn test_engine_errors() {
        let mut engine = engine();
        assert_eq!(engine.execute("  "), Err(EngineError::Empty));
        assert!(matches!(engine.execute("fly away"), Err(EngineError::UnknownCommand(_))));
        assert!(matches!(
            engine.execute("set ele NOPE k1 = 1"),
            Err(EngineError::UnknownElement(_))
        ));
        assert!(matches!(
            engine.execute("set ele QF1 hkick = 1"),
            Err(EngineError::UnknownAttribute { .. })
        ));
        assert!(matches!(
            engine.execute("set ele QF1 k1 = lots"),
            Err(EngineError::InvalidValue(_))
        ));
        assert!(matches!(engine.execute("show data orbit.z"), Err(EngineError::UnknownDatum(_))));
    }

    #[test]
    fn test_show_ele_filters_by_kind_and_glob() {
        let mut engine = engine();
        let monitors = engine.execute("show ele monitor::*").unwrap();
        assert_eq!(monitors.len(), 4);
        let first: Vec<&str> = monitors[0].split_whitespace().collect();
        assert_eq!(first[1], "BPM1");
        assert_eq!(first[3], "BPMS:IN20:221");
        assert_eq!(first[4], "monitor");

        let quads = engine.execute("show ele Q*").unwrap();
        assert_eq!(quads.len(), 3);
        assert!(engine.execute("show ele ZZZ*").unwrap().is_empty());
        assert!(matches!(
            engine.execute("show ele klystron::*"),
            Err(EngineError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_corrector_moves_orbit() {
        let mut engine = engine();
        let before = engine.execute("show data orbit.x").unwrap();
        assert!(before.iter().all(|v| v.parse::<f64>().unwrap() == 0.0));

        engine.execute("set ele XC1 hkick = 0.001").unwrap();
        let after = engine.execute("show data orbit.x").unwrap();
        assert_eq!(after.len(), 4);
        assert!(after[0].parse::<f64>().unwrap().abs() > 0.0);

        let y = engine.execute("show data orbit.y").unwrap();
        assert!(y.iter().all(|v| v.parse::<f64>().unwrap() == 0.0));
        let energy = engine.execute("show data orbit.e").unwrap();
        assert_eq!(energy[0], "135000000");
        assert_eq!(engine.execute("show data orbit.profx").unwrap().len(), 2);
    }

    #[test]
    fn test_particle_start_and_twiss() {
        let mut engine = engine();
        engine.execute("set particle_start y = 0.002").unwrap();
        assert_eq!(engine.particle_start().y, 0.002);
        assert!(engine.execute("set particle_start z = 1").is_err());

        let twiss = engine.execute("show twiss UNDSTART").unwrap();
        assert!(twiss.iter().any(|line| line.starts_with("beta_x = ")));
        assert!(matches!(engine.execute("show twiss NOPE"), Err(EngineError::UnknownElement(_))));
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut engine = engine();
        let checkpoint = engine.checkpoint();
        engine.execute("set ele QF1 k1 = 3.0").unwrap();
        engine.execute("set particle_start x = 0.1").unwrap();
        engine.restore(checkpoint);

        assert_eq!(engine.live().elements[5].k1, 1.2);
        assert_eq!(engine.particle_start(), ParticleStart::default());
    }

    #[test]
    fn test_rmat_rows() {
        let mut engine = engine();
        let rows = engine.execute("show rmat").unwrap();
        assert_eq!(rows.len(), engine.live().elements.len());
        assert_eq!(rows[0].split_whitespace().count(), 4 + 36);
        assert!(engine.is_mutating("set ele QF1 k1 = 1"));
        assert!(!engine.is_mutating("show rmat"));
    }
}
