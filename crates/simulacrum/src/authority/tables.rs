//! Derived tables and snapshots
//!
//! Parsers for engine output, the JSON documents behind the TWISS and RMAT
//! channels, and the arrays carried by the orbit and profile snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simulacrum_types::{ArrayPayload, MarkerTwiss};

use super::AuthorityError;

/// Orbit values leave the engine in metres and are broadcast in millimetres
pub const METRES_TO_MM: f64 = 1000.0;

fn number(field: &str, text: &str) -> Result<f64, AuthorityError> {
    text.parse::<f64>()
        .map_err(|_| AuthorityError::Parse(format!("{} is not a number: {}", field, text)))
}

fn device(text: &str) -> Option<String> {
    (text != "-").then(|| text.to_string())
}

/// Parse one number per line
pub fn parse_column(lines: &[String]) -> Result<Vec<f64>, AuthorityError> {
    lines.iter().map(|line| number("value", line.trim())).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Lattice Rows
// ─────────────────────────────────────────────────────────────────────────────

/// One row of `show lattice`
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeRow {
    pub element: String,
    pub kind: String,
    pub device: Option<String>,
    pub s: f64,
    pub length: f64,
    pub p0c: f64,
    pub alpha_x: f64,
    pub beta_x: f64,
    pub eta_x: f64,
    pub etap_x: f64,
    pub psi_x: f64,
    pub alpha_y: f64,
    pub beta_y: f64,
    pub eta_y: f64,
    pub etap_y: f64,
    pub psi_y: f64,
    pub x: f64,
    pub y: f64,
}

impl LatticeRow {
    pub fn parse(line: &str) -> Result<Self, AuthorityError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 19 {
            return Err(AuthorityError::Parse(format!("short lattice row: {}", line)));
        }
        let n = |i: usize| number("lattice column", fields[i]);

        Ok(Self {
            element: fields[1].to_string(),
            kind: fields[2].to_string(),
            device: device(fields[3]),
            s: n(4)?,
            length: n(5)?,
            p0c: n(6)?,
            alpha_x: n(7)?,
            beta_x: n(8)?,
            eta_x: n(9)?,
            etap_x: n(10)?,
            psi_x: n(11)?,
            alpha_y: n(12)?,
            beta_y: n(13)?,
            eta_y: n(14)?,
            etap_y: n(15)?,
            psi_y: n(16)?,
            x: n(17)?,
            y: n(18)?,
        })
    }

    pub fn parse_all(lines: &[String]) -> Result<Vec<Self>, AuthorityError> {
        lines.iter().map(|line| Self::parse(line)).collect()
    }
}

/// A row of the TWISS table channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwissRow {
    pub element: String,
    pub device_name: String,
    pub s: f64,
    pub length: f64,
    pub p0c: f64,
    pub alpha_x: f64,
    pub beta_x: f64,
    pub eta_x: f64,
    pub etap_x: f64,
    pub psi_x: f64,
    pub alpha_y: f64,
    pub beta_y: f64,
    pub eta_y: f64,
    pub etap_y: f64,
    pub psi_y: f64,
}

impl From<&LatticeRow> for TwissRow {
    fn from(row: &LatticeRow) -> Self {
        Self {
            element: row.element.clone(),
            device_name: row.device.clone().unwrap_or_default(),
            s: row.s,
            length: row.length,
            p0c: row.p0c,
            alpha_x: row.alpha_x,
            beta_x: row.beta_x,
            eta_x: row.eta_x,
            etap_x: row.etap_x,
            psi_x: row.psi_x,
            alpha_y: row.alpha_y,
            beta_y: row.beta_y,
            eta_y: row.eta_y,
            etap_y: row.etap_y,
            psi_y: row.psi_y,
        }
    }
}

/// A row of the RMAT table channels: the cumulative 6x6 matrix at one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmatRow {
    pub element: String,
    pub device_name: String,
    pub s: f64,
    pub r: [[f64; 6]; 6],
}

impl RmatRow {
    pub fn parse(line: &str) -> Result<Self, AuthorityError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 + 36 {
            return Err(AuthorityError::Parse(format!("malformed rmat row: {}", line)));
        }

        let mut r = [[0.0; 6]; 6];
        for (k, text) in fields[4..].iter().enumerate() {
            r[k / 6][k % 6] = number("rmat entry", text)?;
        }

        Ok(Self {
            element: fields[1].to_string(),
            device_name: device(fields[2]).unwrap_or_default(),
            s: number("s", fields[3])?,
            r,
        })
    }

    pub fn parse_all(lines: &[String]) -> Result<Vec<Self>, AuthorityError> {
        lines.iter().map(|line| Self::parse(line)).collect()
    }
}

/// The JSON document stored in a table channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDocument<T> {
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<T>,
}

impl<T: Serialize> TableDocument<T> {
    pub fn now(rows: Vec<T>) -> Self {
        Self {
            timestamp: Utc::now(),
            rows,
        }
    }

    pub fn to_json(&self) -> Result<String, AuthorityError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot Arrays
// ─────────────────────────────────────────────────────────────────────────────

/// `[3, N]` orbit array from metre-valued x and y and the energy at each monitor
pub fn orbit_array(x: &[f64], y: &[f64], energy: &[f64]) -> Result<ArrayPayload, AuthorityError> {
    let to_mm = |values: &[f64]| values.iter().map(|v| v * METRES_TO_MM).collect::<Vec<_>>();
    Ok(ArrayPayload::from_rows(&[to_mm(x), to_mm(y), energy.to_vec()])?)
}

/// `[5, M]` array of x, y (mm), beta_x, beta_y and energy at each profile monitor
pub fn profile_array(rows: &[LatticeRow]) -> Result<ArrayPayload, AuthorityError> {
    let screens: Vec<&LatticeRow> = rows.iter().filter(|row| row.kind == "profile").collect();
    let column = |f: fn(&LatticeRow) -> f64| screens.iter().map(|row| f(row)).collect::<Vec<_>>();

    Ok(ArrayPayload::from_rows(&[
        column(|row| row.x * METRES_TO_MM),
        column(|row| row.y * METRES_TO_MM),
        column(|row| row.beta_x),
        column(|row| row.beta_y),
        column(|row| row.p0c),
    ])?)
}

/// Parse `show twiss` output for `element`
pub fn parse_marker_twiss(element: &str, lines: &[String]) -> Result<MarkerTwiss, AuthorityError> {
    let lookup = |key: &str| -> Result<f64, AuthorityError> {
        lines
            .iter()
            .filter_map(|line| line.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .ok_or_else(|| AuthorityError::Parse(format!("{} missing from twiss of {}", key, element)))
            .and_then(|(_, v)| number(key, v.trim()))
    };

    Ok(MarkerTwiss {
        element: element.to_string(),
        alpha_x: lookup("alpha_x")?,
        beta_x: lookup("beta_x")?,
        alpha_y: lookup("alpha_y")?,
        beta_y: lookup("beta_y")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_line(element: &str, kind: &str, x: f64) -> String {
        format!(
            "3 {} {} OTRS:IN20:571 4.5 0 135000000 0.1 2.0 0 0 0.3 -0.1 3.0 0 0 0.4 {} 0 0",
            element, kind, x
        )
    }

    #[test]
    fn test_lattice_row_parses_and_projects() {
        let row = LatticeRow::parse(&lattice_line("OTR1", "profile", 0.002)).unwrap();
        assert_eq!(row.device.as_deref(), Some("OTRS:IN20:571"));
        assert_eq!(row.beta_y, 3.0);
        assert_eq!(row.x, 0.002);

        let twiss = TwissRow::from(&row);
        assert_eq!(twiss.device_name, "OTRS:IN20:571");
        assert_eq!(twiss.psi_y, 0.4);

        assert!(LatticeRow::parse("1 D1 drift - 1.0").is_err());
        assert!(LatticeRow::parse(&lattice_line("OTR1", "profile", 0.0).replace("4.5", "far")).is_err());
    }

    #[test]
    fn test_profile_array_keeps_only_screens() {
        let rows = vec![
            LatticeRow::parse(&lattice_line("OTR1", "profile", 0.001)).unwrap(),
            LatticeRow::parse(&lattice_line("BPM1", "monitor", 0.5)).unwrap(),
        ];
        let array = profile_array(&rows).unwrap();
        assert_eq!(array.shape(), &[5, 1]);
        assert_eq!(array.row(0), Some(&[1.0][..]));
        assert_eq!(array.row(2), Some(&[2.0][..]));
        assert_eq!(array.row(4), Some(&[135_000_000.0][..]));
    }

    #[test]
    fn test_orbit_array_converts_to_mm() {
        let array = orbit_array(&[0.001, 0.002], &[0.0, -0.001], &[1.0e9, 1.0e9]).unwrap();
        assert_eq!(array.shape(), &[3, 2]);
        assert_eq!(array.row(0), Some(&[1.0, 2.0][..]));
        assert_eq!(array.row(1), Some(&[0.0, -1.0][..]));

        assert!(orbit_array(&[0.0], &[0.0, 0.0], &[0.0]).is_err());
    }

    #[test]
    fn test_rmat_row_round_trips_identity() {
        let mut line = "0 BEGIN - 0".to_string();
        for k in 0..36 {
            line.push_str(if k % 7 == 0 { " 1" } else { " 0" });
        }
        let row = RmatRow::parse(&line).unwrap();
        assert_eq!(row.device_name, "");
        assert_eq!(row.r[3][3], 1.0);
        assert_eq!(row.r[3][2], 0.0);
        assert!(RmatRow::parse("0 BEGIN - 0 1 0").is_err());
    }

    #[test]
    fn test_marker_twiss_parsing() {
        let lines: Vec<String> = ["s = 9", "beta_x = 12.5", "alpha_x = -0.5", "beta_y = 7", "alpha_y = 0.25"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let twiss = parse_marker_twiss("UNDSTART", &lines).unwrap();
        assert_eq!(twiss.beta_x, 12.5);
        assert_eq!(twiss.alpha_y, 0.25);

        assert!(parse_marker_twiss("UNDSTART", &lines[..2]).is_err());
    }

    #[test]
    fn test_table_document_json() {
        let doc = TableDocument::now(vec![1.0_f64, 2.0]);
        let json = doc.to_json().unwrap();
        let back: TableDocument<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows, vec![1.0, 2.0]);
    }
}
