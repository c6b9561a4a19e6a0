//! Broadcast snapshots
//!
//! A snapshot is a tagged, point-in-time copy of part of the model state. It
//! always travels as two parts: metadata (tag plus optional dtype/shape) and
//! a payload. Binary-array tags carry little-endian float64 data; structured
//! tags carry JSON.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known snapshot tags
pub mod tags {
    /// Orbit at every beam position monitor, shape `[3, N]` (x, y, energy)
    pub const ORBIT: &str = "orbit";
    /// Per-profile-monitor data, shape `[5, M]` (x, y, beta_x, beta_y, energy)
    pub const PROFILE_DATA: &str = "profile-data";
    /// Twiss parameters at the undulator start marker (structured)
    pub const TWISS_AT_MARKER: &str = "twiss-at-marker";
}

/// dtype string for float64 array payloads
pub const DTYPE_FLOAT64: &str = "float64";

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// The first part of every snapshot message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Content tag subscribers filter on
    pub tag: String,

    /// Element type of a binary array payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Shape of a binary array payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
}

impl SnapshotMetadata {
    /// Metadata for a structured (JSON) payload
    pub fn structured(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            dtype: None,
            shape: None,
        }
    }

    /// Metadata for a binary array payload
    pub fn array(tag: impl Into<String>, dtype: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            tag: tag.into(),
            dtype: Some(dtype.into()),
            shape: Some(shape),
        }
    }

    pub fn is_array(&self) -> bool {
        self.dtype.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Array Payload
// ─────────────────────────────────────────────────────────────────────────────

/// A dense row-major float64 array
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayPayload {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl ArrayPayload {
    /// Create an array, checking the data length against the shape
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, SnapshotError> {
        let expected = shape
            .iter()
            .try_fold(1usize, |len, &dim| len.checked_mul(dim))
            .ok_or_else(|| SnapshotError::ShapeOverflow(shape.clone()))?;
        if expected != data.len() {
            return Err(SnapshotError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Stack equal-length rows into a 2-D array
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, SnapshotError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(SnapshotError::LengthMismatch {
                    expected: cols,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(vec![rows.len(), cols], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Number of rows of a 2-D array
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Row `index` of a 2-D array
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        let cols = self.shape.get(1).copied().unwrap_or(0);
        let start = index.checked_mul(cols)?;
        self.data.get(start..start + cols)
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.data.len() * 8);
        for v in &self.data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Bytes::from(buf)
    }

    fn from_bytes(shape: Vec<usize>, bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() % 8 != 0 {
            return Err(SnapshotError::LengthMismatch {
                expected: bytes.len() / 8 * 8,
                actual: bytes.len(),
            });
        }
        let data = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        Self::new(shape, data)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// A complete snapshot message: metadata plus the encoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub payload: Bytes,
}

impl Snapshot {
    /// Build a binary-array snapshot
    pub fn array(tag: impl Into<String>, array: &ArrayPayload) -> Self {
        Self {
            metadata: SnapshotMetadata::array(tag, DTYPE_FLOAT64, array.shape.clone()),
            payload: array.to_bytes(),
        }
    }

    /// Build a structured snapshot from any serializable value
    pub fn structured<T: Serialize>(tag: impl Into<String>, value: &T) -> Result<Self, SnapshotError> {
        Ok(Self {
            metadata: SnapshotMetadata::structured(tag),
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn tag(&self) -> &str {
        &self.metadata.tag
    }

    /// Decode a binary-array payload using the metadata's dtype and shape
    pub fn decode_array(&self) -> Result<ArrayPayload, SnapshotError> {
        match self.metadata.dtype.as_deref() {
            Some(DTYPE_FLOAT64) => {}
            Some(other) => return Err(SnapshotError::UnsupportedDtype(other.to_string())),
            None => return Err(SnapshotError::MissingShape(self.metadata.tag.clone())),
        }
        let shape = self
            .metadata
            .shape
            .clone()
            .ok_or_else(|| SnapshotError::MissingShape(self.metadata.tag.clone()))?;
        ArrayPayload::from_bytes(shape, &self.payload)
    }

    /// Decode a structured payload
    pub fn decode_structured<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Twiss parameters at a named marker, broadcast as a structured snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerTwiss {
    pub element: String,
    pub alpha_x: f64,
    pub beta_x: f64,
    pub alpha_y: f64,
    pub beta_y: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error when building or decoding snapshots
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot '{0}' has no dtype/shape")]
    MissingShape(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Shape {0:?} has more elements than fit in memory")]
    ShapeOverflow(Vec<usize>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_snapshot_decodes_rows() {
        let array = ArrayPayload::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let snapshot = Snapshot::array(tags::ORBIT, &array);

        assert_eq!(snapshot.metadata.shape, Some(vec![3, 2]));
        assert_eq!(snapshot.payload.len(), 48);

        let decoded = snapshot.decode_array().unwrap();
        assert_eq!(decoded.rows(), 3);
        assert_eq!(decoded.row(1), Some(&[3.0, 4.0][..]));
        assert_eq!(decoded.row(3), None);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = ArrayPayload::from_rows(&[vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(result, Err(SnapshotError::LengthMismatch { expected: 2, actual: 1 })));
    }

    #[test]
    fn test_oversized_wire_shape_rejected() {
        let metadata: SnapshotMetadata =
            serde_json::from_str(r#"{"tag":"orbit","dtype":"float64","shape":[18446744073709551615,3]}"#).unwrap();
        let snapshot = Snapshot {
            metadata,
            payload: Bytes::from(vec![0u8; 16]),
        };

        let err = snapshot.decode_array().unwrap_err();
        assert!(matches!(err, SnapshotError::ShapeOverflow(ref shape) if shape == &[usize::MAX, 3]));
    }

    #[test]
    fn test_structured_metadata_has_no_shape() {
        let twiss = MarkerTwiss {
            element: "UNDSTART".into(),
            alpha_x: 0.5,
            beta_x: 12.0,
            alpha_y: -0.5,
            beta_y: 9.0,
        };
        let snapshot = Snapshot::structured(tags::TWISS_AT_MARKER, &twiss).unwrap();

        let json = serde_json::to_string(&snapshot.metadata).unwrap();
        assert_eq!(json, r#"{"tag":"twiss-at-marker"}"#);
        assert!(snapshot.decode_array().is_err());

        let back: MarkerTwiss = snapshot.decode_structured().unwrap();
        assert_eq!(back, twiss);
    }
}
