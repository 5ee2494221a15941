use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use tracing::warn;
use crate::compression::riemann::{magnitude, map_to_riemann_sphere};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{FieldValue, Record};

/// Output of the lossy conical projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CompressedPoint {
    Projected { tan_theta: f64, phi: f64, intensity: f64, stamp: f64 },
    Fallback { stamp: f64 },
}

impl CompressedPoint {
    /// `[tanθ, φ°, intensity, stamp]`, or `[stamp, 0, 0]` for the fallback.
    pub fn to_vec(&self) -> Vec<f64> {
        match *self {
            CompressedPoint::Projected { tan_theta, phi, intensity, stamp } => vec![tan_theta, phi, intensity, stamp],
            CompressedPoint::Fallback { stamp } => vec![stamp, 0.0, 0.0],
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CompressedPoint::Fallback { .. })
    }
}

/// Conical projection of records through the Riemann sphere
#[derive(Debug, Clone, Copy)]
pub struct ConicalProjection {
    pub center: [f64; 3],
    pub focal_point: [f64; 3],
}

impl Default for ConicalProjection {
    fn default() -> Self {
        ConicalProjection {
            center: [0.0, 0.0, 0.0],
            focal_point: [0.0, 0.0, f64::NEG_INFINITY],
        }
    }
}

impl ConicalProjection {
    pub fn with_focal_point(focal_point: [f64; 3]) -> Self {
        ConicalProjection { focal_point, ..Default::default() }
    }

    pub fn compress_record(&self, record: &Record) -> CompressedPoint {
        self.project(record.values().cloned().collect())
    }

    /// Objects contribute their values, arrays their non-null elements.
    /// Anything else yields the fallback.
    pub fn compress_json(&self, input: &Value) -> CompressedPoint {
        let values = match input {
            Value::Object(map) => map.values().map(FieldValue::from_json).collect(),
            Value::Array(items) => items
                .iter()
                .filter(|v| !v.is_null())
                .map(FieldValue::from_json)
                .collect(),
            other => {
                warn!(input = %other, "invalid data point for compression");
                return Self::fallback();
            }
        };
        self.project(values)
    }

    fn project(&self, values: Vec<FieldValue>) -> CompressedPoint {
        if values.is_empty() {
            return Self::fallback();
        }
        let mut coords: Vec<f64> = values.iter().map(hash_coordinate).collect();
        while coords.len() < 3 {
            coords.push(0.0);
        }

        let sphere = map_to_riemann_sphere(&coords);
        if sphere.iter().any(|v| !v.is_finite()) {
            warn!("invalid sphere mapping result");
            return Self::fallback();
        }

        let to_point = [
            sphere[0] - self.center[0],
            sphere[1] - self.center[1],
            sphere[2] - self.center[2],
        ];
        let theta = match angle_between(&self.axis(), &to_point) {
            Some(theta) => theta,
            None => {
                warn!("degenerate projection axis");
                return Self::fallback();
            }
        };
        let phi = to_point[1].atan2(to_point[0]);

        CompressedPoint::Projected {
            tan_theta: round_half_up(theta.tan() * 1e4) / 1e4,
            phi: round_half_up(phi.to_degrees()),
            intensity: magnitude(&sphere),
            stamp: clock_stamp(),
        }
    }

    /// Focal direction relative to the center; infinite components keep only their sign.
    fn axis(&self) -> [f64; 3] {
        let raw = [
            self.focal_point[0] - self.center[0],
            self.focal_point[1] - self.center[1],
            self.focal_point[2] - self.center[2],
        ];
        if raw.iter().any(|v| v.is_infinite()) {
            raw.map(|v| if v.is_infinite() { v.signum() } else { 0.0 })
        } else {
            raw
        }
    }

    /// Unit direction of a compressed tuple. Magnitude is not recoverable.
    pub fn decompress(&self, tuple: &[f64]) -> Result<[f64; 3]> {
        if tuple.len() < 3 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Compressed tuple needs 3 components, got {}", tuple.len()),
            ));
        }
        let theta = tuple[0].atan();
        let phi = tuple[1].to_radians();
        let intensity = tuple[2];
        let point = [
            intensity * theta.sin() * phi.cos(),
            intensity * theta.sin() * phi.sin(),
            intensity * theta.cos(),
        ];
        let norm = magnitude(&point);
        if norm == 0.0 || !norm.is_finite() {
            return Err(Error::new(ErrorKind::InvalidInput, "Compressed tuple has no direction".to_string()));
        }
        Ok(point.map(|v| v / norm))
    }

    pub fn fallback() -> CompressedPoint {
        CompressedPoint::Fallback { stamp: clock_stamp() }
    }
}

/// Text hashes into [0, 1000) through md5; other non-numbers are 0.
fn hash_coordinate(value: &FieldValue) -> f64 {
    match value {
        FieldValue::Text(text) => {
            let digest = Md5::digest(text.as_bytes());
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest);
            (u128::from_be_bytes(bytes) as f64) % 1000.0
        }
        other => other.as_number().filter(|n| !n.is_nan()).unwrap_or(0.0),
    }
}

fn angle_between(a: &[f64; 3], b: &[f64; 3]) -> Option<f64> {
    let denom = magnitude(a) * magnitude(b);
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    Some((dot / denom).clamp(-1.0, 1.0).acos())
}

/// Halves round toward positive infinity.
fn round_half_up(v: f64) -> f64 {
    (v + 0.5).floor()
}

fn clock_stamp() -> f64 {
    Utc::now().timestamp_millis().rem_euclid(1000) as f64
}
