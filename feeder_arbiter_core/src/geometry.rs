//! Distance helpers shared by attribution, hysteresis and the built-in strategies.

use serde::{Deserialize, Serialize};

/// A point in room coordinates (meters).
///
/// Deserializes from either `[x, y, z]` or `{ x, y, z }`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec3Repr")]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Vec3Repr {
    Array([f64; 3]),
    Fields { x: f64, y: f64, z: f64 },
}

impl From<Vec3Repr> for Vec3 {
    fn from(repr: Vec3Repr) -> Self {
        match repr {
            Vec3Repr::Array([x, y, z]) => Self { x, y, z },
            Vec3Repr::Fields { x, y, z } => Self { x, y, z },
        }
    }
}

impl From<(f64, f64, f64)> for Vec3 {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }
}

/// Timestamped position from a tracking backend. Immutable once built.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Seconds, same clock as trigger timestamps.
    pub timestamp: f64,
}

impl PositionSample {
    pub const fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self { x, y, z, timestamp }
    }

    #[inline]
    pub fn point(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    /// Tracking dropouts show up as NaN; those samples never reach the store.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.point().is_finite() && self.timestamp.is_finite()
    }

    /// Seconds elapsed since this sample at `now`. Never negative.
    #[inline]
    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }

    #[inline]
    pub fn is_fresh(&self, now: f64, timeout: f64) -> bool {
        self.age(now) <= timeout
    }
}

/// Which metric distance checks use. Planar ignores height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMode {
    #[default]
    #[serde(rename = "euclidean_3d")]
    Euclidean3d,
    #[serde(rename = "planar_2d")]
    Planar2d,
}

#[inline]
pub fn distance_3d(a: Vec3, b: Vec3) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[inline]
pub fn distance_2d(a: Vec3, b: Vec3) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

#[inline]
pub fn distance(mode: DistanceMode, a: Vec3, b: Vec3) -> f64 {
    match mode {
        DistanceMode::Euclidean3d => distance_3d(a, b),
        DistanceMode::Planar2d => distance_2d(a, b),
    }
}

/// Inclusive radius check.
#[inline]
pub fn within_radius(mode: DistanceMode, a: Vec3, b: Vec3, radius: f64) -> bool {
    distance(mode, a, b) <= radius
}
