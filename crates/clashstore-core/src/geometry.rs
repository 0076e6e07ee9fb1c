//! Geometry primitives persisted by the clash-zone store.
//!
//! The store never computes widths, heights, or rotations itself; these
//! types only carry values supplied by the host-side calculators. What the
//! store does own is validation (finite coordinates), tolerance comparison
//! for the dedup fallback match, and the fixed-tolerance fallback box used
//! by the spatial index.

use serde::{Deserialize, Serialize};

use crate::error::{ClashError, ClashResult};

/// A point (or direction vector) in the host model's coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Whether all three coordinates are finite (not NaN, not infinite).
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Reject non-finite coordinates before they reach storage.
    pub fn ensure_finite(&self, field: &str) -> ClashResult<()> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(ClashError::validation(
                field,
                format!("coordinates must be finite, got ({}, {}, {})", self.x, self.y, self.z),
            ))
        }
    }

    /// Component-wise comparison within an absolute tolerance.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.z - other.z).abs() <= tolerance
    }

    /// Round each coordinate to the given precision (e.g. `1e-4`).
    ///
    /// Used by identity derivation so that re-detections of the same clash
    /// hash to the same identity despite floating-point jitter.
    #[must_use]
    pub fn rounded(&self, precision: f64) -> Self {
        let round = |v: f64| (v / precision).round() * precision;
        Self::new(round(self.x), round(self.y), round(self.z))
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    #[must_use]
    pub const fn new(min: Point3, max: Point3) -> Self {
        Self { min, max }
    }

    /// A cube of half-extent `tolerance` centered on `point`.
    ///
    /// The spatial index falls back to this for zones without a placed
    /// object, so every zone is indexable.
    #[must_use]
    pub fn around_point(point: Point3, tolerance: f64) -> Self {
        Self {
            min: Point3::new(point.x - tolerance, point.y - tolerance, point.z - tolerance),
            max: Point3::new(point.x + tolerance, point.y + tolerance, point.z + tolerance),
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    /// A box with zero or negative extent on any axis carries no spatial
    /// information and must not enter the index.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        !self.is_finite()
            || self.max.x <= self.min.x
            || self.max.y <= self.min.y
            || self.max.z <= self.min.z
    }

    /// Whether two boxes overlap (inclusive on the boundary).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Whether `point` lies inside or on the boundary of the box.
    #[must_use]
    pub fn contains(&self, point: &Point3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Smallest box containing both inputs.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }
}

/// Rotation of a placed object about the vertical axis.
///
/// Radians are authoritative; degrees and the sine/cosine pair are cached
/// at construction so downstream placement code never recomputes them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub radians: f64,
    pub degrees: f64,
    pub sin: f64,
    pub cos: f64,
}

impl Rotation {
    #[must_use]
    pub fn from_radians(radians: f64) -> Self {
        Self {
            radians,
            degrees: radians.to_degrees(),
            sin: radians.sin(),
            cos: radians.cos(),
        }
    }

    /// Rebuild from all four persisted scalars, trusting the stored cache.
    #[must_use]
    pub const fn from_parts(radians: f64, degrees: f64, sin: f64, cos: f64) -> Self {
        Self {
            radians,
            degrees,
            sin,
            cos,
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.radians.is_finite()
            && self.degrees.is_finite()
            && self.sin.is_finite()
            && self.cos.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::{Aabb, Point3, Rotation};

    #[test]
    fn finite_point_passes_validation() {
        let p = Point3::new(1.0, 2.0, 3.0);
        assert!(p.is_finite());
        p.ensure_finite("intersection")
            .expect("finite point should validate");
    }

    #[test]
    fn nan_and_infinity_are_rejected() {
        for p in [
            Point3::new(f64::NAN, 0.0, 0.0),
            Point3::new(0.0, f64::INFINITY, 0.0),
            Point3::new(0.0, 0.0, f64::NEG_INFINITY),
        ] {
            assert!(!p.is_finite());
            let err = p
                .ensure_finite("intersection")
                .expect_err("non-finite point should be rejected");
            assert!(err.to_string().contains("intersection"));
        }
    }

    #[test]
    fn approx_eq_respects_tolerance() {
        let a = Point3::new(1.0, 2.0, 3.0);
        let b = Point3::new(1.0005, 2.0, 3.0);
        assert!(a.approx_eq(&b, 1e-3));
        assert!(!a.approx_eq(&b, 1e-4));
    }

    #[test]
    fn rounding_collapses_jitter() {
        let a = Point3::new(1.000_000_1, 2.0, 3.0).rounded(1e-4);
        let b = Point3::new(1.0, 2.0, 3.0).rounded(1e-4);
        assert_eq!(a, b);
    }

    #[test]
    fn around_point_is_symmetric_cube() {
        let cube = Aabb::around_point(Point3::new(1.0, 2.0, 3.0), 0.5);
        assert_eq!(cube.min, Point3::new(0.5, 1.5, 2.5));
        assert_eq!(cube.max, Point3::new(1.5, 2.5, 3.5));
        assert!(!cube.is_degenerate());
        assert!(cube.contains(&Point3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn degenerate_boxes_detected() {
        let flat = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 1.0));
        assert!(flat.is_degenerate());
        let inverted = Aabb::new(Point3::new(1.0, 1.0, 1.0), Point3::new(0.0, 0.0, 0.0));
        assert!(inverted.is_degenerate());
        let nan = Aabb::new(Point3::new(f64::NAN, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        assert!(nan.is_degenerate());
    }

    #[test]
    fn intersects_is_inclusive_on_boundary() {
        let a = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let touching = Aabb::new(Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));
        let separate = Aabb::new(Point3::new(1.1, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));
        assert!(a.intersects(&touching));
        assert!(!a.intersects(&separate));
    }

    #[test]
    fn union_covers_both_boxes() {
        let a = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Point3::new(-1.0, 0.5, 0.0), Point3::new(0.5, 2.0, 3.0));
        let u = a.union(&b);
        assert_eq!(u.min, Point3::new(-1.0, 0.0, 0.0));
        assert_eq!(u.max, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn rotation_caches_trig_values() {
        let r = Rotation::from_radians(std::f64::consts::FRAC_PI_2);
        assert!((r.degrees - 90.0).abs() < 1e-9);
        assert!((r.sin - 1.0).abs() < 1e-9);
        assert!(r.cos.abs() < 1e-9);
        assert!(r.is_finite());
    }

    #[test]
    fn rotation_serde_roundtrip() {
        let r = Rotation::from_radians(0.7);
        let json = serde_json::to_string(&r).expect("rotation should serialize");
        let back: Rotation = serde_json::from_str(&json).expect("rotation should deserialize");
        assert_eq!(back, r);
    }
}
