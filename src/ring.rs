//! Circular keyspace locations and distance

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position on the circular [0, 1) keyspace.
///
/// Locations compare by shorter-arc distance: the keyspace wraps, so
/// 0.95 and 0.05 are 0.1 apart, not 0.9.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location(f64);

impl Location {
    /// Construct from a raw value. Returns None outside [0, 1).
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Construct, wrapping any finite value onto the ring.
    pub fn wrapping(value: f64) -> Self {
        let v = value.rem_euclid(1.0);
        // rem_euclid(1.0) can return 1.0 for values like -1e-17
        if v >= 1.0 {
            Self(0.0)
        } else {
            Self(v)
        }
    }

    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        Self(rng.gen_range(0.0..1.0))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Shorter-arc distance to another location, in [0, 0.5].
    pub fn distance(&self, other: Location) -> f64 {
        let d = (self.0 - other.0).abs();
        d.min(1.0 - d)
    }

    /// True if self is strictly closer to `target` than `other` is.
    pub fn closer_to(&self, target: Location, other: Location) -> bool {
        self.distance(target) < other.distance(target)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bounds() {
        assert!(Location::new(0.0).is_some());
        assert!(Location::new(0.999).is_some());
        assert!(Location::new(1.0).is_none());
        assert!(Location::new(-0.1).is_none());
        assert!(Location::new(f64::NAN).is_none());
        assert!(Location::new(f64::INFINITY).is_none());
    }

    #[test]
    fn test_wrapping() {
        assert_eq!(Location::wrapping(1.25).value(), 0.25);
        assert_eq!(Location::wrapping(-0.25).value(), 0.75);
        assert!(Location::wrapping(-1e-17).value() < 1.0);
    }

    #[test]
    fn test_distance_wraps() {
        let a = Location::new(0.95).unwrap();
        let b = Location::new(0.05).unwrap();
        assert!((a.distance(b) - 0.1).abs() < 1e-12);

        let c = Location::new(0.2).unwrap();
        let d = Location::new(0.7).unwrap();
        assert!((c.distance(d) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Location::new(0.1).unwrap();
        let b = Location::new(0.6).unwrap();
        assert_eq!(a.distance(b), b.distance(a));
        assert_eq!(a.distance(a), 0.0);
    }

    #[test]
    fn test_closer_to() {
        let target = Location::new(0.5).unwrap();
        let near = Location::new(0.51).unwrap();
        let far = Location::new(0.9).unwrap();
        assert!(near.closer_to(target, far));
        assert!(!far.closer_to(target, near));
        assert!(!near.closer_to(target, near));
    }
}
