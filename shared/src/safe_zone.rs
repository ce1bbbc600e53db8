//! Circular safe zones and inside/outside transition tracking.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{LatLon, ModelError};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const MIN_RADIUS_M: f64 = 25.0;
pub const MAX_RADIUS_M: f64 = 50_000.0;

/// Great-circle distance in metres.
pub fn haversine_distance(p1: LatLon, p2: LatLon) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat() - p2.lat()).abs() < EPSILON && (p1.lon() - p2.lon()).abs() < EPSILON {
        return 0.0;
    }

    let lat1 = p1.lat().to_radians();
    let lat2 = p2.lat().to_radians();
    let delta_lat = (p2.lat() - p1.lat()).to_radians();
    let delta_lon = (p2.lon() - p1.lon()).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());

    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeZone {
    pub center: LatLon,
    pub radius_m: f64,
    #[serde(default)]
    pub label: Option<String>,
}

impl SafeZone {
    pub fn new(center: LatLon, radius_m: f64) -> Result<Self, ModelError> {
        let zone = Self {
            center,
            radius_m,
            label: None,
        };
        zone.validate()?;
        Ok(zone)
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Zones also arrive through config and the remote tree, bypassing `new`.
    pub fn validate(&self) -> Result<(), ModelError> {
        if !self.center.is_valid() {
            return Err(ModelError::Validation("safe zone center out of range".into()));
        }
        if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&self.radius_m) {
            return Err(ModelError::Validation(format!(
                "safe zone radius must be between {MIN_RADIUS_M} and {MAX_RADIUS_M} m, got {}",
                self.radius_m
            )));
        }
        Ok(())
    }

    pub fn contains(&self, point: LatLon) -> bool {
        haversine_distance(self.center, point) <= self.radius_m
    }

    /// Shape written to both the parent's and the child's node.
    pub fn to_remote_value(&self) -> Value {
        json!({
            "center": { "lat": self.center.lat(), "lng": self.center.lon() },
            "radius": self.radius_m,
            "label": self.label,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTransition {
    Entered,
    Exited,
}

/// Remembers which side of the boundary the last fix was on.
#[derive(Debug, Clone, Default)]
pub struct ZoneTracker {
    zone: Option<SafeZone>,
    inside: Option<bool>,
}

impl ZoneTracker {
    pub fn new(zone: Option<SafeZone>) -> Self {
        Self { zone, inside: None }
    }

    pub fn zone(&self) -> Option<&SafeZone> {
        self.zone.as_ref()
    }

    /// Replacing the zone forgets the previous side.
    pub fn set_zone(&mut self, zone: Option<SafeZone>) {
        self.zone = zone;
        self.inside = None;
    }

    /// A first fix outside the zone counts as an exit; a first fix inside
    /// reports nothing.
    pub fn update(&mut self, point: LatLon) -> Option<ZoneTransition> {
        let zone = self.zone.as_ref()?;
        let inside = zone.contains(point);
        let previous = self.inside.replace(inside);
        match (previous, inside) {
            (None, false) | (Some(true), false) => Some(ZoneTransition::Exited),
            (Some(false), true) => Some(ZoneTransition::Entered),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lon: f64) -> LatLon {
        LatLon::new(lat, lon).unwrap()
    }

    #[test]
    fn haversine_known_distance() {
        // London to Paris, about 344 km
        let d = haversine_distance(p(51.5074, -0.1278), p(48.8566, 2.3522));
        assert!((d - 343_500.0).abs() < 2_000.0, "got {d}");
        assert_eq!(haversine_distance(p(1.0, 1.0), p(1.0, 1.0)), 0.0);
    }

    #[test]
    fn zone_validation() {
        assert!(SafeZone::new(p(0.0, 0.0), 200.0).is_ok());
        assert!(SafeZone::new(p(0.0, 0.0), 1.0).is_err());
        assert!(SafeZone::new(p(0.0, 0.0), 60_000.0).is_err());
    }

    #[test]
    fn tracker_reports_transitions() {
        let home = p(40.0, -74.0);
        let zone = SafeZone::new(home, 200.0).unwrap();
        let mut tracker = ZoneTracker::new(Some(zone));

        assert_eq!(tracker.update(home), None);
        assert_eq!(tracker.update(p(40.0, -74.001)), None); // ~85 m
        assert_eq!(tracker.update(p(40.01, -74.0)), Some(ZoneTransition::Exited));
        assert_eq!(tracker.update(p(40.02, -74.0)), None);
        assert_eq!(tracker.update(home), Some(ZoneTransition::Entered));
    }

    #[test]
    fn first_fix_outside_is_an_exit() {
        let mut tracker = ZoneTracker::new(Some(SafeZone::new(p(0.0, 0.0), 100.0).unwrap()));
        assert_eq!(tracker.update(p(1.0, 1.0)), Some(ZoneTransition::Exited));
    }

    #[test]
    fn no_zone_no_transitions() {
        let mut tracker = ZoneTracker::default();
        assert_eq!(tracker.update(p(1.0, 1.0)), None);
    }

    #[test]
    fn remote_shape() {
        let zone = SafeZone::new(p(1.5, 2.5), 300.0).unwrap().with_label("school");
        let v = zone.to_remote_value();
        assert_eq!(v["center"]["lng"], json!(2.5));
        assert_eq!(v["label"], json!("school"));
    }
}
