//! Geographic primitives for proximity queries.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Earth radius used by PostgreSQL's `earthdistance` `<@>` operator, in statute miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.747716;

/// A longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if !self.lng.is_finite() || !self.lat.is_finite() {
            return Err(Error::MalformedEntity(format!(
                "{} has non-finite coordinates",
                what
            )));
        }
        Ok(())
    }
}

/// Axis-aligned bounding box given by its south-west and north-east corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub sw: LngLat,
    pub ne: LngLat,
}

impl BoundingBox {
    pub fn new(sw: LngLat, ne: LngLat) -> Self {
        Self { sw, ne }
    }

    /// The box covering every valid coordinate.
    pub fn world() -> Self {
        Self {
            sw: LngLat::new(-180.0, -90.0),
            ne: LngLat::new(180.0, 90.0),
        }
    }

    /// Inclusive containment on both axes.
    pub fn contains(&self, p: LngLat) -> bool {
        self.sw.lng <= p.lng && p.lng <= self.ne.lng && self.sw.lat <= p.lat && p.lat <= self.ne.lat
    }

    pub fn validate(&self) -> Result<()> {
        self.sw.validate("bounding box south-west corner")?;
        self.ne.validate("bounding box north-east corner")?;
        if self.sw.lng > self.ne.lng || self.sw.lat > self.ne.lat {
            return Err(Error::MalformedEntity(format!(
                "bounding box corners are inverted: sw=({}, {}) ne=({}, {})",
                self.sw.lng, self.sw.lat, self.ne.lng, self.ne.lat
            )));
        }
        Ok(())
    }
}

/// Nearest-N request against the current snapshot.
///
/// `max == 0` yields no results. Pass [`NearbyQuery::UNLIMITED`] to return
/// every record inside the box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NearbyQuery {
    pub center: LngLat,
    pub bbox: BoundingBox,
    pub max: u64,
}

impl NearbyQuery {
    /// Result cap meaning "all matching rows".
    pub const UNLIMITED: u64 = u64::MAX;

    pub fn new(center: LngLat, bbox: BoundingBox, max: u64) -> Self {
        Self { center, bbox, max }
    }

    pub fn validate(&self) -> Result<()> {
        self.center.validate("center")?;
        self.bbox.validate()
    }

    /// Value for a SQL `LIMIT` clause; `None` binds as `LIMIT NULL` (no limit).
    pub fn sql_limit(&self) -> Option<i64> {
        i64::try_from(self.max).ok()
    }

    /// Cap as a slice length; saturates for unlimited queries.
    pub fn cap(&self) -> usize {
        usize::try_from(self.max).unwrap_or(usize::MAX)
    }
}

/// Great-circle distance in statute miles, matching `point(a) <@> point(b)`.
pub fn great_circle_miles(a: LngLat, b: LngLat) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().min(1.0).asin()
}
