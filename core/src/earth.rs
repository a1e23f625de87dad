//! Local flat-Earth coordinate conversions
//!
//! Relative positions are expressed in a local tangent plane anchored at the reference fix.
//! Latitude and longitude differences are converted to meters with a spherical Earth of fixed
//! circumference, longitude being shrunk by the cosine of the mean latitude. This is a
//! flat-Earth approximation: it is accurate for the few kilometers a vessel travels around its
//! reference point and degrades with distance.
//!
//! The local frame axes are north, east, up (meters).

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Earth circumference used for degree-to-meter conversion (m)
pub const EARTH_CIRCUMFERENCE: f64 = 40_075.0 * 1000.0;

/// Geodetic position in degrees and meters above mean sea level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeodeticPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GeodeticPosition {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        GeodeticPosition {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// Meters per degree of latitude.
#[inline]
pub fn meters_per_degree() -> f64 {
    EARTH_CIRCUMFERENCE / 360.0
}

/// Scale factor converting longitude degrees to meters at the mean of two latitudes.
///
/// # Arguments
/// * `latitude` - current latitude in degrees
/// * `reference_latitude` - reference latitude in degrees
///
/// # Returns
/// `cos((latitude + reference_latitude) / 2)`, 1.0 at the equator.
///
/// # Example
/// ```rust
/// use sailtrack::earth::latitude_scale_factor;
/// assert!((latitude_scale_factor(0.0, 0.0) - 1.0).abs() < 1e-12);
/// ```
pub fn latitude_scale_factor(latitude: f64, reference_latitude: f64) -> f64 {
    (0.5 * (latitude + reference_latitude)).to_radians().cos()
}

/// Offset of `position` from `reference` in the local north/east/up frame (meters).
pub fn to_local(
    position: &GeodeticPosition,
    reference: &GeodeticPosition,
    latitude_factor: f64,
) -> Vector3<f64> {
    Vector3::new(
        (position.latitude - reference.latitude) * meters_per_degree(),
        (position.longitude - reference.longitude) * meters_per_degree() * latitude_factor,
        position.altitude - reference.altitude,
    )
}

/// Inverse of [`to_local`]: absolute position of a local north/east/up offset.
pub fn from_local(
    offset: &Vector3<f64>,
    reference: &GeodeticPosition,
    latitude_factor: f64,
) -> GeodeticPosition {
    GeodeticPosition {
        latitude: offset[0] / meters_per_degree() + reference.latitude,
        longitude: offset[1] / (meters_per_degree() * latitude_factor) + reference.longitude,
        altitude: offset[2] + reference.altitude,
    }
}
