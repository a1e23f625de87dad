//! Estimate translation
//!
//! Converts the filter's local state into the navigation quantities published to consumers:
//! speed and course over ground, absolute position, vertical speed, attitude and drift.
//!
//! Drift is the signed angle between the bow direction (heading) and the direction of travel
//! (course), wrapped to (−180°, 180°]. A course to the right of the heading gives a negative
//! drift. Below the drift speed threshold the course is dominated by noise and drift is
//! reported as zero.

use nalgebra::Vector6;
use serde::{Deserialize, Serialize};

use crate::config::{CourseUnits, PublishConfig, SpeedUnits};
use crate::earth::from_local;
use crate::fusion::EstimateSnapshot;
use crate::measurements::GpsFix;
use crate::wrap_to_180;

/// Knots per meter per second.
pub const KNOTS_PER_METER_PER_SECOND: f64 = 1.94384;

/// Output record, serialized with the wire field names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationSolution {
    /// Longitude (deg)
    pub lon: f64,
    /// Latitude (deg)
    pub lat: f64,
    /// Course over ground, radians unless configured otherwise
    pub cog: f64,
    /// Speed over ground, m/s unless configured otherwise
    pub sog: f64,
    /// Altitude above mean sea level (m)
    pub altitude: f64,
    /// Vertical speed, positive up (m/s)
    pub ascension_speed: f64,
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
    /// Drift angle (deg)
    pub drift: f64,
}

/// Horizontal speed from the north/east velocity states.
pub fn speed_over_ground(state: &Vector6<f64>) -> f64 {
    state[3].hypot(state[4])
}

/// Direction of travel in radians, clockwise from north, in (−π, π].
pub fn course_over_ground(state: &Vector6<f64>) -> f64 {
    state[4].atan2(state[3])
}

/// Signed heading-minus-course angle in degrees, zero below `speed_threshold`.
///
/// # Arguments
/// * `heading` - bow direction (deg)
/// * `course` - direction of travel (rad)
/// * `speed` - speed over ground (m/s)
/// * `speed_threshold` - minimum speed for a meaningful course (m/s)
pub fn drift_angle(heading: f64, course: f64, speed: f64, speed_threshold: f64) -> f64 {
    if speed < speed_threshold {
        return 0.0;
    }
    wrap_to_180(wrap_to_180(heading) - wrap_to_180(course.to_degrees()))
}

/// Maps estimate snapshots to [`NavigationSolution`]s.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Translator {
    pub drift_speed_threshold: f64,
    pub course_units: CourseUnits,
    pub speed_units: SpeedUnits,
}

impl Default for Translator {
    fn default() -> Self {
        Translator::from_config(&PublishConfig::default())
    }
}

impl Translator {
    pub fn from_config(config: &PublishConfig) -> Self {
        Translator {
            drift_speed_threshold: config.drift_speed_threshold,
            course_units: config.course_units,
            speed_units: config.speed_units,
        }
    }

    pub fn translate(&self, estimate: &EstimateSnapshot, reference: &GpsFix) -> NavigationSolution {
        let state = &estimate.state;
        let sog = speed_over_ground(state);
        let cog = course_over_ground(state);
        let position = from_local(
            &state.fixed_rows::<3>(0).into_owned(),
            &reference.position,
            estimate.latitude_factor,
        );
        let orientation = &estimate.orientation;

        NavigationSolution {
            lon: position.longitude,
            lat: position.latitude,
            cog: match self.course_units {
                CourseUnits::Radians => cog,
                CourseUnits::Degrees => cog.to_degrees(),
            },
            sog: match self.speed_units {
                SpeedUnits::MetersPerSecond => sog,
                SpeedUnits::Knots => sog * KNOTS_PER_METER_PER_SECOND,
            },
            altitude: position.altitude,
            ascension_speed: state[5],
            heading: orientation.heading,
            pitch: wrap_to_180(orientation.pitch),
            roll: wrap_to_180(orientation.roll),
            drift: drift_angle(orientation.heading, cog, sog, self.drift_speed_threshold),
        }
    }
}
