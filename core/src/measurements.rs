//! Sensor preprocessing
//!
//! Pure transformations from raw sensor samples to filter inputs:
//!
//! - [`GpsFix::from_sample`] scales the integer-encoded GPS fields to degrees, meters and m/s.
//! - [`GpsFix::measurement`] builds the measurement vector `z` (local position offset from the
//!   reference fix followed by north/east/up velocity) and the diagonal measurement noise `R`.
//! - [`Orientation::from_imu`] derives heading, pitch and roll from the IMU Euler angles.
//! - [`world_acceleration`] rotates the body-frame linear acceleration by heading to obtain the
//!   control input.
//!
//! Reported accuracies are treated as 2-sigma half-widths, so each variance is
//! `(accuracy / 2)²`.

use crate::earth::{GeodeticPosition, latitude_scale_factor, to_local};
use crate::messages::{GpsSample, ImuSample};
use crate::wrap_to_360;

use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Scale of the latitude/longitude wire fields (1e-7 deg per unit)
pub const DEGREES_SCALE: f64 = 1e-7;
/// Scale of the height, velocity and accuracy wire fields (mm → m)
pub const MILLI_SCALE: f64 = 1e-3;

/// A GPS sample in SI units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub position: GeodeticPosition,
    /// North, east, down velocity (m/s)
    pub velocity_ned: Vector3<f64>,
    /// Horizontal accuracy (m)
    pub horizontal_accuracy: f64,
    /// Vertical accuracy (m)
    pub vertical_accuracy: f64,
    /// Speed accuracy (m/s)
    pub speed_accuracy: f64,
    pub fix_type: Option<i32>,
}

/// Filter-ready GPS measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpsMeasurement {
    /// `[north, east, up, v_north, v_east, v_up]`
    pub vector: Vector6<f64>,
    /// Diagonal measurement noise covariance `R`
    pub noise: Matrix6<f64>,
    /// Longitude scale factor at the mean of the fix and reference latitudes
    pub latitude_factor: f64,
}

impl GpsFix {
    /// Normalize a raw sample.
    pub fn from_sample(sample: &GpsSample) -> Self {
        GpsFix {
            position: GeodeticPosition::new(
                sample.lat * DEGREES_SCALE,
                sample.lon * DEGREES_SCALE,
                sample.h_msl * MILLI_SCALE,
            ),
            velocity_ned: Vector3::new(sample.vel_n, sample.vel_e, sample.vel_d) * MILLI_SCALE,
            horizontal_accuracy: sample.h_acc * MILLI_SCALE,
            vertical_accuracy: sample.v_acc * MILLI_SCALE,
            speed_accuracy: sample.s_acc * MILLI_SCALE,
            fix_type: sample.fix_type,
        }
    }

    /// Build the measurement relative to `reference`.
    pub fn measurement(&self, reference: &GpsFix) -> GpsMeasurement {
        let latitude_factor =
            latitude_scale_factor(self.position.latitude, reference.position.latitude);
        GpsMeasurement {
            vector: measurement_vector(self, reference, latitude_factor),
            noise: measurement_noise(self),
            latitude_factor,
        }
    }
}

/// Measurement vector: local offset from the reference fix and north/east/up velocity.
pub fn measurement_vector(fix: &GpsFix, reference: &GpsFix, latitude_factor: f64) -> Vector6<f64> {
    let offset = to_local(&fix.position, &reference.position, latitude_factor);
    Vector6::new(
        offset[0],
        offset[1],
        offset[2],
        fix.velocity_ned[0],
        fix.velocity_ned[1],
        -fix.velocity_ned[2],
    )
}

/// Diagonal measurement noise `0.25·diag(h², h², v², s², s², s²)`.
pub fn measurement_noise(fix: &GpsFix) -> Matrix6<f64> {
    let h = fix.horizontal_accuracy.powi(2);
    let v = fix.vertical_accuracy.powi(2);
    let s = fix.speed_accuracy.powi(2);
    Matrix6::from_diagonal(&(Vector6::new(h, h, v, s, s, s) * 0.25))
}

/// Whether a raw GPS sample may be fused: all required fields finite and, when the receiver
/// reports a fix type, at least `min_fix_type`.
pub fn is_valid_fix(sample: &GpsSample, min_fix_type: i32) -> bool {
    sample.is_complete() && sample.fix_type.is_none_or(|fix| fix >= min_fix_type)
}

/// Vessel attitude in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Orientation {
    /// Derive the attitude from the IMU Euler angles: `heading = 360 − z` wrapped to [0, 360),
    /// `pitch = −y`, `roll = x`.
    pub fn from_imu(imu: &ImuSample) -> Self {
        Orientation {
            heading: wrap_to_360(360.0 - imu.euler[2]),
            pitch: -imu.euler[1],
            roll: imu.euler[0],
        }
    }
}

/// Rotation about the vertical axis by `heading` degrees.
pub fn heading_rotation(heading: f64) -> Matrix3<f64> {
    let (sin, cos) = heading.to_radians().sin_cos();
    Matrix3::new(cos, sin, 0.0, -sin, cos, 0.0, 0.0, 0.0, 1.0)
}

/// Body-to-world acceleration: only yaw is compensated, pitch and roll are ignored.
pub fn world_acceleration(imu: &ImuSample, orientation: &Orientation) -> Vector3<f64> {
    heading_rotation(orientation.heading) * imu.linear_accel
}
