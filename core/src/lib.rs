//! Real-time GPS/IMU fusion for sailing boats
//!
//! This crate estimates a boat's position and velocity by fusing noisy, asynchronously arriving
//! GPS and IMU samples through a linear Kalman filter, and republishes the fused estimate at a
//! fixed cadence as navigation quantities (speed and course over ground, absolute position,
//! attitude and drift).
//!
//! ## Crate overview
//!
//! - [linalg]: symmetric positive-semidefinite solve and covariance helpers.
//! - [kalman]: the linear Kalman filter, generic over nalgebra dimensions, in a fixed-size and a
//!   dynamic-size flavour.
//! - [model]: the constant-velocity model matrices used for navigation.
//! - [earth]: local flat-Earth conversions between geodetic and north/east/up coordinates.
//! - [messages]: GPS and IMU sample types and their JSON decoding.
//! - [measurements]: preprocessing of samples into control inputs, measurements and noise.
//! - [shared]: latest-value mailboxes and the one-shot reference fix.
//! - [ticker]: drift-free fixed-rate loops with cooperative shutdown.
//! - [fusion]: one filter-loop step over drained mailboxes.
//! - [navigation]: translation of the filter state into published navigation quantities.
//! - [runtime]: the concurrent filter and publish loops.
//! - [config]: serde configuration loaded from JSON, YAML or TOML.
//! - [replay]: offline replay of CSV sensor logs.
//!
//! ## State definition
//!
//! $$
//! x = [p_n, p_e, p_u, v_n, v_e, v_u]
//! $$
//!
//! where $p$ is the position offset from the reference fix (the first valid GPS sample) in meters
//! and $v$ the velocity in m/s, both along north, east and up. The world-frame acceleration
//! derived from the IMU drives the prediction and the GPS position/velocity is observed directly.
pub mod config;
pub mod earth;
pub mod fusion;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod messages;
pub mod model;
pub mod navigation;
pub mod replay;
pub mod runtime;
pub mod shared;
pub mod ticker;

pub use config::FusionConfig;
pub use fusion::{EstimateSnapshot, FusionFilter};
pub use kalman::{CovarianceUpdate, DynamicKalmanFilter, FilterError, FixedKalmanFilter, KalmanFilter};
pub use measurements::{GpsFix, Orientation};
pub use messages::{GpsSample, ImuSample};
pub use navigation::{NavigationSolution, Translator};
pub use runtime::{EstimateSink, FusionContext, FusionRuntime, SinkError};

/// Wrap an angle to the range (-180, 180] degrees.
///
/// Computed in closed form, so arbitrarily large finite inputs wrap in constant time.
/// Non-finite inputs come back as NaN.
///
/// # Example
/// ```rust
/// use sailtrack::wrap_to_180;
/// assert_eq!(wrap_to_180(190.0), -170.0);
/// assert_eq!(wrap_to_180(-180.0), 180.0);
/// ```
pub fn wrap_to_180(angle: f64) -> f64 {
    let wrapped = 180.0 - (180.0 - angle).rem_euclid(360.0);
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

/// Wrap an angle to the range [0, 360) degrees.
///
/// # Example
/// ```rust
/// use sailtrack::wrap_to_360;
/// assert_eq!(wrap_to_360(-90.0), 270.0);
/// assert_eq!(wrap_to_360(360.0), 0.0);
/// ```
pub fn wrap_to_360(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to the modulus for tiny negative inputs.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}
