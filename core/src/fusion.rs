//! One filter-loop step: drained sensor samples in, fused estimate out.
//!
//! [`FusionFilter`] owns the Kalman filter (fixed or dynamic representation behind the
//! [`NavigationFilter`] trait) and the per-tick derived quantities that travel with the state:
//! the latitude scale factor of the last fused GPS fix and the last IMU orientation.
//!
//! Per tick:
//! 1. fresh IMU sample: derive orientation, rotate the acceleration to the world frame and
//!    predict with it as control input; otherwise predict without control input.
//! 2. fresh valid GPS sample and a reference fix: build `z` and `R`, set `R` and correct;
//!    otherwise skip the correction.

use nalgebra::{DMatrix, DVector, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::config::{FilterConfig, Representation};
use crate::kalman::{DynamicKalmanFilter, FilterError};
use crate::measurements::{GpsFix, Orientation, is_valid_fix, world_acceleration};
use crate::messages::{GpsSample, ImuSample};
use crate::model::{ConstantVelocityModel, MEASUREMENT_DIM, NavigationKalmanFilter, STATE_DIM};
use crate::shared::Snapshot;

/// The operations the fusion step needs from a 6-state / 3-control / 6-measurement filter.
pub trait NavigationFilter: Send {
    /// Time update with a world-frame acceleration as control input.
    fn propagate(&mut self, acceleration: &Vector3<f64>) -> Result<(), FilterError>;
    /// Time update without control input.
    fn coast(&mut self);
    /// Set the measurement noise and run the measurement update.
    fn fuse(&mut self, measurement: &Vector6<f64>, noise: &Matrix6<f64>)
    -> Result<(), FilterError>;
    fn estimate(&self) -> Vector6<f64>;
    fn uncertainty(&self) -> Matrix6<f64>;
}

impl NavigationFilter for NavigationKalmanFilter {
    fn propagate(&mut self, acceleration: &Vector3<f64>) -> Result<(), FilterError> {
        self.predict_with_control(acceleration)
    }

    fn coast(&mut self) {
        self.predict();
    }

    fn fuse(
        &mut self,
        measurement: &Vector6<f64>,
        noise: &Matrix6<f64>,
    ) -> Result<(), FilterError> {
        self.update_noise_covariance(*noise)?;
        self.correct(measurement)
    }

    fn estimate(&self) -> Vector6<f64> {
        *self.state_estimate()
    }

    fn uncertainty(&self) -> Matrix6<f64> {
        *self.state_covariance_estimate()
    }
}

impl NavigationFilter for DynamicKalmanFilter {
    fn propagate(&mut self, acceleration: &Vector3<f64>) -> Result<(), FilterError> {
        self.predict_with_control(&DVector::from_column_slice(acceleration.as_slice()))
    }

    fn coast(&mut self) {
        self.predict();
    }

    fn fuse(
        &mut self,
        measurement: &Vector6<f64>,
        noise: &Matrix6<f64>,
    ) -> Result<(), FilterError> {
        self.update_noise_covariance(DMatrix::from_column_slice(
            MEASUREMENT_DIM,
            MEASUREMENT_DIM,
            noise.as_slice(),
        ))?;
        self.correct(&DVector::from_column_slice(measurement.as_slice()))
    }

    fn estimate(&self) -> Vector6<f64> {
        let state = self.state_estimate();
        Vector6::from_fn(|i, _| state.get(i).copied().unwrap_or(0.0))
    }

    fn uncertainty(&self) -> Matrix6<f64> {
        let covariance = self.state_covariance_estimate();
        Matrix6::from_fn(|i, j| covariance.get((i, j)).copied().unwrap_or(0.0))
    }
}

/// Fused estimate handed from the filter loop to the publish loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateSnapshot {
    /// `[north, east, up, v_north, v_east, v_up]` relative to the reference fix
    pub state: Vector6<f64>,
    pub latitude_factor: f64,
    pub orientation: Orientation,
}

impl Default for EstimateSnapshot {
    fn default() -> Self {
        EstimateSnapshot {
            state: Vector6::zeros(),
            latitude_factor: 1.0,
            orientation: Orientation::default(),
        }
    }
}

/// What happened during one [`FusionFilter::step`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Prediction used the IMU acceleration.
    pub used_imu: bool,
    /// A GPS measurement was fused.
    pub corrected: bool,
}

pub struct FusionFilter {
    filter: Box<dyn NavigationFilter>,
    latitude_factor: f64,
    orientation: Orientation,
    min_fix_type: i32,
    last_report: StepReport,
}

impl std::fmt::Debug for FusionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionFilter")
            .field("state", &self.filter.estimate().as_slice())
            .field("latitude_factor", &self.latitude_factor)
            .field("orientation", &self.orientation)
            .finish()
    }
}

impl FusionFilter {
    pub fn new(filter: Box<dyn NavigationFilter>) -> Self {
        FusionFilter {
            filter,
            latitude_factor: 1.0,
            orientation: Orientation::default(),
            min_fix_type: 0,
            last_report: StepReport::default(),
        }
    }

    /// Build the constant-velocity filter described by `config`.
    pub fn from_config(config: &FilterConfig) -> Result<Self, FilterError> {
        let model = ConstantVelocityModel::new(
            config.sample_time().as_secs_f64(),
            config.process_noise_std,
        );
        let filter: Box<dyn NavigationFilter> = match config.representation {
            Representation::Fixed => {
                Box::new(model.fixed_filter(config.initial_covariance, config.covariance_update)?)
            }
            Representation::Dynamic => Box::new(
                model.dynamic_filter(config.initial_covariance, config.covariance_update)?,
            ),
        };
        log::debug!(
            "built {:?} {STATE_DIM}-state filter, dt {:?}, process noise std {}",
            config.representation,
            config.sample_time(),
            config.process_noise_std
        );
        Ok(FusionFilter {
            min_fix_type: config.min_fix_type,
            ..FusionFilter::new(filter)
        })
    }

    /// Run one predict (and possibly correct) cycle on freshly drained mailboxes.
    ///
    /// A failed correction is logged and skipped; the predicted belief is kept.
    pub fn step(
        &mut self,
        gps: &Snapshot<GpsSample>,
        imu: &Snapshot<ImuSample>,
        reference: Option<&GpsFix>,
    ) -> EstimateSnapshot {
        let mut report = StepReport::default();

        match imu.fresh_value() {
            Some(sample) => {
                self.orientation = Orientation::from_imu(sample);
                let acceleration = world_acceleration(sample, &self.orientation);
                match self.filter.propagate(&acceleration) {
                    Ok(()) => report.used_imu = true,
                    Err(e) => {
                        log::warn!("prediction with acceleration failed, coasting: {e}");
                        self.filter.coast();
                    }
                }
            }
            None => self.filter.coast(),
        }

        let fresh_fix = gps
            .fresh_value()
            .filter(|sample| is_valid_fix(sample, self.min_fix_type));
        if let (Some(sample), Some(reference)) = (fresh_fix, reference) {
            let measurement = GpsFix::from_sample(sample).measurement(reference);
            match self.filter.fuse(&measurement.vector, &measurement.noise) {
                Ok(()) => {
                    self.latitude_factor = measurement.latitude_factor;
                    report.corrected = true;
                }
                Err(e) => log::warn!("GPS correction skipped: {e}"),
            }
        }

        self.last_report = report;
        self.snapshot()
    }

    pub fn snapshot(&self) -> EstimateSnapshot {
        EstimateSnapshot {
            state: self.filter.estimate(),
            latitude_factor: self.latitude_factor,
            orientation: self.orientation,
        }
    }

    pub fn uncertainty(&self) -> Matrix6<f64> {
        self.filter.uncertainty()
    }

    pub fn last_report(&self) -> StepReport {
        self.last_report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::DEGREES_SCALE;
    use assert_approx_eq::assert_approx_eq;

    fn fresh<T>(value: T) -> Snapshot<T> {
        Snapshot {
            value: Some(value),
            fresh: true,
        }
    }

    fn stale<T>(value: Option<T>) -> Snapshot<T> {
        Snapshot {
            value,
            fresh: false,
        }
    }

    fn gps(lat_deg: f64, vel_n_mm: f64) -> GpsSample {
        GpsSample {
            lat: lat_deg / DEGREES_SCALE,
            lon: 9.0 / DEGREES_SCALE,
            vel_n: vel_n_mm,
            h_acc: 1_000.0,
            v_acc: 1_000.0,
            s_acc: 100.0,
            ..GpsSample::default()
        }
    }

    fn filters() -> Vec<FusionFilter> {
        [Representation::Fixed, Representation::Dynamic]
            .into_iter()
            .map(|representation| {
                FusionFilter::from_config(&FilterConfig {
                    representation,
                    ..FilterConfig::default()
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn without_samples_the_state_coasts() {
        for mut filter in filters() {
            let snapshot = filter.step(&stale(None), &stale(None), None);
            assert_eq!(snapshot.state, Vector6::zeros());
            assert_eq!(snapshot.latitude_factor, 1.0);
            assert_eq!(filter.last_report(), StepReport::default());
            // Covariance grew by Q.
            assert!(filter.uncertainty()[(0, 0)] > 1.0);
        }
    }

    #[test]
    fn imu_acceleration_drives_prediction() {
        for mut filter in filters() {
            // euler z = 360 gives heading 0, so body x is north.
            let imu = ImuSample::new(Vector3::new(0.0, 0.0, 360.0), Vector3::new(2.0, 0.0, 0.0));
            let snapshot = filter.step(&stale(None), &fresh(imu), None);
            assert!(filter.last_report().used_imu);
            assert_approx_eq!(snapshot.state[3], 0.2, 1e-12);
            assert_approx_eq!(snapshot.state[0], 0.5 * 2.0 * 0.01, 1e-12);
            assert_approx_eq!(snapshot.orientation.heading, 0.0, 1e-12);

            // A stale IMU sample is not reused: velocity is kept, not increased.
            let snapshot = filter.step(&stale(None), &stale(Some(imu)), None);
            assert!(!filter.last_report().used_imu);
            assert_approx_eq!(snapshot.state[3], 0.2, 1e-12);
        }
    }

    #[test]
    fn gps_needs_a_reference() {
        for mut filter in filters() {
            let sample = gps(45.001, 1_000.0);
            filter.step(&fresh(sample), &stale(None), None);
            assert!(!filter.last_report().corrected);

            let reference = GpsFix::from_sample(&gps(45.0, 0.0));
            let snapshot = filter.step(&fresh(sample), &stale(None), Some(&reference));
            assert!(filter.last_report().corrected);
            assert!(snapshot.state[0] > 80.0);
            assert!(snapshot.state[3] > 0.9);
            assert_approx_eq!(snapshot.latitude_factor, 45.0005f64.to_radians().cos(), 1e-9);
        }
    }

    #[test]
    fn invalid_fix_is_not_fused() {
        let mut filter = FusionFilter::from_config(&FilterConfig {
            min_fix_type: 3,
            ..FilterConfig::default()
        })
        .unwrap();
        let reference = GpsFix::from_sample(&gps(45.0, 0.0));
        let mut sample = gps(45.001, 1_000.0);
        sample.fix_type = Some(1);
        let snapshot = filter.step(&fresh(sample), &stale(None), Some(&reference));
        assert!(!filter.last_report().corrected);
        assert_eq!(snapshot.state, Vector6::zeros());
    }

    #[test]
    fn fixed_and_dynamic_agree() {
        let mut filters = filters();
        let reference = GpsFix::from_sample(&gps(45.0, 0.0));
        let imu = ImuSample::new(Vector3::new(1.0, -2.0, 350.0), Vector3::new(0.3, -0.1, 0.05));
        let mut outputs = Vec::new();
        for filter in filters.iter_mut() {
            let mut last = EstimateSnapshot::default();
            for k in 0..50 {
                let gps_snapshot = if k % 2 == 0 {
                    fresh(gps(45.0 + 1e-6 * k as f64, 500.0))
                } else {
                    stale(None)
                };
                last = filter.step(&gps_snapshot, &fresh(imu), Some(&reference));
            }
            outputs.push(last);
        }
        assert!((outputs[0].state - outputs[1].state).amax() < 1e-9);
        assert_eq!(outputs[0].orientation, outputs[1].orientation);
    }
}
