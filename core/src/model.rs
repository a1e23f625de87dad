//! Constant-velocity navigation model
//!
//! Builds the model matrices for the 6-state navigation filter used by the fusion runtime:
//! position offset from the reference fix (north, east, up in meters) followed by velocity
//! (north, east, up in m/s). The world-frame acceleration derived from the IMU is the control
//! input and the GPS-derived position/velocity is observed directly.
//!
//! For a sample time `dt`:
//!
//! $$
//! F = \begin{bmatrix} I_3 & dt\,I_3 \\\\ 0 & I_3 \end{bmatrix}, \quad
//! G = \begin{bmatrix} \tfrac{1}{2} dt^2 I_3 \\\\ dt\,I_3 \end{bmatrix}, \quad
//! H = I_6, \quad
//! Q = G G^T \sigma_w^2
//! $$
//!
//! where $\sigma_w$ is the acceleration (process) noise standard deviation.

use crate::kalman::{CovarianceUpdate, DynamicKalmanFilter, FilterError, FixedKalmanFilter, KalmanFilter};

use nalgebra::{DMatrix, DVector, Matrix6, Matrix6x3, Vector6};
use serde::{Deserialize, Serialize};

/// Number of states: position offset (3) and velocity (3).
pub const STATE_DIM: usize = 6;
/// Number of control inputs: world-frame acceleration.
pub const CONTROL_DIM: usize = 3;
/// Number of measured quantities: GPS position offset (3) and velocity (3).
pub const MEASUREMENT_DIM: usize = 6;

/// The compile-time sized filter used for navigation.
pub type NavigationKalmanFilter = FixedKalmanFilter<STATE_DIM, CONTROL_DIM, MEASUREMENT_DIM>;

/// Initial covariance of a freshly constructed filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialCovariance {
    /// `P₀ = I`
    #[default]
    Identity,
    /// `P₀ = Q`
    ProcessNoise,
}

/// Model matrices of the constant-velocity system driven by acceleration.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantVelocityModel {
    pub transition: Matrix6<f64>,
    pub control: Matrix6x3<f64>,
    pub observation: Matrix6<f64>,
    pub process_noise: Matrix6<f64>,
}

impl ConstantVelocityModel {
    /// Build the model for a sample time in seconds and an acceleration noise standard
    /// deviation in m/s².
    pub fn new(sample_time: f64, process_noise_std: f64) -> Self {
        let mut transition = Matrix6::identity();
        let mut control = Matrix6x3::zeros();
        for axis in 0..3 {
            transition[(axis, axis + 3)] = sample_time;
            control[(axis, axis)] = 0.5 * sample_time * sample_time;
            control[(axis + 3, axis)] = sample_time;
        }
        let process_noise = control * control.transpose() * process_noise_std.powi(2);
        ConstantVelocityModel {
            transition,
            control,
            observation: Matrix6::identity(),
            process_noise,
        }
    }

    pub fn initial_covariance(&self, initial: InitialCovariance) -> Matrix6<f64> {
        match initial {
            InitialCovariance::Identity => Matrix6::identity(),
            InitialCovariance::ProcessNoise => self.process_noise,
        }
    }

    /// Stack-allocated filter with a zero initial state.
    pub fn fixed_filter(
        &self,
        initial: InitialCovariance,
        covariance_update: CovarianceUpdate,
    ) -> Result<NavigationKalmanFilter, FilterError> {
        Ok(KalmanFilter::with_initial_state(
            self.transition,
            self.control,
            self.observation,
            self.process_noise,
            Vector6::zeros(),
            self.initial_covariance(initial),
        )?
        .with_covariance_update(covariance_update))
    }

    /// Heap-allocated filter with the same model, dimensions checked at construction.
    pub fn dynamic_filter(
        &self,
        initial: InitialCovariance,
        covariance_update: CovarianceUpdate,
    ) -> Result<DynamicKalmanFilter, FilterError> {
        let dense = |m: &[f64], rows: usize, cols: usize| DMatrix::from_column_slice(rows, cols, m);
        Ok(KalmanFilter::with_initial_state(
            dense(self.transition.as_slice(), STATE_DIM, STATE_DIM),
            dense(self.control.as_slice(), STATE_DIM, CONTROL_DIM),
            dense(self.observation.as_slice(), MEASUREMENT_DIM, STATE_DIM),
            dense(self.process_noise.as_slice(), STATE_DIM, STATE_DIM),
            DVector::zeros(STATE_DIM),
            dense(
                self.initial_covariance(initial).as_slice(),
                STATE_DIM,
                STATE_DIM,
            ),
        )?
        .with_covariance_update(covariance_update))
    }
}
