//! Linear Kalman filter (time update / measurement update recursion)
//!
//! The filter is written once against nalgebra's dimension abstraction and instantiated
//! twice: [`FixedKalmanFilter`] with compile-time dimensions (stack allocated, fully
//! inlined arithmetic) and [`DynamicKalmanFilter`] with dimensions fixed at construction.
//! Both share the exact same predict/correct code.
//!
//! Notation follows the usual linear state-space model:
//!
//! $$
//! x_{k+1} = F x_k + G u_k + w_k, \quad w_k \sim N(0, Q)
//! $$
//! $$
//! z_k = H x_k + v_k, \quad v_k \sim N(0, R)
//! $$
//!
//! with `N` the state dimension, `M` the control dimension and `P` the measurement dimension.

use crate::linalg::{LinalgError, SolveOptions, spsd_solve};

use std::fmt::{self, Display};

use nalgebra::allocator::Allocator;
use nalgebra::{Const, DefaultAllocator, Dim, Dyn, OMatrix, OVector, U1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kalman filter with compile-time dimensions: `N` states, `M` controls, `P` measurements.
pub type FixedKalmanFilter<const N: usize, const M: usize, const P: usize> =
    KalmanFilter<Const<N>, Const<M>, Const<P>>;

/// Kalman filter with dimensions chosen at construction time.
pub type DynamicKalmanFilter = KalmanFilter<Dyn, Dyn, Dyn>;

/// Errors raised by the filter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    /// A matrix or vector does not have the shape implied by the model.
    #[error("{name} must be {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    Dimension {
        name: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    /// The innovation covariance or the measurement noise could not be factored.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Form of the covariance measurement update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceUpdate {
    /// `P ← P − K·H·P`. Cheapest, but round-off can slowly break symmetry and
    /// positive-semidefiniteness over very long runs.
    #[default]
    Subtractive,
    /// Joseph form `P ← (I − K·H)·P·(I − K·H)ᵀ + K·R·Kᵀ`, symmetric PSD by construction.
    Joseph,
}

fn check_shape(
    name: &'static str,
    shape: (usize, usize),
    expected: (usize, usize),
) -> Result<(), FilterError> {
    if shape == expected {
        Ok(())
    } else {
        Err(FilterError::Dimension {
            name,
            expected_rows: expected.0,
            expected_cols: expected.1,
            rows: shape.0,
            cols: shape.1,
        })
    }
}

/// Linear Kalman filter generic over its state (`N`), control (`M`) and measurement (`P`)
/// dimensions.
///
/// The model matrices `F`, `G`, `H` and `Q` are fixed at construction. The measurement
/// noise `R` is replaced through [`KalmanFilter::update_noise_covariance`], typically
/// once per measurement, from the sensor-reported accuracy. The belief (`x̂`, `P`)
/// changes only through the predict/correct operations.
#[derive(Clone, Debug)]
pub struct KalmanFilter<N: Dim, M: Dim, P: Dim>
where
    DefaultAllocator: Allocator<N, N>
        + Allocator<N>
        + Allocator<N, M>
        + Allocator<P, N>
        + Allocator<N, P>
        + Allocator<P, P>,
{
    transition: OMatrix<f64, N, N>,
    control: OMatrix<f64, N, M>,
    observation: OMatrix<f64, P, N>,
    process_noise: OMatrix<f64, N, N>,
    measurement_noise: OMatrix<f64, P, P>,
    /// Measurement-to-state coupling used by [`KalmanFilter::predict_with_measurement`].
    coupling: OMatrix<f64, N, P>,
    state: OVector<f64, N>,
    covariance: OMatrix<f64, N, N>,
    covariance_update: CovarianceUpdate,
    solve_options: SolveOptions,
}

impl<N: Dim, M: Dim, P: Dim> KalmanFilter<N, M, P>
where
    DefaultAllocator: Allocator<N, N>
        + Allocator<N>
        + Allocator<M>
        + Allocator<P>
        + Allocator<N, M>
        + Allocator<P, N>
        + Allocator<N, P>
        + Allocator<P, P>,
{
    /// Build a filter with a zero initial state and an identity initial covariance.
    ///
    /// # Arguments
    /// * `transition` - state transition matrix `F` (N×N)
    /// * `control` - control input matrix `G` (N×M)
    /// * `observation` - observation matrix `H` (P×N)
    /// * `process_noise` - process noise covariance `Q` (N×N)
    ///
    /// # Returns
    /// The filter, or [`FilterError::Dimension`] when the shapes are inconsistent
    /// (only possible for dynamic dimensions).
    pub fn new(
        transition: OMatrix<f64, N, N>,
        control: OMatrix<f64, N, M>,
        observation: OMatrix<f64, P, N>,
        process_noise: OMatrix<f64, N, N>,
    ) -> Result<Self, FilterError> {
        let (n, _) = transition.shape_generic();
        let state = OVector::<f64, N>::zeros_generic(n, U1);
        let covariance = OMatrix::<f64, N, N>::identity_generic(n, n);
        Self::with_initial_state(
            transition,
            control,
            observation,
            process_noise,
            state,
            covariance,
        )
    }

    /// Build a filter from the model matrices and an explicit initial belief.
    pub fn with_initial_state(
        transition: OMatrix<f64, N, N>,
        control: OMatrix<f64, N, M>,
        observation: OMatrix<f64, P, N>,
        process_noise: OMatrix<f64, N, N>,
        state: OVector<f64, N>,
        covariance: OMatrix<f64, N, N>,
    ) -> Result<Self, FilterError> {
        let n = transition.nrows();
        check_shape("transition", transition.shape(), (n, n))?;
        check_shape("control", control.shape(), (n, control.ncols()))?;
        check_shape("observation", observation.shape(), (observation.nrows(), n))?;
        check_shape("process_noise", process_noise.shape(), (n, n))?;
        check_shape("state", state.shape(), (n, 1))?;
        check_shape("covariance", covariance.shape(), (n, n))?;

        let (state_dim, _) = transition.shape_generic();
        let (measurement_dim, _) = observation.shape_generic();
        Ok(KalmanFilter {
            measurement_noise: OMatrix::zeros_generic(measurement_dim, measurement_dim),
            coupling: OMatrix::zeros_generic(state_dim, measurement_dim),
            transition,
            control,
            observation,
            process_noise,
            state,
            covariance,
            covariance_update: CovarianceUpdate::default(),
            solve_options: SolveOptions::default(),
        })
    }

    /// Select the covariance measurement-update form.
    pub fn with_covariance_update(mut self, covariance_update: CovarianceUpdate) -> Self {
        self.covariance_update = covariance_update;
        self
    }

    /// Override the jitter ramp used when factoring the innovation covariance.
    pub fn with_solve_options(mut self, solve_options: SolveOptions) -> Self {
        self.solve_options = solve_options;
        self
    }

    /// Set the measurement-to-state coupling matrix `S` (N×P) used by
    /// [`KalmanFilter::predict_with_measurement`]. It defaults to zero.
    pub fn with_coupling(mut self, coupling: OMatrix<f64, N, P>) -> Result<Self, FilterError> {
        check_shape("coupling", coupling.shape(), self.coupling.shape())?;
        self.coupling = coupling;
        Ok(self)
    }

    /// Time update without control input: `x̂ ← F·x̂`, `P ← F·P·Fᵀ + Q`.
    pub fn predict(&mut self) {
        self.state = &self.transition * &self.state;
        self.propagate_covariance();
    }

    /// Time update with control input `u`: `x̂ ← F·x̂ + G·u`, `P ← F·P·Fᵀ + Q`.
    pub fn predict_with_control(&mut self, control: &OVector<f64, M>) -> Result<(), FilterError> {
        check_shape("control input", control.shape(), (self.control.ncols(), 1))?;
        self.state = &self.transition * &self.state + &self.control * control;
        self.propagate_covariance();
        Ok(())
    }

    /// Time update that also folds a state-space measurement `z` into the propagation:
    /// `x̂ ← F·x̂ + G·u + S·R⁻¹·z` (the `R⁻¹·z` product is obtained with a PSD solve).
    ///
    /// Requires `R` to be set through [`KalmanFilter::update_noise_covariance`] first.
    /// The covariance propagates exactly as in [`KalmanFilter::predict`].
    pub fn predict_with_measurement(
        &mut self,
        control: &OVector<f64, M>,
        measurement: &OVector<f64, P>,
    ) -> Result<(), FilterError> {
        check_shape("control input", control.shape(), (self.control.ncols(), 1))?;
        check_shape("measurement", measurement.shape(), (self.observation.nrows(), 1))?;
        let folded = spsd_solve(&self.measurement_noise, measurement, self.solve_options)?;
        self.state =
            &self.transition * &self.state + &self.control * control + &self.coupling * folded;
        self.propagate_covariance();
        Ok(())
    }

    /// Measurement update with observation `z`.
    ///
    /// The gain `K = P·Hᵀ·Σ⁻¹` with `Σ = H·P·Hᵀ + R` is computed as
    /// `K = (solve(Σᵀ, H·Pᵀ))ᵀ` so no inverse is ever formed. On error the belief is
    /// left untouched.
    pub fn correct(&mut self, measurement: &OVector<f64, P>) -> Result<(), FilterError> {
        check_shape("measurement", measurement.shape(), (self.observation.nrows(), 1))?;

        let hp = &self.observation * &self.covariance;
        let innovation_covariance = &hp * self.observation.transpose() + &self.measurement_noise;
        let gain_transposed = spsd_solve(
            &innovation_covariance.transpose(),
            &(&self.observation * self.covariance.transpose()),
            self.solve_options,
        )?;
        let gain = gain_transposed.transpose();

        let innovation = measurement - &self.observation * &self.state;
        self.state += &gain * innovation;
        match self.covariance_update {
            CovarianceUpdate::Subtractive => {
                self.covariance -= &gain * hp;
            }
            CovarianceUpdate::Joseph => {
                let (n, _) = self.covariance.shape_generic();
                let residual = OMatrix::<f64, N, N>::identity_generic(n, n) - &gain * &self.observation;
                self.covariance = &residual * &self.covariance * residual.transpose()
                    + &gain * &self.measurement_noise * gain.transpose();
            }
        }
        Ok(())
    }

    /// Replace the measurement noise covariance `R` (P×P). Takes effect on the next
    /// [`KalmanFilter::correct`] or [`KalmanFilter::predict_with_measurement`].
    pub fn update_noise_covariance(
        &mut self,
        measurement_noise: OMatrix<f64, P, P>,
    ) -> Result<(), FilterError> {
        check_shape(
            "measurement_noise",
            measurement_noise.shape(),
            self.measurement_noise.shape(),
        )?;
        self.measurement_noise = measurement_noise;
        Ok(())
    }

    pub fn state_estimate(&self) -> &OVector<f64, N> {
        &self.state
    }

    pub fn state_covariance_estimate(&self) -> &OMatrix<f64, N, N> {
        &self.covariance
    }

    pub fn measurement_noise(&self) -> &OMatrix<f64, P, P> {
        &self.measurement_noise
    }

    pub fn covariance_update(&self) -> CovarianceUpdate {
        self.covariance_update
    }

    fn propagate_covariance(&mut self) {
        self.covariance =
            &self.transition * &self.covariance * self.transition.transpose() + &self.process_noise;
    }
}

impl<N: Dim, M: Dim, P: Dim> Display for KalmanFilter<N, M, P>
where
    DefaultAllocator: Allocator<N, N>
        + Allocator<N>
        + Allocator<N, M>
        + Allocator<P, N>
        + Allocator<N, P>
        + Allocator<P, P>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KalmanFilter")
            .field("state", &self.state.as_slice())
            .field("covariance_diagonal", &self.covariance.diagonal().as_slice())
            .field("covariance_update", &self.covariance_update)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{min_eigenvalue, symmetry_error};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{DMatrix, DVector, Matrix1, Matrix2, Matrix6, Matrix6x3, SMatrix, Vector1, Vector2, Vector3, Vector6};

    /// Constant-velocity 3-axis model used across tests.
    fn constant_velocity(dt: f64, w_std: f64) -> (Matrix6<f64>, Matrix6x3<f64>, Matrix6<f64>, Matrix6<f64>) {
        let mut f = Matrix6::identity();
        let mut g = Matrix6x3::zeros();
        for axis in 0..3 {
            f[(axis, axis + 3)] = dt;
            g[(axis, axis)] = 0.5 * dt * dt;
            g[(axis + 3, axis)] = dt;
        }
        let q = g * g.transpose() * (w_std * w_std);
        (f, g, Matrix6::identity(), q)
    }

    fn trace<const N: usize>(m: &SMatrix<f64, N, N>) -> f64 {
        m.diagonal().sum()
    }

    #[test]
    fn scalar_predict_correct_matches_closed_form() {
        let mut kf: FixedKalmanFilter<1, 1, 1> = KalmanFilter::new(
            Matrix1::new(1.0),
            Matrix1::new(0.0),
            Matrix1::new(1.0),
            Matrix1::new(0.01),
        )
        .unwrap();
        kf.update_noise_covariance(Matrix1::new(0.25)).unwrap();
        kf.predict();
        assert_approx_eq!(kf.state_covariance_estimate()[(0, 0)], 1.01, 1e-12);
        kf.correct(&Vector1::new(1.0)).unwrap();
        // K = 1.01 / (1.01 + 0.25)
        let gain = 1.01 / 1.26;
        assert_approx_eq!(kf.state_estimate()[0], gain, 1e-12);
        assert_approx_eq!(kf.state_covariance_estimate()[(0, 0)], 1.01 - gain * 1.01, 1e-12);
        assert_approx_eq!(kf.state_covariance_estimate()[(0, 0)], 0.2003968253968254, 1e-12);
    }

    #[test]
    fn predict_with_identity_and_no_noise_is_a_no_op() {
        let x0 = Vector2::new(3.0, -1.5);
        let p0 = Matrix2::new(2.0, 0.3, 0.3, 1.0);
        let mut kf: FixedKalmanFilter<2, 1, 2> = KalmanFilter::with_initial_state(
            Matrix2::identity(),
            SMatrix::<f64, 2, 1>::zeros(),
            Matrix2::identity(),
            Matrix2::zeros(),
            x0,
            p0,
        )
        .unwrap();
        for _ in 0..10 {
            kf.predict();
        }
        assert_eq!(kf.state_estimate(), &x0);
        assert_eq!(kf.state_covariance_estimate(), &p0);
    }

    #[test]
    fn predict_without_correction_grows_trace() {
        let (_, g, h, q) = constant_velocity(0.1, 0.1);
        let mut kf: FixedKalmanFilter<6, 3, 6> =
            KalmanFilter::new(Matrix6::identity(), g, h, q + Matrix6::identity() * 1e-4).unwrap();
        let mut previous = trace(kf.state_covariance_estimate());
        for _ in 0..50 {
            kf.predict();
            let current = trace(kf.state_covariance_estimate());
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn near_perfect_measurement_recovers_inverse_observation() {
        let h = Matrix2::new(2.0, 0.0, 1.0, 4.0);
        let mut kf: FixedKalmanFilter<2, 1, 2> = KalmanFilter::new(
            Matrix2::identity(),
            SMatrix::<f64, 2, 1>::zeros(),
            h,
            Matrix2::identity() * 0.01,
        )
        .unwrap();
        kf.update_noise_covariance(Matrix2::identity() * 1e-12).unwrap();
        let z = Vector2::new(4.0, 10.0);
        kf.predict();
        kf.correct(&z).unwrap();
        let expected = h.try_inverse().unwrap() * z;
        assert!((kf.state_estimate() - expected).amax() < 1e-6);
    }

    #[test]
    fn control_input_drives_state() {
        let (f, g, h, q) = constant_velocity(1.0, 0.1);
        let mut kf: FixedKalmanFilter<6, 3, 6> = KalmanFilter::new(f, g, h, q).unwrap();
        kf.predict_with_control(&Vector3::new(1.0, 0.0, -2.0)).unwrap();
        let x = kf.state_estimate();
        assert_approx_eq!(x[0], 0.5, 1e-12);
        assert_approx_eq!(x[2], -1.0, 1e-12);
        assert_approx_eq!(x[3], 1.0, 1e-12);
        assert_approx_eq!(x[5], -2.0, 1e-12);
    }

    #[test]
    fn dynamic_matches_fixed() {
        let (f, g, h, q) = constant_velocity(0.2, 0.1);
        let r = Matrix6::from_diagonal(&Vector6::new(1.0, 1.0, 2.0, 0.1, 0.1, 0.1));
        let mut fixed: FixedKalmanFilter<6, 3, 6> = KalmanFilter::new(f, g, h, q).unwrap();
        let mut dynamic: DynamicKalmanFilter = KalmanFilter::new(
            DMatrix::from_column_slice(6, 6, f.as_slice()),
            DMatrix::from_column_slice(6, 3, g.as_slice()),
            DMatrix::from_column_slice(6, 6, h.as_slice()),
            DMatrix::from_column_slice(6, 6, q.as_slice()),
        )
        .unwrap();
        fixed.update_noise_covariance(r).unwrap();
        dynamic
            .update_noise_covariance(DMatrix::from_column_slice(6, 6, r.as_slice()))
            .unwrap();
        for step in 0..20 {
            let u = Vector3::new(0.1 * step as f64, -0.2, 0.05);
            let z = Vector6::new(step as f64, 0.5, 0.0, 1.0, 0.0, 0.0);
            fixed.predict_with_control(&u).unwrap();
            dynamic
                .predict_with_control(&DVector::from_column_slice(u.as_slice()))
                .unwrap();
            fixed.correct(&z).unwrap();
            dynamic.correct(&DVector::from_column_slice(z.as_slice())).unwrap();
        }
        for i in 0..6 {
            assert_approx_eq!(fixed.state_estimate()[i], dynamic.state_estimate()[i], 1e-9);
            for j in 0..6 {
                assert_approx_eq!(
                    fixed.state_covariance_estimate()[(i, j)],
                    dynamic.state_covariance_estimate()[(i, j)],
                    1e-9
                );
            }
        }
    }

    #[test]
    fn dynamic_rejects_mismatched_shapes() {
        let err = DynamicKalmanFilter::new(
            DMatrix::identity(4, 4),
            DMatrix::zeros(3, 2),
            DMatrix::identity(2, 4),
            DMatrix::identity(4, 4),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Dimension { name: "control", .. }));

        let mut kf = DynamicKalmanFilter::new(
            DMatrix::identity(4, 4),
            DMatrix::zeros(4, 2),
            DMatrix::identity(2, 4),
            DMatrix::identity(4, 4),
        )
        .unwrap();
        assert!(kf.correct(&DVector::zeros(3)).is_err());
        assert!(kf.predict_with_control(&DVector::zeros(3)).is_err());
        assert!(kf.update_noise_covariance(DMatrix::identity(4, 4)).is_err());
        // Nothing moved.
        assert_eq!(kf.state_estimate(), &DVector::<f64>::zeros(4));
    }

    #[test]
    fn fold_in_with_zero_coupling_equals_control_predict() {
        let (f, g, h, q) = constant_velocity(0.5, 0.1);
        let mut plain: FixedKalmanFilter<6, 3, 6> = KalmanFilter::new(f, g, h, q).unwrap();
        let mut folded = plain.clone();
        folded.update_noise_covariance(Matrix6::identity() * 0.25).unwrap();
        let u = Vector3::new(0.3, 0.1, 0.0);
        let z = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        plain.predict_with_control(&u).unwrap();
        folded.predict_with_measurement(&u, &z).unwrap();
        assert_eq!(plain.state_estimate(), folded.state_estimate());
        assert_eq!(plain.state_covariance_estimate(), folded.state_covariance_estimate());
    }

    #[test]
    fn fold_in_applies_coupling_to_whitened_measurement() {
        let mut kf: FixedKalmanFilter<1, 1, 1> = KalmanFilter::new(
            Matrix1::new(1.0),
            Matrix1::new(0.0),
            Matrix1::new(1.0),
            Matrix1::new(0.0),
        )
        .unwrap()
        .with_coupling(Matrix1::new(0.5))
        .unwrap();
        kf.update_noise_covariance(Matrix1::new(4.0)).unwrap();
        kf.predict_with_measurement(&Vector1::new(0.0), &Vector1::new(2.0)).unwrap();
        // 0.5 * (2.0 / 4.0)
        assert_approx_eq!(kf.state_estimate()[0], 0.25, 1e-12);
    }

    #[test]
    fn singular_innovation_leaves_belief_untouched() {
        let mut kf: FixedKalmanFilter<1, 1, 1> = KalmanFilter::with_initial_state(
            Matrix1::new(1.0),
            Matrix1::new(0.0),
            Matrix1::new(1.0),
            Matrix1::new(0.0),
            Vector1::new(2.0),
            Matrix1::new(-1.0),
        )
        .unwrap();
        let err = kf.correct(&Vector1::new(5.0)).unwrap_err();
        assert!(matches!(err, FilterError::Linalg(_)));
        assert_eq!(kf.state_estimate()[0], 2.0);
    }

    fn long_run(update: CovarianceUpdate) -> Matrix6<f64> {
        let (f, g, h, q) = constant_velocity(0.1, 0.1);
        let mut kf: FixedKalmanFilter<6, 3, 6> = KalmanFilter::with_initial_state(
            f,
            g,
            h,
            q,
            Vector6::zeros(),
            q,
        )
        .unwrap()
        .with_covariance_update(update);
        let r = Matrix6::from_diagonal(&Vector6::new(0.81, 0.81, 2.25, 0.0025, 0.0025, 0.0025));
        for step in 0..10_000 {
            let t = step as f64 * 0.1;
            kf.predict_with_control(&Vector3::new((0.1 * t).sin(), (0.1 * t).cos(), 0.0))
                .unwrap();
            if step % 5 == 0 {
                kf.update_noise_covariance(r).unwrap();
                kf.correct(&Vector6::new(t, 0.5 * t, 0.0, 1.0, 0.5, 0.0)).unwrap();
            }
        }
        *kf.state_covariance_estimate()
    }

    #[test]
    fn subtractive_update_stays_symmetric_psd_over_long_runs() {
        let p = long_run(CovarianceUpdate::Subtractive);
        assert!(symmetry_error(&p) < 1e-9, "asymmetry {}", symmetry_error(&p));
        assert!(min_eigenvalue(&p) > -1e-9, "min eigenvalue {}", min_eigenvalue(&p));
    }

    #[test]
    fn joseph_update_stays_symmetric_psd_over_long_runs() {
        let p = long_run(CovarianceUpdate::Joseph);
        assert!(symmetry_error(&p) < 1e-9);
        assert!(min_eigenvalue(&p) > -1e-9);
    }

    #[test]
    fn joseph_and_subtractive_agree_on_one_step() {
        let (f, g, h, q) = constant_velocity(0.2, 0.1);
        let mut a: FixedKalmanFilter<6, 3, 6> = KalmanFilter::new(f, g, h, q).unwrap();
        let mut b = a.clone().with_covariance_update(CovarianceUpdate::Joseph);
        let r = Matrix6::identity() * 0.5;
        a.update_noise_covariance(r).unwrap();
        b.update_noise_covariance(r).unwrap();
        let z = Vector6::new(1.0, 1.0, 1.0, 0.1, 0.1, 0.1);
        a.predict();
        b.predict();
        a.correct(&z).unwrap();
        b.correct(&z).unwrap();
        assert!((a.state_covariance_estimate() - b.state_covariance_estimate()).amax() < 1e-12);
        assert_eq!(a.state_estimate(), b.state_estimate());
    }
}
