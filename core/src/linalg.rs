//! Linear algebra helpers for the Kalman engine.
//!
//! Public API:
//!     pub fn spsd_solve(a, b, options) -> Result<X, LinalgError>
//!     pub fn symmetrize(m) -> M
//!     pub fn symmetry_error(m) -> f64
//!     pub fn min_eigenvalue(m) -> f64
//!
//! Everything is generic over nalgebra's [`Dim`] so that the same code serves
//! compile-time sized matrices (`Const<N>`) and runtime sized ones (`Dyn`).
//!
//! Strategy for `A X = B` with symmetric positive-semidefinite `A`:
//! 1) Symmetrize A ← 0.5 (A + Aᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp) for rank-deficient A
//!
//! An explicit inverse is never formed.

use nalgebra::allocator::Allocator;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DefaultAllocator, Dim, Dyn, OMatrix};
use thiserror::Error;

/// Failures of the symmetric positive-semidefinite solve.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinalgError {
    #[error("system matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("right-hand side has {rhs} rows but the system has {system}")]
    ShapeMismatch { system: usize, rhs: usize },
    #[error("system matrix is not positive semidefinite (Cholesky failed up to jitter {max_jitter:e})")]
    NotPositiveSemidefinite { max_jitter: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
///
/// # Arguments
/// * `m` - the matrix to symmetrize
///
/// # Returns
/// A symmetrized version of the input matrix.
#[inline]
pub fn symmetrize<D: Dim>(m: &OMatrix<f64, D, D>) -> OMatrix<f64, D, D>
where
    DefaultAllocator: Allocator<D, D>,
{
    (m + m.transpose()) * 0.5
}

/// Largest absolute difference between `m` and its transpose.
pub fn symmetry_error<D: Dim>(m: &OMatrix<f64, D, D>) -> f64
where
    DefaultAllocator: Allocator<D, D>,
{
    (m - m.transpose()).amax()
}

/// Smallest eigenvalue of the symmetric part of `m`.
///
/// Used as a positive-semidefiniteness check on covariance matrices: a value
/// below zero (beyond round-off) means the covariance has lost its PSD property.
pub fn min_eigenvalue<D: Dim>(m: &OMatrix<f64, D, D>) -> f64
where
    DefaultAllocator: Allocator<D, D>,
{
    let dense = DMatrix::from_iterator(m.nrows(), m.ncols(), m.iter().copied());
    SymmetricEigen::<f64, Dyn>::new(symmetrize::<Dyn>(&dense))
        .eigenvalues
        .min()
}

/// Solve `A X = B` for symmetric positive-semidefinite `A` via Cholesky, with jitter retries.
///
/// `A` is symmetrized first since covariance-derived systems drift away from exact
/// symmetry. When plain Cholesky fails (singular or rank-deficient `A`, e.g. a
/// measurement noise matrix with a zero variance), a geometrically increasing
/// diagonal jitter is added until the factorization succeeds.
///
/// # Arguments
/// * `a` - square system matrix, assumed symmetric positive-semidefinite
/// * `b` - right-hand side with as many rows as `a`
/// * `options` - jitter ramp
///
/// # Returns
/// * `Ok(X)` with the solution.
/// * `Err(LinalgError)` if the shapes disagree or no jitter within `options` makes `A` factorable.
pub fn spsd_solve<D, C>(
    a: &OMatrix<f64, D, D>,
    b: &OMatrix<f64, D, C>,
    options: SolveOptions,
) -> Result<OMatrix<f64, D, C>, LinalgError>
where
    D: Dim,
    C: Dim,
    DefaultAllocator: Allocator<D, D> + Allocator<D, C>,
{
    if !a.is_square() {
        return Err(LinalgError::NotSquare {
            rows: a.nrows(),
            cols: a.ncols(),
        });
    }
    if a.nrows() != b.nrows() {
        return Err(LinalgError::ShapeMismatch {
            system: a.nrows(),
            rhs: b.nrows(),
        });
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Ok(ch.solve(b));
    }
    // Jitter ramp
    let n = a_sym.nrows();
    let mut jitter = options.initial_jitter;
    for _ in 0..options.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            log::trace!("spsd_solve: Cholesky succeeded with jitter {jitter:e}");
            return Ok(ch.solve(b));
        }
        jitter *= 10.0;
        if jitter > options.max_jitter {
            break;
        }
    }
    Err(LinalgError::NotPositiveSemidefinite {
        max_jitter: options.max_jitter,
    })
}

/* =============================== Tests ==================================== */
