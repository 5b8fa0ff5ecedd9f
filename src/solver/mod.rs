//! Sparse symmetric positive-definite linear solver and log-determinant
//! computation (spec.md §4.G), exposed behind the `SparseSymSolver` trait
//! named in spec.md Design Notes §9 so concrete backends (CG, always
//! available; MUMPS-style/UMFPACK-style direct factorizations, named but not
//! vendored, see DESIGN.md) plug in uniformly.

pub mod cg;

use crate::error::SolverError;
use crate::sparse::SparseMatrix;

/// Result of a successful linear solve: the solution vector plus the
/// iterative backend's own convergence diagnostics (spec.md §5
/// "Cancellation/timeouts": "the solver exposes (max_iters, tol) and
/// reports (iters, final residual) back").
#[derive(Clone, Debug)]
pub struct Solution {
    pub s: Vec<f64>,
    pub iters: usize,
    pub residual: f64,
}

/// Common interface every linear-solver backend implements (spec.md Design
/// Notes §9). `solve` returns the reconstructed source vector `s` for
/// `F*s = d`; `log_det` is required only when the caller needs a Bayesian
/// evidence evaluation (spec.md §4.G/§4.H step 9) and may legitimately fail
/// with [`SolverError::LogDetUnavailable`] for a backend that does not
/// support it.
pub trait SparseSymSolver {
    fn solve(&self, f: &SparseMatrix, d: &[f64]) -> Result<Solution, SolverError>;
    fn log_det(&self, f: &SparseMatrix) -> Result<f64, SolverError>;
}
