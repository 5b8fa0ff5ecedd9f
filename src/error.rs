//! Error types for the reconstruction pipeline.
//!
//! Follows the teacher's layering: typed [`thiserror`] variants for
//! conditions a caller can react to (bad configuration, a broken
//! invariant in the adaptive grid, solver non-convergence), with
//! `anyhow::Error` as an escape hatch for opaque errors bubbling up from a
//! caller-supplied [`crate::deflector::Deflector`].

use thiserror::Error as ThisError;

/// Configuration errors, detected at setup time (spec.md §7: "fail fast at setup").
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("first-level split counts must be >= 2 in each direction, got ({nu0}, {nw0})")]
    SplitTooSmall { nu0: usize, nw0: usize },
    #[error("unknown regularization method: {0}")]
    UnknownRegularization(String),
    #[error("no deflector supplied")]
    MissingDeflector,
    #[error("max_levels must be >= 1, got {0}")]
    InvalidMaxLevels(usize),
    #[error("PSF kernel dimensions must be odd, got ({nx}, {ny})")]
    EvenPsfDimensions { nx: usize, ny: usize },
    #[error("PSF kernel data has {actual} entries, expected {expected} for the given dimensions")]
    PsfDataLengthMismatch { expected: usize, actual: usize },
    #[error("invalid rank/world_size combination: rank {rank} of {world_size}")]
    InvalidWorldSize { rank: usize, world_size: usize },
    #[error("configuration selects an external PSF array but none was supplied to the coordinator")]
    MissingExternalPsfData,
    #[error("solver backend {0:?} is not implemented; only ConjugateGradient is available in this build")]
    UnsupportedSolverBackend(crate::config::SolverBackend),
}

/// Topology errors: broken quad-tree invariants (spec.md §7: "fatal").
#[derive(Debug, ThisError)]
pub enum GridError {
    #[error("cell at level {level} would exceed max_levels ({max_levels}) on split")]
    MaxDepthExceeded { level: usize, max_levels: usize },
    #[error("attempted to split a cell that already has children")]
    AlreadySplit,
    #[error("neighbor consistency check failed at level {level}, index ({i},{j}), face {face}")]
    InconsistentNeighbor { level: usize, i: usize, j: usize, face: usize },
    #[error("cell id {0:?} referenced but not present in arena")]
    DanglingCellId(crate::source_grid::CellId),
}

/// Numerical solver failures (spec.md §7: "caller retries with larger lambda or coarser grid").
#[derive(Debug, ThisError)]
pub enum SolverError {
    #[error("conjugate gradient failed to converge after {iters} iterations, residual {residual:e}")]
    DidNotConverge { iters: usize, residual: f64 },
    #[error("normal matrix F appears singular or indefinite (non-positive pivot encountered)")]
    Singular,
    #[error("log-determinant requested but not supported by this solver configuration")]
    LogDetUnavailable,
}

/// Top level error type returned from the coordinator.
#[non_exhaustive]
#[derive(Debug, ThisError)]
pub enum ReconstructionError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("source grid topology: {0}")]
    Topology(#[from] GridError),
    #[error("linear solve: {0}")]
    Numerical(#[from] SolverError),
    #[error("sparse matrix counter mismatch: expected {expected} nonzeros, realized {actual}")]
    CounterMismatch { expected: usize, actual: usize },
    #[error("deflector error: {0}")]
    Deflector(anyhow::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed persisted grid data: {0}")]
    MalformedData(String),
    #[error("unknown error")]
    Unknown(#[from] anyhow::Error),
}

impl ReconstructionError {
    /// Wraps an error raised while calling into a caller-supplied [`crate::deflector::Deflector`].
    pub fn from_deflector(err: impl Into<anyhow::Error>) -> Self {
        ReconstructionError::Deflector(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
