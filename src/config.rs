//! Reconstruction configuration (spec.md §6), mirroring the shape of
//! `splashsurf_lib::Parameters<R>`: a plain `Clone + Debug` struct with an
//! explicit `validate()` fail-fast pass, optionally `serde`-serializable
//! behind the `serde` feature.

use crate::error::ConfigError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which L-matrix construction strategy the mapping engine uses (spec.md §4.D).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RayTracingMethod {
    AreaOverlap,
    Interpolate,
}

/// Which regularization operator builds `R` (spec.md §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RegularizationMethod {
    None,
    Norm,
    Gradient,
    Curvature,
    ImagePlaneCurvature,
}

/// Source of the PSF kernel convolved into `L` (spec.md §4.F/§6).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PsfSource {
    /// No PSF convolution.
    None,
    /// Separable Gaussian, synthesized over a +/-1.6 sigma footprint.
    Gaussian { sigma_x: f64, sigma_y: f64 },
    /// Caller-supplied kernel array, e.g. loaded from FITS by the embedding
    /// application and handed in as a [`crate::psf::FitsArray`] (`io` feature).
    External { nx: usize, ny: usize },
}

/// Linear-solver backend selector (spec.md §4.G). Only `ConjugateGradient`
/// is implemented by this crate; the direct-backend variants are named so a
/// downstream crate can implement [`crate::solver::SparseSymSolver`] against
/// real MUMPS/UMFPACK bindings without this crate fabricating FFI stubs
/// (DESIGN.md, Open Question resolution 4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolverBackend {
    ConjugateGradient,
    DirectMumps,
    DirectUmfpack,
}

/// The three `SourceGrid::assign_active_indices` activation policies
/// (spec.md §4.B/§6), bundled here so the coordinator can hand them straight
/// to [`crate::source_grid::ActivationPolicy`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivationOptions {
    pub activate_unmapped_source_pixels: bool,
    pub regrid_if_unmapped_source_subpixels: bool,
    pub exclude_source_pixels_outside_fit_window: bool,
}

/// All configuration accepted by the reconstruction core (spec.md §6).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReconstructionConfig {
    pub ray_tracing_method: RayTracingMethod,
    pub regularization: RegularizationMethod,
    pub regularization_parameter: f64,
    pub pixel_magnification_threshold: f64,
    pub min_cell_area: f64,
    pub max_levels: usize,
    pub nu0: usize,
    pub nw0: usize,
    pub psf: PsfSource,
    pub activation: ActivationOptions,
    pub noise_threshold: f64,
    pub n_image_prior: Option<f64>,
    pub max_sb_prior_unselected_pixels: Option<f64>,
    pub clamp_negative_sb: bool,
    pub solver_backend: SolverBackend,
    pub solver_tol: f64,
    pub solver_max_iters: usize,
    pub num_threads: Option<usize>,
    pub world_size: usize,
    pub rank: usize,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            ray_tracing_method: RayTracingMethod::AreaOverlap,
            regularization: RegularizationMethod::Gradient,
            regularization_parameter: 1.0,
            pixel_magnification_threshold: 10.0,
            min_cell_area: 0.0,
            max_levels: 6,
            nu0: 2,
            nw0: 2,
            psf: PsfSource::None,
            activation: ActivationOptions::default(),
            noise_threshold: 0.0,
            n_image_prior: None,
            max_sb_prior_unselected_pixels: None,
            clamp_negative_sb: false,
            solver_backend: SolverBackend::ConjugateGradient,
            solver_tol: 1e-4,
            solver_max_iters: 100_000,
            num_threads: None,
            world_size: 1,
            rank: 0,
        }
    }
}

impl ReconstructionConfig {
    /// Fail-fast validation of everything spec.md §7 calls a "configuration
    /// error" (detected at setup time, before any grid is built).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nu0 < 2 || self.nw0 < 2 {
            return Err(ConfigError::SplitTooSmall { nu0: self.nu0, nw0: self.nw0 });
        }
        if self.max_levels < 1 {
            return Err(ConfigError::InvalidMaxLevels(self.max_levels));
        }
        if let PsfSource::External { nx, ny } = self.psf {
            if nx % 2 == 0 || ny % 2 == 0 {
                return Err(ConfigError::EvenPsfDimensions { nx, ny });
            }
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(ConfigError::InvalidWorldSize { rank: self.rank, world_size: self.world_size });
        }
        if self.solver_backend != SolverBackend::ConjugateGradient {
            return Err(ConfigError::UnsupportedSolverBackend(self.solver_backend));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ReconstructionConfig::default().validate().is_ok());
    }

    #[test]
    fn split_counts_below_two_are_rejected() {
        let mut cfg = ReconstructionConfig::default();
        cfg.nu0 = 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::SplitTooSmall { .. })));
    }

    #[test]
    fn even_external_psf_dimensions_are_rejected() {
        let mut cfg = ReconstructionConfig::default();
        cfg.psf = PsfSource::External { nx: 4, ny: 5 };
        assert!(matches!(cfg.validate(), Err(ConfigError::EvenPsfDimensions { .. })));
    }

    #[test]
    fn direct_solver_backends_are_rejected_at_validation() {
        let mut cfg = ReconstructionConfig::default();
        cfg.solver_backend = SolverBackend::DirectMumps;
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedSolverBackend(SolverBackend::DirectMumps))));
    }
}
