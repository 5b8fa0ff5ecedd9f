//!
//! Adaptive pixelated source reconstruction core for gravitational-lens
//! modeling. Entry point is the [reconstruct_source] function, which
//! orchestrates the pipeline described in spec.md §4.H: ray-trace the image
//! plane through a caller-supplied [`Deflector`], refine an adaptive
//! quad-tree source grid, build the sparse lensing operator `L` and
//! regularization operator `R`, and solve the regularized normal equations
//! `F*s = d` for the source surface-brightness vector `s`.
//!

pub mod config;
pub mod deflector;
pub mod error;
pub mod geometry;
pub mod image_grid;
#[cfg(feature = "io")]
pub mod io;
pub mod mapping;
pub mod numeric;
pub mod parallel;
pub mod psf;
pub mod regularization;
pub mod solver;
pub mod source_grid;
pub mod sparse;

use log::{info, warn};

pub use config::ReconstructionConfig;
pub use deflector::Deflector;
pub use error::{ReconstructionError, Result};
pub use source_grid::SourceGrid;

use config::{ActivationOptions, PsfSource, RegularizationMethod};
use error::ConfigError;
use image_grid::ImageGrid;
use numeric::{Rect, Scalar};
use psf::PsfKernel;
use solver::cg::{ConjugateGradient, DeterminantMode};
use solver::SparseSymSolver;
use source_grid::ActivationPolicy;
use sparse::{LMatrix, RowBuilder, SparseMatrix};

/// Initializes the global `rayon` thread pool used by this library with the
/// given number of worker threads. Initialization happens exactly once; a
/// second call returns an error, same contract as the teacher's own
/// `initialize_thread_pool`.
pub fn initialize_thread_pool(num_threads: usize) -> std::result::Result<(), anyhow::Error> {
    rayon::ThreadPoolBuilder::new().num_threads(num_threads).build_global()?;
    Ok(())
}

/// Observed image-plane surface-brightness data handed to the coordinator
/// (spec.md §6): a flat `[j*nx+i]` raster, an optional boolean fit mask in
/// the same order, and a single noise sigma. Per spec.md §3's
/// "SparseMatrix"/§4.G description this core assumes uniform pixel noise
/// (generalizable to a full covariance by a downstream caller, not
/// implemented here).
#[derive(Clone, Debug)]
pub struct PixelData<'a> {
    /// Flat surface-brightness raster, `nx*ny` entries in `[j*nx+i]` order.
    pub sb: &'a [Scalar],
    /// Optional fit mask, same order and length as `sb`; `None` means every
    /// pixel participates in the fit.
    pub mask: Option<&'a [bool]>,
    /// Uniform per-pixel noise sigma (spec.md §6 `noise_threshold`/§4.G).
    pub sigma: Scalar,
}

impl<'a> PixelData<'a> {
    fn validate(&self, nx: usize, ny: usize) -> std::result::Result<(), ReconstructionError> {
        let n = nx * ny;
        if self.sb.len() != n {
            return Err(ReconstructionError::MalformedData(format!(
                "pixel data has {} entries, expected {n} ({nx}x{ny})",
                self.sb.len()
            )));
        }
        if let Some(mask) = self.mask {
            if mask.len() != n {
                return Err(ReconstructionError::MalformedData(format!(
                    "fit mask has {} entries, expected {n} ({nx}x{ny})",
                    mask.len()
                )));
            }
        }
        Ok(())
    }
}

/// Result data returned by a successful source reconstruction. Reusable
/// across successive calls to [`reconstruct_source_inplace`]: the adaptive
/// source grid is regridded in place (spec.md §3 lifecycle: "SourceGrid is
/// created once per fit, regridded in-place"), matching the teacher's
/// `SurfaceReconstruction` reuse pattern.
#[derive(Debug)]
pub struct SourceReconstruction {
    source: Option<SourceGrid>,
    image: Option<ImageGrid>,
    l: Option<LMatrix>,
    f: Option<SparseMatrix>,
    d: Option<Vec<Scalar>>,
    /// `L * s`, in the same active-row order as `l`'s rows.
    image_sb: Vec<Scalar>,
    log_det_f: Option<Scalar>,
    log_det_r: Option<Scalar>,
    solver_iters: usize,
    solver_residual: Scalar,
    /// Count of image pixels (within the fit mask) whose `L` row mapped to
    /// zero source cells (spec.md §7 "mapping anomalies").
    unmapped_image_pixels: usize,
    /// Count of source leaves force-activated despite mapping to zero image
    /// pixels (spec.md §7, `ActivationOptions::activate_unmapped_source_pixels`).
    unmapped_source_pixels: usize,
    /// Count of active source cells outside the fit window whose solved `s`
    /// exceeded `max_sb_prior_unselected_pixels` (spec.md §6 supplement).
    max_sb_prior_violations: usize,
    /// Count of active source cells whose `n_images` exceeded `n_image_prior`
    /// (spec.md §6 supplement; mirrors the `max_sb_prior_unselected_pixels`
    /// check above).
    n_image_prior_violations: usize,
}

impl Default for SourceReconstruction {
    /// Returns an empty [`SourceReconstruction`] to pass into the in-place
    /// reconstruction entry point.
    fn default() -> Self {
        Self {
            source: None,
            image: None,
            l: None,
            f: None,
            d: None,
            image_sb: Vec::new(),
            log_det_f: None,
            log_det_r: None,
            solver_iters: 0,
            solver_residual: 0.0,
            unmapped_image_pixels: 0,
            unmapped_source_pixels: 0,
            max_sb_prior_violations: 0,
            n_image_prior_violations: 0,
        }
    }
}

impl SourceReconstruction {
    /// The adaptive source grid, holding the reconstructed `s` in each
    /// active leaf's `surface_brightness` field.
    pub fn source_grid(&self) -> Option<&SourceGrid> {
        self.source.as_ref()
    }

    /// The ray-traced image grid built for the most recent call.
    pub fn image_grid(&self) -> Option<&ImageGrid> {
        self.image.as_ref()
    }

    /// The sparse lensing matrix `L` (post-PSF-convolution, if configured).
    pub fn l_matrix(&self) -> Option<&LMatrix> {
        self.l.as_ref()
    }

    /// The normal matrix `F = L^T C^-1 L + lambda*R` built for the solve.
    pub fn f_matrix(&self) -> Option<&SparseMatrix> {
        self.f.as_ref()
    }

    /// `L*s`, the model-predicted image, in active-row order.
    pub fn image_sb(&self) -> &[Scalar] {
        &self.image_sb
    }

    /// `log|F|`, if a Bayesian evidence computation was requested and the
    /// determinant could be computed.
    pub fn log_det_f(&self) -> Option<Scalar> {
        self.log_det_f
    }

    /// `log|R|`, if a Bayesian evidence computation was requested and the
    /// determinant could be computed. `None` for a singular `R` (e.g.
    /// Gradient/Curvature regularization, which has a constant-mode null
    /// space) even when evidence was requested; this is logged, not fatal.
    pub fn log_det_r(&self) -> Option<Scalar> {
        self.log_det_r
    }

    /// `(iterations, final relative residual)` reported by the linear solver.
    pub fn solver_diagnostics(&self) -> (usize, Scalar) {
        (self.solver_iters, self.solver_residual)
    }

    /// Count of mapping anomalies observed during the most recent call
    /// (spec.md §7): `(unmapped_image_pixels, unmapped_source_pixels,
    /// max_sb_prior_violations, n_image_prior_violations)`.
    pub fn anomaly_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.unmapped_image_pixels,
            self.unmapped_source_pixels,
            self.max_sb_prior_violations,
            self.n_image_prior_violations,
        )
    }
}

fn activation_policy(opts: &ActivationOptions) -> ActivationPolicy {
    ActivationPolicy {
        activate_unmapped: opts.activate_unmapped_source_pixels,
        regrid_if_unmapped_subcells: opts.regrid_if_unmapped_source_subpixels,
        exclude_outside_window: opts.exclude_source_pixels_outside_fit_window,
    }
}

fn choose_determinant_mode(n: usize) -> DeterminantMode {
    const DENSE_CHOLESKY_LIMIT: usize = 1500;
    if n <= DENSE_CHOLESKY_LIMIT {
        DeterminantMode::Cholesky
    } else {
        DeterminantMode::Stochastic { probes: 16, lanczos_steps: 40 }
    }
}

/// Performs a full source reconstruction (spec.md §4.H), returning a fresh
/// [`SourceReconstruction`].
#[allow(clippy::too_many_arguments)]
pub fn reconstruct_source(
    source_domain: Rect,
    image_window: Rect,
    image_nx: usize,
    image_ny: usize,
    deflector: &dyn Deflector,
    pixels: &PixelData,
    config: &ReconstructionConfig,
    external_psf: Option<&[Scalar]>,
    compute_evidence: bool,
) -> std::result::Result<SourceReconstruction, ReconstructionError> {
    let mut output = SourceReconstruction::default();
    reconstruct_source_inplace(
        source_domain,
        image_window,
        image_nx,
        image_ny,
        deflector,
        pixels,
        config,
        external_psf,
        compute_evidence,
        &mut output,
    )?;
    Ok(output)
}

/// Performs a full source reconstruction in place, reusing `output`'s
/// adaptive source grid topology across calls (spec.md §3 lifecycle).
///
/// Implements the ten coordinator steps of spec.md §4.H:
/// 1. rebuild the ray-traced image grid;
/// 2. reset mapping flags, seed source-grid magnifications;
/// 3. iterate adaptive refinement to a fixed point;
/// 4. re-index and assign active indices (regridding unmapped subcells as configured);
/// 5. build `L`;
/// 6. convolve `L` with the configured PSF;
/// 7. build `R`;
/// 8. build `F` and `d`;
/// 9. solve, and compute `log|F|`/`log|R|` if `compute_evidence` is set;
/// 10. write `s` back into the source grid's leaves and compute `L*s`.
#[allow(clippy::too_many_arguments)]
pub fn reconstruct_source_inplace(
    source_domain: Rect,
    image_window: Rect,
    image_nx: usize,
    image_ny: usize,
    deflector: &dyn Deflector,
    pixels: &PixelData,
    config: &ReconstructionConfig,
    external_psf: Option<&[Scalar]>,
    compute_evidence: bool,
    output: &mut SourceReconstruction,
) -> std::result::Result<(), ReconstructionError> {
    config.validate()?;
    pixels.validate(image_nx, image_ny)?;

    let enable_multi_threading = config.num_threads.map(|n| n > 1).unwrap_or(true);

    // Step 1: rebuild the ray-traced image grid. This core has no cached
    // notion of "parameters changed" (no persisted deflector state to
    // compare against), so the image grid is always rebuilt; a caller that
    // wants to skip unchanged reconstructions should check parameters
    // itself before calling in.
    info!("ray-tracing {image_nx}x{image_ny} image grid through deflector");
    let mut image = ImageGrid::new(image_window, image_nx, image_ny, deflector, pixels.mask, enable_multi_threading);

    if output.source.is_none() {
        output.source = Some(SourceGrid::new(source_domain, config.nu0, config.nw0, config.max_levels)?);
    }
    let source = output.source.as_mut().expect("just initialized above");

    // Step 2: reset mapping flags, seed magnifications and window coverage.
    source.reset_mapping_state();
    mapping::calculate_pixel_magnifications(&image, source);
    mapping::mark_image_window_coverage(&image, source);

    // Step 3: iterate adaptive refinement to a fixed point.
    let total_splits =
        mapping::adaptive_subgrid(source, &image, config.pixel_magnification_threshold, config.min_cell_area);
    info!("adaptive refinement: {total_splits} source cells split, {} levels", source.levels());

    // Step 4: re-index, then assign active indices (source and image).
    source.assign_indices_and_count_levels();
    let n_active_source = source.assign_active_indices(activation_policy(&config.activation));
    let n_active_image = mapping::assign_image_active_indices(&mut image);

    let unmapped_source_pixels = source
        .leaves_preorder()
        .into_iter()
        .filter(|&id| source.cell(id).active_index.is_some() && !source.cell(id).maps_to_image_pixel)
        .count();
    if unmapped_source_pixels > 0 {
        warn!(
            "{unmapped_source_pixels} active source cells map to zero image pixels \
             (activate_unmapped_source_pixels is set)"
        );
    }
    output.unmapped_source_pixels = unmapped_source_pixels;

    // Step 5: build L.
    let mut l = mapping::build_l_matrix(config.ray_tracing_method, &image, source);

    let unmapped_image_pixels = (0..l.n_rows()).filter(|&i| l.row(i).is_empty()).count();
    if unmapped_image_pixels > 0 {
        warn!("{unmapped_image_pixels} fit-mask image pixels map to zero source cells");
    }
    output.unmapped_image_pixels = unmapped_image_pixels;

    // Step 6: PSF convolution, if configured.
    if let Some(kernel) = build_psf_kernel(config, &image, external_psf)? {
        l = psf::convolve(&l, &kernel, &image);
    }

    // Step 7: build R.
    let l_context = matches!(config.regularization, RegularizationMethod::ImagePlaneCurvature)
        .then(|| (&image, &l));
    let r = regularization::build(config.regularization, source, l_context).map_err(ReconstructionError::from)?;

    // Step 8: build F and d.
    let active_to_raster = build_active_to_raster(&image, n_active_image);
    let inv_sigma2 = 1.0 / (pixels.sigma * pixels.sigma).max(Scalar::MIN_POSITIVE);
    let rhs: Vec<Scalar> = active_to_raster.iter().map(|&raster| pixels.sb[raster] * inv_sigma2).collect();
    let d = l.transpose_matvec(&rhs);

    let mut normal_builder = RowBuilder::new(n_active_source);
    l.accumulate_normal_matrix(&vec![inv_sigma2; n_active_image], &mut normal_builder);
    let ltl = normal_builder.build();
    let f = ltl.add_scaled(&r, config.regularization_parameter);

    // Step 9: solve, then optionally compute log|F| / log|R|.
    let determinant_mode = if compute_evidence { choose_determinant_mode(n_active_source) } else { DeterminantMode::Unavailable };
    let cg = ConjugateGradient::new(config.solver_tol, config.solver_max_iters).with_determinant_mode(determinant_mode);
    let solution = cg.solve(&f, &d)?;
    info!(
        "CG solve: {} iterations, relative residual {:.3e}",
        solution.iters, solution.residual
    );

    let log_det_f = if compute_evidence {
        match cg.log_det(&f) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("log|F| unavailable: {e}");
                None
            }
        }
    } else {
        None
    };
    let log_det_r = if compute_evidence {
        match cg.log_det(&r) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("log|R| unavailable (likely a singular R, e.g. Gradient/Curvature's constant null space): {e}");
                None
            }
        }
    } else {
        None
    };

    // Step 10: write s back into the source grid's leaves, compute L*s.
    let active_leaves: Vec<_> = source.leaves_preorder().into_iter().filter(|&id| source.cell(id).active_index.is_some()).collect();
    debug_assert_eq!(active_leaves.len(), n_active_source);
    let zero_noise = pixels.sigma <= config.noise_threshold;
    let mut max_sb_prior_violations = 0usize;
    let mut n_image_prior_violations = 0usize;
    for id in &active_leaves {
        let idx = source.cell(*id).active_index.expect("filtered above");
        let mut s = solution.s[idx];
        if config.clamp_negative_sb && zero_noise && s < 0.0 {
            s = 0.0;
        }
        if let Some(limit) = config.max_sb_prior_unselected_pixels {
            if !source.cell(*id).maps_to_image_window && s.abs() > limit {
                max_sb_prior_violations += 1;
            }
        }
        if let Some(prior) = config.n_image_prior {
            if source.cell(*id).n_images > prior {
                n_image_prior_violations += 1;
            }
        }
        source.cell_mut(*id).surface_brightness = s;
    }
    if max_sb_prior_violations > 0 {
        warn!(
            "{max_sb_prior_violations} active source cells outside the fit window exceed \
             max_sb_prior_unselected_pixels"
        );
    }
    if n_image_prior_violations > 0 {
        warn!("{n_image_prior_violations} active source cells exceed n_image_prior");
    }

    output.image_sb = l.matvec(&active_leaves.iter().map(|&id| source.cell(id).surface_brightness).collect::<Vec<_>>());
    output.image = Some(image);
    output.l = Some(l);
    output.f = Some(f);
    output.d = Some(d);
    output.log_det_f = log_det_f;
    output.log_det_r = log_det_r;
    output.solver_iters = solution.iters;
    output.solver_residual = solution.residual;
    output.max_sb_prior_violations = max_sb_prior_violations;
    output.n_image_prior_violations = n_image_prior_violations;

    Ok(())
}

/// Builds the active-row -> raster-index map for the image grid: entry `k`
/// is the `[j*nx+i]` raster index of the image pixel with `active_index ==
/// k`. Needed because `L`'s rows are addressed by active index, while the
/// caller's pixel data is addressed by raster index.
fn build_active_to_raster(image: &ImageGrid, n_active_image: usize) -> Vec<usize> {
    let mut map = vec![0usize; n_active_image];
    for (raster, cell) in image.cells().iter().enumerate() {
        if let Some(active) = cell.active_index {
            map[active] = raster;
        }
    }
    map
}

/// Resolves the configured PSF source into a convolution kernel, or `None`
/// for [`PsfSource::None`] (spec.md §4.F/§6).
fn build_psf_kernel(
    config: &ReconstructionConfig,
    image: &ImageGrid,
    external_psf: Option<&[Scalar]>,
) -> std::result::Result<Option<PsfKernel>, ReconstructionError> {
    match &config.psf {
        PsfSource::None => Ok(None),
        PsfSource::Gaussian { sigma_x, sigma_y } => {
            let window = image.window();
            let pixel_dx = window.width() / image.nx() as Scalar;
            let pixel_dy = window.height() / image.ny() as Scalar;
            Ok(Some(PsfKernel::gaussian(*sigma_x, *sigma_y, pixel_dx, pixel_dy)))
        }
        PsfSource::External { nx, ny } => {
            let data = external_psf.ok_or(ConfigError::MissingExternalPsfData)?;
            let kernel = PsfKernel::from_array(*nx, *ny, data.to_vec(), 0.0)?;
            Ok(Some(kernel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{RayTracingMethod, RegularizationMethod};

    struct Identity;
    impl Deflector for Identity {
        fn deflect(&self, x: f64, y: f64, _thread_hint: usize) -> numeric::Point {
            numeric::Point::new(x, y)
        }
        fn magnification(&self, _x: f64, _y: f64, _thread_hint: usize) -> f64 {
            1.0
        }
    }

    /// spec.md §8 scenario 1: a 4x4 uniform grid with an identity deflector
    /// round-trips the observed image exactly under Norm regularization with
    /// no regularization weight (`max_levels = 1` pins the source grid to
    /// exactly one leaf per image pixel, so `L` is a permutation and the
    /// normal equations reduce to a diagonal system).
    #[test]
    fn uniform_4x4_identity_round_trip_is_exact() {
        let window = Rect::new(-1.0, 1.0, -1.0, 1.0);
        let sb: Vec<f64> = (0..16).map(|k| (k + 1) as f64).collect();
        let pixels = PixelData { sb: &sb, mask: None, sigma: 1.0 };
        let config = ReconstructionConfig {
            ray_tracing_method: RayTracingMethod::AreaOverlap,
            regularization: RegularizationMethod::Norm,
            regularization_parameter: 0.0,
            max_levels: 1,
            nu0: 4,
            nw0: 4,
            ..ReconstructionConfig::default()
        };

        let result = reconstruct_source(window, window, 4, 4, &Identity, &pixels, &config, None, false).unwrap();

        let source = result.source_grid().unwrap();
        let leaves = source.leaves_preorder();
        assert_eq!(leaves.len(), 16);
        for id in leaves {
            let cell = source.cell(id);
            let idx = cell.active_index.expect("every leaf is active in this scenario");
            assert!(
                (cell.surface_brightness - sb[idx]).abs() < 1e-8,
                "leaf {idx} expected {} got {}",
                sb[idx],
                cell.surface_brightness
            );
        }
        let (unmapped_image, unmapped_source, sb_violations, n_image_violations) = result.anomaly_counts();
        assert_eq!(unmapped_image, 0);
        assert_eq!(unmapped_source, 0);
        assert_eq!(sb_violations, 0);
        assert_eq!(n_image_violations, 0);
    }

    /// `n_image_prior` (spec.md §6) flags every active source cell whose
    /// `n_images` exceeds the configured prior; on the exact 1:1 identity
    /// mapping of `uniform_4x4_identity_round_trip_is_exact` every active
    /// leaf sees `n_images == 1.0`, so a prior below that trips all 16.
    #[test]
    fn n_image_prior_violations_are_counted_and_warned() {
        let window = Rect::new(-1.0, 1.0, -1.0, 1.0);
        let sb: Vec<f64> = (0..16).map(|k| (k + 1) as f64).collect();
        let pixels = PixelData { sb: &sb, mask: None, sigma: 1.0 };
        let config = ReconstructionConfig {
            ray_tracing_method: RayTracingMethod::AreaOverlap,
            regularization: RegularizationMethod::Norm,
            regularization_parameter: 0.0,
            max_levels: 1,
            nu0: 4,
            nw0: 4,
            n_image_prior: Some(0.5),
            ..ReconstructionConfig::default()
        };

        let result = reconstruct_source(window, window, 4, 4, &Identity, &pixels, &config, None, false).unwrap();
        let (_, _, _, n_image_violations) = result.anomaly_counts();
        assert_eq!(n_image_violations, 16);
    }

    /// spec.md §8 scenario 6: a single lit image pixel against an otherwise
    /// dark field reconstructs to a source with its surface brightness
    /// concentrated near the corresponding source cell, smoothed (not
    /// exactly reproduced) by Gradient regularization.
    #[test]
    fn single_lit_pixel_reconstructs_to_a_concentrated_source() {
        let window = Rect::new(-1.0, 1.0, -1.0, 1.0);
        let mut sb = vec![0.0; 16];
        let lit_idx = 5;
        sb[lit_idx] = 10.0;
        let pixels = PixelData { sb: &sb, mask: None, sigma: 1.0 };
        let config = ReconstructionConfig {
            ray_tracing_method: RayTracingMethod::AreaOverlap,
            regularization: RegularizationMethod::Gradient,
            regularization_parameter: 0.1,
            max_levels: 1,
            nu0: 4,
            nw0: 4,
            ..ReconstructionConfig::default()
        };

        let result = reconstruct_source(window, window, 4, 4, &Identity, &pixels, &config, None, false).unwrap();

        let source = result.source_grid().unwrap();
        let lit_cell = source
            .leaves_preorder()
            .into_iter()
            .find(|&id| source.cell(id).active_index == Some(lit_idx))
            .unwrap();
        let lit_sb = source.cell(lit_cell).surface_brightness;
        for id in source.leaves_preorder() {
            let idx = source.cell(id).active_index.unwrap();
            if idx != lit_idx {
                assert!(
                    source.cell(id).surface_brightness < lit_sb,
                    "lit pixel's source cell must dominate the reconstruction"
                );
            }
        }
        assert!(lit_sb > 0.0);
    }

    #[test]
    fn pixel_data_with_wrong_length_is_rejected() {
        let window = Rect::new(-1.0, 1.0, -1.0, 1.0);
        let sb = vec![0.0; 15];
        let pixels = PixelData { sb: &sb, mask: None, sigma: 1.0 };
        let config = ReconstructionConfig::default();
        let err = reconstruct_source(window, window, 4, 4, &Identity, &pixels, &config, None, false).unwrap_err();
        assert!(matches!(err, ReconstructionError::MalformedData(_)));
    }

    #[test]
    fn invalid_config_is_rejected_before_any_work() {
        let window = Rect::new(-1.0, 1.0, -1.0, 1.0);
        let sb = vec![0.0; 16];
        let pixels = PixelData { sb: &sb, mask: None, sigma: 1.0 };
        let mut config = ReconstructionConfig::default();
        config.nu0 = 1;
        let err = reconstruct_source(window, window, 4, 4, &Identity, &pixels, &config, None, false).unwrap_err();
        assert!(matches!(err, ReconstructionError::Config(_)));
    }
}
