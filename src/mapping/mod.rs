//! Mapping engine (spec.md §4.D): computes per-pixel magnifications that
//! drive adaptive refinement, then builds the sparse lensing matrix `L` in
//! one of two modes.
//!
//! Grounded on `original_source/pixelgrid.cpp`
//! `calculate_pixel_magnifications`/`calculate_Lmatrix_overlap`/
//! `calculate_Lmatrix_interpolate`/`adaptive_subgrid`.

pub mod area_overlap;
pub mod interpolate;
pub mod refine;

pub use refine::adaptive_subgrid;

use crate::config::RayTracingMethod;
use crate::image_grid::ImageGrid;
use crate::source_grid::SourceGrid;
use crate::sparse::LMatrix;

/// Assigns a dense `active_index` to every image cell with `fit_mask` set, in
/// raster order `(j * nx + i)`. Returns the count (spec.md §4.C's `fit_mask`).
pub fn assign_image_active_indices(image: &mut ImageGrid) -> usize {
    let mut next = 0usize;
    for cell in image.cells_mut() {
        if cell.fit_mask {
            cell.active_index = Some(next);
            next += 1;
        } else {
            cell.active_index = None;
        }
    }
    next
}

/// Seeds every source cell's `maps_to_image_pixel`, `total_magnification`,
/// `n_images` and `overlap_pixel_ids` from the current `ImageGrid` (spec.md
/// §4.D/§4.H step 2). Runs regardless of the chosen [`RayTracingMethod`]: the
/// magnification used to drive refinement is always area-overlap based.
pub fn calculate_pixel_magnifications(image: &ImageGrid, source: &mut SourceGrid) {
    area_overlap::calculate_pixel_magnifications(image, source);
}

/// Marks every source leaf that overlaps the image window at all, regardless
/// of `fit_mask` (spec.md §3 `maps_to_image_window`). See
/// [`area_overlap::mark_image_window_coverage`].
pub fn mark_image_window_coverage(image: &ImageGrid, source: &mut SourceGrid) {
    area_overlap::mark_image_window_coverage(image, source);
}

/// Builds the sparse lensing matrix `L` (spec.md §4.D step 5), dispatching
/// on the configured [`RayTracingMethod`]. Both source and image active
/// indices must already be assigned.
pub fn build_l_matrix(method: RayTracingMethod, image: &ImageGrid, source: &SourceGrid) -> LMatrix {
    match method {
        RayTracingMethod::AreaOverlap => area_overlap::build_l_matrix(image, source),
        RayTracingMethod::Interpolate => interpolate::build_l_matrix(image, source),
    }
}
