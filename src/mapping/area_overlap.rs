//! `Area_Overlap` ray-tracing mode (spec.md §4.D): weights an image pixel's
//! contribution to a source cell by the physical polygon-overlap area of the
//! two ray-traced triangles against that cell's rectangle, normalized by the
//! image cell's own deformed-triangle areas.
//!
//! Grounded on `original_source/pixelgrid.cpp`
//! `assign_source_mapping_flags_overlap`/`calculate_Lmatrix_overlap`.

use crate::geometry::tri_rect;
use crate::geometry::Quad;
use crate::image_grid::ImageGrid;
use crate::numeric::Scalar;
use crate::source_grid::{CellId, SourceGrid};
use crate::sparse::LMatrix;
use rayon::prelude::*;

/// Physical overlap areas `(a1, a2)` of the two triangles of `quad` against
/// every source leaf within `quad`'s bisection-search candidate range.
fn overlapping_leaf_areas(source: &SourceGrid, quad: &Quad) -> Vec<(CellId, Scalar, Scalar)> {
    let bbox = quad.bounding_box();
    let Some(bi) = source.bisection_search_overlap(bbox) else {
        return Vec::new();
    };
    let (t1, t2) = quad.triangles();
    let mut out = Vec::new();
    for ii in bi.imin..=bi.imax {
        for jj in bi.jmin..=bi.jmax {
            let first = source.first_level_cell(ii, jj);
            for leaf in source.leaves_in_subtree(first) {
                let bounds = source.cell(leaf).bounds();
                let (possible, _) = tri_rect::in_neighborhood(quad, &bounds);
                if !possible {
                    continue;
                }
                let a1 = tri_rect::overlap_area(&t1, &bounds);
                let a2 = tri_rect::overlap_area(&t2, &bounds);
                if a1 > 0.0 || a2 > 0.0 {
                    out.push((leaf, a1, a2));
                }
            }
        }
    }
    out
}

pub(crate) fn safe_div(a: Scalar, b: Scalar) -> Scalar {
    if b > 0.0 {
        a / b
    } else {
        0.0
    }
}

/// One image row's raw contributions: `(leaf, weight, physical_overlap_area)`.
pub(crate) fn row_contributions(image: &ImageGrid, source: &SourceGrid, idx: usize) -> Vec<(CellId, Scalar, Scalar)> {
    let i = idx % image.nx();
    let j = idx / image.nx();
    let cell = image.cell(i, j);
    if !cell.fit_mask {
        return Vec::new();
    }
    let quad = cell.source_quad();
    let (a1_full, a2_full) = (cell.source_triangle_areas[0], cell.source_triangle_areas[1]);
    overlapping_leaf_areas(source, &quad)
        .into_iter()
        .map(|(leaf, a1, a2)| (leaf, safe_div(a1, a1_full) + safe_div(a2, a2_full), a1 + a2))
        .collect()
}

/// Seeds `maps_to_image_pixel`, `total_magnification`, `n_images` and
/// `overlap_pixel_ids` on every source cell touched by the image (spec.md
/// §4.D/§4.H step 2). Per-row contributions are computed in parallel
/// (spec.md §5: "private overlap accumulation vectors keyed by image-row
/// index") and merged back in ascending row order for determinism.
pub fn calculate_pixel_magnifications(image: &ImageGrid, source: &mut SourceGrid) {
    let pixel_area = image.pixel_area();
    let n = image.cells().len();
    let contributions: Vec<Vec<(CellId, Scalar, Scalar)>> =
        (0..n).into_par_iter().map(|idx| row_contributions(image, source, idx)).collect();

    for (idx, row) in contributions.into_iter().enumerate() {
        for (leaf, weight, physical) in row {
            let leaf_area = source.cell(leaf).area();
            let cell = source.cell_mut(leaf);
            cell.maps_to_image_pixel = true;
            cell.total_magnification += weight * pixel_area / leaf_area;
            cell.n_images += physical;
            let id = idx as u32;
            if !cell.overlap_pixel_ids.contains(&id) {
                cell.overlap_pixel_ids.push(id);
            }
        }
    }

    for id in source.all_cells_preorder() {
        let area = source.cell(id).area();
        let cell = source.cell_mut(id);
        if cell.maps_to_image_pixel {
            cell.n_images /= area;
        }
    }
}

/// Marks every source leaf whose rectangle overlaps *any* image cell's
/// ray-traced footprint, regardless of `fit_mask` (spec.md §3's
/// `maps_to_image_window` flag, consumed by
/// `ActivationPolicy::exclude_outside_window`). Unlike
/// [`calculate_pixel_magnifications`], this pass ignores the mask entirely:
/// a leaf can map to the image *window* without mapping to any *active*
/// image pixel, e.g. when the pixel mask excludes it from the fit.
pub fn mark_image_window_coverage(image: &ImageGrid, source: &mut SourceGrid) {
    let n = image.cells().len();
    let touched: Vec<Vec<CellId>> = (0..n)
        .into_par_iter()
        .map(|idx| {
            let i = idx % image.nx();
            let j = idx / image.nx();
            let quad = image.cell(i, j).source_quad();
            overlapping_leaf_areas(source, &quad).into_iter().map(|(leaf, _, _)| leaf).collect()
        })
        .collect();
    for leaves in touched {
        for leaf in leaves {
            source.cell_mut(leaf).maps_to_image_window = true;
        }
    }
}

/// Builds `L` in Area_Overlap mode (spec.md §4.D): restricted to leaves that
/// survived activation, weights normalized so every non-empty row sums to 1.
pub fn build_l_matrix(image: &ImageGrid, source: &SourceGrid) -> LMatrix {
    let n_image = image.cells().iter().filter(|c| c.active_index.is_some()).count();
    let n_source = source.leaves_preorder().iter().filter(|&&id| source.cell(id).active_index.is_some()).count();
    let mut l = LMatrix::new(n_image, n_source);

    let n = image.cells().len();
    let rows: Vec<Option<(usize, Vec<(usize, Scalar)>)>> = (0..n)
        .into_par_iter()
        .map(|idx| {
            let i = idx % image.nx();
            let j = idx / image.nx();
            let cell = image.cell(i, j);
            let row_idx = cell.active_index?;
            let quad = cell.source_quad();
            let (a1_full, a2_full) = (cell.source_triangle_areas[0], cell.source_triangle_areas[1]);
            let mut row: Vec<(usize, Scalar)> = overlapping_leaf_areas(source, &quad)
                .into_iter()
                .filter_map(|(leaf, a1, a2)| {
                    let col = source.cell(leaf).active_index?;
                    let w = safe_div(a1, a1_full) + safe_div(a2, a2_full);
                    (w > 0.0).then_some((col, w))
                })
                .collect();
            row.sort_unstable_by_key(|&(c, _)| c);
            Some((row_idx, row))
        })
        .collect();

    for entry in rows.into_iter().flatten() {
        let (row_idx, row) = entry;
        l.set_row(row_idx, row);
    }
    l.normalize_rows();
    l
}
