//! Regularization builder (spec.md §4.E): `Norm`, `Gradient`, `Curvature`
//! and `Image_Plane_Curvature` operators over the adaptive source grid,
//! each assembled into `R` via the symmetric outer product `R += o^T o`.
//!
//! Grounded on `original_source/pixelgrid.cpp`
//! `generate_gmatrices`/`generate_hmatrices`/`find_nearest_two_cells`.

use crate::config::RegularizationMethod;
use crate::error::ConfigError;
use crate::image_grid::ImageGrid;
use crate::mapping::interpolate::nearest_leaf_across_face;
use crate::numeric::{Point, Scalar};
use crate::source_grid::{CellId, SourceGrid, FACE_MINUS_U, FACE_MINUS_W, FACE_PLUS_U, FACE_PLUS_W};
use crate::sparse::{LMatrix, RowBuilder, SparseMatrix};
use std::collections::HashMap;

/// Builds `R` for the selected method (spec.md §4.E). `Image_Plane_Curvature`
/// additionally needs the built `L` and the `ImageGrid` it came from, since it
/// regularizes smoothness of the *lensed* image rather than the source
/// topology directly.
pub fn build(
    method: RegularizationMethod,
    source: &SourceGrid,
    l_context: Option<(&ImageGrid, &LMatrix)>,
) -> Result<SparseMatrix, ConfigError> {
    let n = active_count(source);
    match method {
        RegularizationMethod::None => Ok(RowBuilder::new(n).build()),
        RegularizationMethod::Norm => Ok(build_norm(source, n)),
        RegularizationMethod::Gradient => Ok(build_gradient(source, n)),
        RegularizationMethod::Curvature => Ok(build_curvature(source, n)),
        RegularizationMethod::ImagePlaneCurvature => {
            let (image, l) = l_context.ok_or_else(|| {
                ConfigError::UnknownRegularization(
                    "Image_Plane_Curvature requires the built L matrix and its ImageGrid".to_string(),
                )
            })?;
            Ok(build_image_plane_curvature(image, l, n))
        }
    }
}

fn active_count(source: &SourceGrid) -> usize {
    source.leaves_preorder().iter().filter(|&&id| source.cell(id).active_index.is_some()).count()
}

/// `R = I`: one unit entry on the diagonal per active leaf.
fn build_norm(source: &SourceGrid, n: usize) -> SparseMatrix {
    let mut builder = RowBuilder::new(n);
    for id in source.leaves_preorder() {
        if let Some(idx) = source.cell(id).active_index {
            builder.add_outer_product(&[(idx, 1.0)]);
        }
    }
    builder.build()
}

/// Resolves the face-neighbor contribution for one leaf as a set of
/// `(active_index, weight)` terms summing to `1.0`: a single `1.0` weight
/// when the neighbor is a same-level leaf, two interpolated weights when the
/// neighbor is split (`find_nearest_two_cells`), renormalized if one of the
/// two candidate leaves turned out inactive (spec.md §4.E: "inactive pixels
/// in the stencil are zeroed out and the opposing weight renormalized to
/// 1"). Returns `None` when there is no neighbor at all on this face (domain
/// boundary).
fn resolve_face_terms(source: &SourceGrid, leaf: CellId, face: usize) -> Option<Vec<(usize, Scalar)>> {
    let neighbor = source.cell(leaf).neighbor(face)?;
    let self_center = source.cell(leaf).center();
    let candidates = match source.children_of(neighbor) {
        None => vec![(neighbor, 1.0)],
        Some(_) => find_nearest_two_cells(source, neighbor, face, self_center),
    };
    let mut terms: Vec<(usize, Scalar)> = candidates
        .into_iter()
        .filter_map(|(id, w)| {
            let leaf_id = nearest_leaf_across_face(source, id, face);
            source.cell(leaf_id).active_index.map(|idx| (idx, w))
        })
        .collect();
    if terms.is_empty() {
        return None;
    }
    let sum: Scalar = terms.iter().map(|&(_, w)| w).sum();
    if sum.abs() > 1e-15 {
        for (_, w) in terms.iter_mut() {
            *w /= sum;
        }
    }
    Some(terms)
}

/// Finds the (up to) two children of a split `neighbor` straddling
/// `self_center`'s coordinate along the axis perpendicular to `face`,
/// returning each with its linear-interpolation weight (weights sum to 1).
/// Only descends one level into `neighbor`'s own children; if those
/// children are themselves split, [`nearest_leaf_across_face`] finishes the
/// descent to an actual leaf afterward.
fn find_nearest_two_cells(
    grid: &SourceGrid,
    neighbor: CellId,
    face: usize,
    self_center: Point,
) -> Vec<(CellId, Scalar)> {
    let children = match grid.children_of(neighbor) {
        None => return vec![(neighbor, 1.0)],
        Some(c) => c,
    };
    let near_side: Vec<CellId> = match face {
        FACE_PLUS_U => (0..children.nw).map(|j| children.get(0, j)).collect(),
        FACE_MINUS_U => (0..children.nw).map(|j| children.get(children.nu - 1, j)).collect(),
        FACE_PLUS_W => (0..children.nu).map(|i| children.get(i, 0)).collect(),
        FACE_MINUS_W => (0..children.nu).map(|i| children.get(i, children.nw - 1)).collect(),
        _ => unreachable!(),
    };
    if near_side.len() == 1 {
        return vec![(near_side[0], 1.0)];
    }
    let coord = match face {
        FACE_PLUS_U | FACE_MINUS_U => self_center.y,
        _ => self_center.x,
    };
    let coords: Vec<Scalar> = near_side
        .iter()
        .map(|&id| {
            let c = grid.cell(id).center();
            match face {
                FACE_PLUS_U | FACE_MINUS_U => c.y,
                _ => c.x,
            }
        })
        .collect();
    let mut k = 0;
    while k + 1 < coords.len() && coords[k + 1] < coord {
        k += 1;
    }
    if k + 1 >= near_side.len() {
        return vec![(near_side[near_side.len() - 1], 1.0)];
    }
    let (c0, c1) = (coords[k], coords[k + 1]);
    if (c1 - c0).abs() < 1e-15 {
        return vec![(near_side[k], 1.0)];
    }
    let t = (coord - c0) / (c1 - c0);
    vec![(near_side[k], 1.0 - t), (near_side[k + 1], t)]
}

fn gradient_row(source: &SourceGrid, leaf: CellId, face: usize) -> Option<Vec<(usize, Scalar)>> {
    let self_idx = source.cell(leaf).active_index?;
    let terms = resolve_face_terms(source, leaf, face)?;
    let mut row = vec![(self_idx, 1.0)];
    for (idx, w) in terms {
        row.push((idx, -w));
    }
    row.sort_unstable_by_key(|&(c, _)| c);
    Some(row)
}

fn build_gradient(source: &SourceGrid, n: usize) -> SparseMatrix {
    let mut builder = RowBuilder::new(n);
    for id in source.leaves_preorder() {
        if source.cell(id).active_index.is_none() {
            continue;
        }
        for face in [FACE_PLUS_U, FACE_MINUS_U, FACE_PLUS_W, FACE_MINUS_W] {
            if let Some(row) = gradient_row(source, id, face) {
                builder.add_outer_product(&row);
            }
        }
    }
    builder.build()
}

fn curvature_row(source: &SourceGrid, leaf: CellId, face_pos: usize, face_neg: usize) -> Option<Vec<(usize, Scalar)>> {
    let self_idx = source.cell(leaf).active_index?;
    let pos = resolve_face_terms(source, leaf, face_pos)?;
    let neg = resolve_face_terms(source, leaf, face_neg)?;
    let mut merged: HashMap<usize, Scalar> = HashMap::new();
    merged.insert(self_idx, -2.0);
    for (idx, w) in pos.into_iter().chain(neg) {
        *merged.entry(idx).or_insert(0.0) += w;
    }
    let mut row: Vec<(usize, Scalar)> = merged.into_iter().collect();
    row.sort_unstable_by_key(|&(c, _)| c);
    Some(row)
}

fn build_curvature(source: &SourceGrid, n: usize) -> SparseMatrix {
    let mut builder = RowBuilder::new(n);
    for id in source.leaves_preorder() {
        if source.cell(id).active_index.is_none() {
            continue;
        }
        if let Some(row) = curvature_row(source, id, FACE_PLUS_U, FACE_MINUS_U) {
            builder.add_outer_product(&row);
        }
        if let Some(row) = curvature_row(source, id, FACE_PLUS_W, FACE_MINUS_W) {
            builder.add_outer_product(&row);
        }
    }
    builder.build()
}

/// `Image_Plane_Curvature` (spec.md §4.E): pre-multiplies `L` by the 3x3
/// image-space Laplacian stencil `[[0,1,0],[1,-4,1],[0,1,0]]`, skipping any
/// neighbor that is off-image or excluded by the fit mask, then accumulates
/// `R = (Laplacian . L)^T (Laplacian . L)` with the same outer-product rule
/// used everywhere else in this module.
fn build_image_plane_curvature(image: &ImageGrid, l: &LMatrix, n: usize) -> SparseMatrix {
    let nx = image.nx();
    let ny = image.ny();
    let mut builder = RowBuilder::new(n);
    for j in 0..ny {
        for i in 0..nx {
            let Some(row_idx) = image.cell(i, j).active_index else {
                continue;
            };
            let mut acc: HashMap<usize, Scalar> = HashMap::new();
            accumulate_row(&mut acc, l.row(row_idx), -4.0);
            for (di, dj) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
                let ni = i as i64 + di;
                let nj = j as i64 + dj;
                if ni < 0 || nj < 0 || ni >= nx as i64 || nj >= ny as i64 {
                    continue;
                }
                let Some(n_idx) = image.cell(ni as usize, nj as usize).active_index else {
                    continue;
                };
                accumulate_row(&mut acc, l.row(n_idx), 1.0);
            }
            if acc.is_empty() {
                continue;
            }
            let mut row: Vec<(usize, Scalar)> = acc.into_iter().collect();
            row.sort_unstable_by_key(|&(c, _)| c);
            builder.add_outer_product(&row);
        }
    }
    builder.build()
}

fn accumulate_row(acc: &mut HashMap<usize, Scalar>, row: &[(usize, Scalar)], scale: Scalar) {
    for &(c, w) in row {
        *acc.entry(c).or_insert(0.0) += w * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::Rect;
    use crate::source_grid::ActivationPolicy;

    fn active_uniform_grid(n: usize) -> SourceGrid {
        let mut grid = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), n, n, 6).unwrap();
        for id in grid.leaves_preorder() {
            grid.cell_mut(id).maps_to_image_pixel = true;
        }
        grid.assign_active_indices(ActivationPolicy::default());
        grid
    }

    #[test]
    fn norm_regularization_is_exactly_identity() {
        let grid = active_uniform_grid(4);
        let n = active_count(&grid);
        let r = build_norm(&grid, n);
        assert_eq!(r.nnz_upper(), 0);
        for i in 0..n {
            assert_eq!(r.diag()[i], 1.0);
        }
    }

    #[test]
    fn gradient_row_sums_to_zero_for_interior_cells() {
        let grid = active_uniform_grid(8);
        for id in grid.leaves_preorder() {
            if let Some(row) = gradient_row(&grid, id, FACE_PLUS_U) {
                let sum: Scalar = row.iter().map(|&(_, w)| w).sum();
                assert!(sum.abs() < 1e-10, "gradient row must sum to zero, got {sum}");
            }
        }
    }

    #[test]
    fn gradient_regularization_annihilates_constant_source() {
        let grid = active_uniform_grid(8);
        let n = active_count(&grid);
        let r = build_gradient(&grid, n);
        let s = vec![5.0; n];
        let mut y = vec![0.0; n];
        r.matvec(&s, &mut y);
        for v in y {
            assert!(v.abs() < 1e-8, "R*s must vanish for constant s, got {v}");
        }
    }
}
