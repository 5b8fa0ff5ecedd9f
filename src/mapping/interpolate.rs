//! `Interpolate` ray-tracing mode (spec.md §4.D): each image pixel center
//! samples the source plane via barycentric interpolation of three source
//! cell centers (the containing leaf, one across its u-face, one across its
//! w-face), rather than area overlap.
//!
//! Grounded on `original_source/pixelgrid.cpp`
//! `assign_source_mapping_flags_interpolate`/`calculate_Lmatrix_interpolate`/
//! `find_interpolation_cells`.

use crate::geometry::Triangle;
use crate::image_grid::ImageGrid;
use crate::numeric::Scalar;
use crate::source_grid::{CellId, SourceGrid, FACE_MINUS_U, FACE_MINUS_W, FACE_PLUS_U, FACE_PLUS_W};
use crate::sparse::LMatrix;
use rayon::prelude::*;

/// Descends from `id` toward the side of its subtree nearest to the cell we
/// approached it from, i.e. the leaf "closest" across the face the caller
/// crossed to reach `id` (spec.md §4.D: "when a neighbor is split, descend
/// to its nearest sub-leaf along that face").
pub(crate) fn nearest_leaf_across_face(grid: &SourceGrid, id: CellId, approach_face: usize) -> CellId {
    let mut current = id;
    loop {
        match grid.children_of(current) {
            None => return current,
            Some(children) => {
                current = match approach_face {
                    FACE_PLUS_U => children.get(0, 0),
                    FACE_MINUS_U => children.get(children.nu - 1, 0),
                    FACE_PLUS_W => children.get(0, 0),
                    FACE_MINUS_W => children.get(0, children.nw - 1),
                    _ => unreachable!(),
                };
            }
        }
    }
}

/// The three `(active_index, barycentric_weight)` entries for one image
/// pixel's source-plane sample point, or `None` when the point falls outside
/// the source domain entirely.
fn interpolation_row(source: &SourceGrid, p: crate::numeric::Point) -> Option<Vec<(usize, Scalar)>> {
    let leaf = source.locate_leaf(p)?;
    let cell = source.cell(leaf);
    let center = cell.center();

    let face_u = if p.x >= center.x { FACE_PLUS_U } else { FACE_MINUS_U };
    let face_w = if p.y >= center.y { FACE_PLUS_W } else { FACE_MINUS_W };

    let (Some(nu), Some(nw)) = (cell.neighbor(face_u), cell.neighbor(face_w)) else {
        // No neighbor available on one axis: fall back to the containing
        // leaf alone (spec.md §4.E's "fall back to single-neighbor" policy
        // applied here to the interpolation stencil).
        return Some(vec![(source.cell(leaf).active_index?, 1.0)]);
    };
    let u_leaf = nearest_leaf_across_face(source, nu, face_u);
    let w_leaf = nearest_leaf_across_face(source, nw, face_w);

    let p0 = center;
    let p1 = source.cell(u_leaf).center();
    let p2 = source.cell(w_leaf).center();
    let total = Triangle(p0, p1, p2).signed_area2();
    if total.abs() < 1e-15 {
        return Some(vec![(source.cell(leaf).active_index?, 1.0)]);
    }

    let w0 = Triangle(p, p1, p2).signed_area2() / total;
    let w1 = Triangle(p0, p, p2).signed_area2() / total;
    let w2 = Triangle(p0, p1, p).signed_area2() / total;

    let mut row = Vec::with_capacity(3);
    for (id, w) in [(leaf, w0), (u_leaf, w1), (w_leaf, w2)] {
        if let Some(idx) = source.cell(id).active_index {
            row.push((idx, w));
        }
    }
    row.sort_unstable_by_key(|&(c, _)| c);
    Some(row)
}

/// Builds `L` in Interpolate mode (spec.md §4.D).
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
            let row = interpolation_row(source, cell.source_center)?;
            Some((row_idx, row))
        })
        .collect();

    for entry in rows.into_iter().flatten() {
        let (row_idx, row) = entry;
        l.set_row(row_idx, row);
    }
    l
}
