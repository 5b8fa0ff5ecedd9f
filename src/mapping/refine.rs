//! Magnification-driven adaptive refinement (spec.md §4.D/§4.H step 3).
//!
//! Grounded on `original_source/pixelgrid.cpp`
//! `adaptive_subgrid`/`split_subcells`/`split_subcells_firstlevel`: after a
//! leaf splits, only the image pixels it already recorded in
//! `overlap_pixel_ids` are re-walked against the new children, rather than
//! re-running the full bisection search, localizing the work.

use super::area_overlap::safe_div;
use crate::geometry::tri_rect;
use crate::image_grid::ImageGrid;
use crate::source_grid::{CellId, SourceGrid};

/// Branching factor used for adaptive (non-first-level) splits; spec.md §4.B
/// notes children are "typically 2x2" beyond the configurable first level.
const SPLIT_NU: usize = 2;
const SPLIT_NW: usize = 2;

/// Repeatedly splits any source leaf whose `total_magnification` exceeds
/// `base_threshold * 4^(level+1)`, until a pass produces no further splits
/// or `max_levels` is reached everywhere (spec.md §4.D). A leaf is never
/// split if doing so would leave its children with area below
/// `min_cell_area` (spec.md §6's `min_cell_area` option). Returns the total
/// number of cells split.
pub fn adaptive_subgrid(source: &mut SourceGrid, image: &ImageGrid, base_threshold: f64, min_cell_area: f64) -> usize {
    let mut total_splits = 0usize;
    loop {
        let mut to_split = Vec::new();
        for id in source.leaves_preorder() {
            let cell = source.cell(id);
            if cell.level() >= source.max_levels() {
                continue;
            }
            if cell.area() / (SPLIT_NU * SPLIT_NW) as f64 <= min_cell_area {
                continue;
            }
            let threshold = base_threshold * 4f64.powi((cell.level() + 1) as i32);
            if cell.total_magnification > threshold {
                to_split.push(id);
            }
        }
        if to_split.is_empty() {
            break;
        }
        for id in to_split {
            let overlap_pixel_ids = source.cell(id).overlap_pixel_ids.clone();
            if source.split(id, SPLIT_NU, SPLIT_NW).is_err() {
                continue;
            }
            total_splits += 1;
            recompute_children_overlaps(source, image, id, &overlap_pixel_ids);
        }
    }
    total_splits
}

/// Re-accumulates `maps_to_image_pixel`/`total_magnification`/`n_images`/
/// `overlap_pixel_ids` on the children of a just-split cell, using only the
/// image pixels the parent had already recorded.
fn recompute_children_overlaps(source: &mut SourceGrid, image: &ImageGrid, parent: CellId, overlap_pixel_ids: &[u32]) {
    let pixel_area = image.pixel_area();
    let children = source.children_of(parent).expect("just split, must have children");
    for &pid in overlap_pixel_ids {
        let idx = pid as usize;
        let i = idx % image.nx();
        let j = idx / image.nx();
        let cell = image.cell(i, j);
        let quad = cell.source_quad();
        let (t1, t2) = quad.triangles();
        let (a1_full, a2_full) = (cell.source_triangle_areas[0], cell.source_triangle_areas[1]);
        for &child in &children.ids {
            let bounds = source.cell(child).bounds();
            let (possible, _) = tri_rect::in_neighborhood(&quad, &bounds);
            if !possible {
                continue;
            }
            let a1 = tri_rect::overlap_area(&t1, &bounds);
            let a2 = tri_rect::overlap_area(&t2, &bounds);
            if a1 <= 0.0 && a2 <= 0.0 {
                continue;
            }
            let w = safe_div(a1, a1_full) + safe_div(a2, a2_full);
            let child_area = bounds.area();
            let c = source.cell_mut(child);
            c.maps_to_image_pixel = true;
            c.total_magnification += w * pixel_area / child_area;
            c.n_images += (a1 + a2) / child_area;
            if !c.overlap_pixel_ids.contains(&pid) {
                c.overlap_pixel_ids.push(pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflector::Deflector;
    use crate::numeric::{Point, Rect};

    struct Identity;
    impl Deflector for Identity {
        fn deflect(&self, x: f64, y: f64, _thread_hint: usize) -> Point {
            Point::new(x, y)
        }
        fn magnification(&self, _x: f64, _y: f64, _thread_hint: usize) -> f64 {
            1.0
        }
    }

    #[test]
    fn high_magnification_leaf_splits_and_children_inherit_overlap() {
        let mut source = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 2, 2, 6).unwrap();
        let image = ImageGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 4, 4, &Identity, None, false);
        crate::mapping::calculate_pixel_magnifications(&image, &mut source);
        let before = source.leaves_preorder().len();
        // Threshold of 0 forces every touched leaf to split on the first pass.
        adaptive_subgrid(&mut source, &image, 0.0, 0.0);
        assert!(source.leaves_preorder().len() > before);
        for id in source.leaves_preorder() {
            let cell = source.cell(id);
            if cell.level() > 1 {
                assert!(cell.maps_to_image_pixel || cell.overlap_pixel_ids.is_empty());
            }
        }
    }

    #[test]
    fn min_cell_area_blocks_further_splitting() {
        let mut source = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 2, 2, 6).unwrap();
        let image = ImageGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 4, 4, &Identity, None, false);
        crate::mapping::calculate_pixel_magnifications(&image, &mut source);
        let before = source.leaves_preorder().len();
        // Each level-1 leaf has area 1.0; a min_cell_area above what a split
        // would produce (1.0 / 4 = 0.25) must suppress the split entirely.
        adaptive_subgrid(&mut source, &image, 0.0, 0.3);
        assert_eq!(source.leaves_preorder().len(), before);
    }
}
