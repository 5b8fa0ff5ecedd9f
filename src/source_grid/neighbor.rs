//! Top-down neighbor rebuild (spec.md §4.B, grounded on
//! `original_source/pixelgrid.cpp` `assign_level_neighbors`/
//! `assign_firstlevel_neighbors`).
//!
//! Every cell's four neighbors are re-derived from its parent's neighbors,
//! processing level by level from the root down, so that a cell's own
//! neighbors (needed to resolve its children's *outer* faces) are always
//! already assigned by the time its children are visited.

use super::cell::{FACE_MINUS_U, FACE_MINUS_W, FACE_PLUS_U, FACE_PLUS_W};
use super::{CellId, SourceGrid};
use std::collections::VecDeque;

pub(crate) fn rebuild_neighbors(grid: &mut SourceGrid) {
    // Root has no neighbors; nothing else to do if it's still a leaf.
    let root = grid.root();
    grid.cell_mut(root).neighbors = [None; 4];

    let mut queue = VecDeque::new();
    queue.push_back(root);
    while let Some(parent) = queue.pop_front() {
        let Some(children) = grid.children_of(parent) else {
            continue;
        };
        let nu = children.nu;
        let nw = children.nw;
        for i in 0..nu {
            for j in 0..nw {
                let child = children.ids[i * nw + j];
                let plus_u = if i + 1 < nu {
                    Some(children.ids[(i + 1) * nw + j])
                } else {
                    resolve_across(grid, parent, FACE_PLUS_U, i, j, nu, nw)
                };
                let minus_u = if i > 0 {
                    Some(children.ids[(i - 1) * nw + j])
                } else {
                    resolve_across(grid, parent, FACE_MINUS_U, i, j, nu, nw)
                };
                let plus_w = if j + 1 < nw {
                    Some(children.ids[i * nw + (j + 1)])
                } else {
                    resolve_across(grid, parent, FACE_PLUS_W, i, j, nu, nw)
                };
                let minus_w = if j > 0 {
                    Some(children.ids[i * nw + (j - 1)])
                } else {
                    resolve_across(grid, parent, FACE_MINUS_W, i, j, nu, nw)
                };
                grid.cell_mut(child).neighbors = [plus_u, minus_u, plus_w, minus_w];
                queue.push_back(child);
            }
        }
    }
}

/// Resolves a child's neighbor across a face that lies on the boundary of its
/// parent's child block, by looking at the parent's own neighbor on that face
/// (spec.md §4.B variant (ii)/(iii)): if the parent's neighbor is a leaf (or
/// absent), that's the answer directly (coarser neighbor, or domain
/// boundary). If the parent's neighbor is itself split, pick the child of
/// that neighbor adjacent to us, clamping the cross-axis index to the
/// neighbor's last child if it has fewer children along that axis
/// (spec.md §9 Open Question: heterogeneous Nu/Nw loses resolution here).
fn resolve_across(
    grid: &SourceGrid,
    parent: CellId,
    face: usize,
    i: usize,
    j: usize,
    nu: usize,
    nw: usize,
) -> Option<CellId> {
    let parent_neighbor = grid.cell(parent).neighbor(face)?;
    let Some(neighbor_children) = grid.children_of(parent_neighbor) else {
        return Some(parent_neighbor);
    };
    match face {
        FACE_PLUS_U => {
            // Adjacent along u: neighbor's i=0 column, matched by our w-index j,
            // clamped to the neighbor's nw.
            let jc = j.min(neighbor_children.nw - 1);
            Some(neighbor_children.ids[jc])
        }
        FACE_MINUS_U => {
            let jc = j.min(neighbor_children.nw - 1);
            Some(neighbor_children.ids[(neighbor_children.nu - 1) * neighbor_children.nw + jc])
        }
        FACE_PLUS_W => {
            let ic = i.min(neighbor_children.nu - 1);
            Some(neighbor_children.ids[ic * neighbor_children.nw + 0])
        }
        FACE_MINUS_W => {
            let ic = i.min(neighbor_children.nu - 1);
            Some(neighbor_children.ids[ic * neighbor_children.nw + (neighbor_children.nw - 1)])
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use crate::numeric::Rect;
    use crate::source_grid::cell::{FACE_MINUS_U, FACE_MINUS_W, FACE_PLUS_U, FACE_PLUS_W};
    use crate::source_grid::SourceGrid;

    #[test]
    fn firstlevel_boundary_neighbors_are_none() {
        let grid = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 2, 2, 6).unwrap();
        let leaves = grid.leaves_preorder();
        // leaves_preorder iterates outer w inner u: order is (i=0,j=0),(i=1,j=0),(i=0,j=1),(i=1,j=1)
        let c00 = leaves[0];
        assert_eq!(grid.cell(c00).neighbor(FACE_MINUS_U), None);
        assert_eq!(grid.cell(c00).neighbor(FACE_MINUS_W), None);
        assert!(grid.cell(c00).neighbor(FACE_PLUS_U).is_some());
        assert!(grid.cell(c00).neighbor(FACE_PLUS_W).is_some());
    }

    #[test]
    fn split_subcells_report_consistent_sibling_neighbors() {
        let mut grid = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 2, 2, 6).unwrap();
        let leaf = grid.leaves_preorder()[0];
        grid.split(leaf, 2, 2).unwrap();
        let children = grid.children_of(leaf).unwrap();
        let c00 = children.ids[0 * 2 + 0];
        let c10 = children.ids[1 * 2 + 0];
        assert_eq!(grid.cell(c00).neighbor(FACE_PLUS_U), Some(c10));
        assert_eq!(grid.cell(c10).neighbor(FACE_MINUS_U), Some(c00));
        // outer faces of the sub-block point outward beyond the original leaf
        assert_eq!(grid.cell(c00).neighbor(FACE_MINUS_U), grid.cell(leaf).neighbor(FACE_MINUS_U));
    }

    /// spec.md §9 Open Question: when a neighbor splits with a different
    /// Nu/Nw than the querying cell's own child block, the cross-axis index
    /// clamps to the neighbor's last child. Documents the resolution loss
    /// this causes rather than hiding it.
    #[test]
    fn heterogeneous_split_neighbor_clamps_to_last_child() {
        let mut grid = SourceGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 2, 2, 6).unwrap();
        let leaves = grid.leaves_preorder();
        let left = leaves[0]; // (i=0, j=0)
        let right = leaves[1]; // (i=1, j=0), left's +u neighbor
        assert_eq!(grid.cell(left).neighbor(FACE_PLUS_U), Some(right));

        // Split the right cell finely along w (1x3) but coarsely along u (1 wide),
        // so it has three children stacked along w at a single u-column.
        grid.split(right, 1, 3).unwrap();
        // Split the left cell 1x1 (stays a leaf) is a no-op; instead split it 1x1 is
        // invalid (already a leaf is fine), so just re-fetch its +u neighbor: it
        // must resolve to *a* child of `right`, clamped onto the neighbor's own
        // j-range since left has only one row along w.
        let resolved = grid.cell(left).neighbor(FACE_PLUS_U).unwrap();
        let right_children = grid.children_of(right).unwrap();
        assert!(right_children.ids.contains(&resolved));
    }
}
