//! Adaptive quad-tree source-plane grid (spec.md §3, §4.B).
//!
//! Cells live in a flat arena (`Vec<Option<SourceCell>>`) and refer to each
//! other only through [`CellId`] indices: no raw pointers, no back-
//! reference cycles, no process-wide static state (spec.md Design Notes
//! §9 flags the reference implementation's static layout as a design
//! smell to fix; this module fixes it by construction, grounded on the
//! index-based arena approach used by `DonkulosisLabs-pixel_map_rs`'s
//! quad-tree).

mod bisection;
mod cell;
mod neighbor;

pub use bisection::BoundingIndices;
pub use cell::{opposite_face, SourceCell, FACE_MINUS_U, FACE_MINUS_W, FACE_PLUS_U, FACE_PLUS_W};

use crate::error::GridError;
use crate::numeric::{Point, Rect, Scalar};
use std::collections::VecDeque;

/// Stable index into a [`SourceGrid`]'s cell arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub(crate) u32);

impl CellId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous, row-major block of `nu x nw` children belonging to one cell.
/// Storage index for child `(i, j)` is `i * nw + j`; traversal order (spec.md
/// I4: outer w, inner u) is realized by the iteration order of callers, not
/// by this storage layout.
#[derive(Clone, Debug)]
pub(crate) struct Children {
    pub nu: usize,
    pub nw: usize,
    pub ids: Vec<CellId>,
}

impl Children {
    pub(crate) fn get(&self, i: usize, j: usize) -> CellId {
        self.ids[i * self.nw + j]
    }
}

/// Policy flags controlling [`SourceGrid::assign_active_indices`] (spec.md §4.B).
#[derive(Clone, Copy, Debug, Default)]
pub struct ActivationPolicy {
    /// Whether a leaf that mapped to zero image pixels is still activated.
    pub activate_unmapped: bool,
    /// Whether an unmapped subcell (level >= 2) triggers the parent to unsplit.
    pub regrid_if_unmapped_subcells: bool,
    /// Whether leaves outside the fit window are excluded from activation.
    pub exclude_outside_window: bool,
}

/// The adaptive source-plane grid.
pub struct SourceGrid {
    cells: Vec<Option<SourceCell>>,
    free_list: Vec<u32>,
    root: CellId,
    pub(crate) nu0: usize,
    pub(crate) nw0: usize,
    max_levels: usize,
    domain: Rect,
    levels: usize,
    n_pixels: usize,
}

impl SourceGrid {
    /// Builds a fresh grid: a level-0 root spanning `domain`, split immediately
    /// into a uniform `nu0 x nw0` tiling at level 1, per spec.md §4.B.
    pub fn new(domain: Rect, nu0: usize, nw0: usize, max_levels: usize) -> Result<Self, GridError> {
        debug_assert!(nu0 >= 2 && nw0 >= 2, "first-level split counts must be validated by the caller (config::ReconstructionConfig::validate)");
        let root_cell = SourceCell::new_leaf(domain, domain.center(), domain.area(), 0, None, 0, 0);
        let cells = vec![Some(root_cell)];
        let root = CellId(0);
        let mut grid = Self {
            cells,
            free_list: Vec::new(),
            root,
            nu0,
            nw0,
            max_levels,
            domain,
            levels: 0,
            n_pixels: 0,
        };
        grid.split(root, nu0, nw0)?;
        grid.rebuild_neighbors();
        Ok(grid)
    }

    pub fn root(&self) -> CellId {
        self.root
    }

    pub fn domain(&self) -> Rect {
        self.domain
    }

    pub fn nu0(&self) -> usize {
        self.nu0
    }

    pub fn nw0(&self) -> usize {
        self.nw0
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn cell(&self, id: CellId) -> &SourceCell {
        self.cells[id.index()].as_ref().expect("dangling CellId")
    }

    pub fn cell_mut(&mut self, id: CellId) -> &mut SourceCell {
        self.cells[id.index()].as_mut().expect("dangling CellId")
    }

    pub fn is_leaf(&self, id: CellId) -> bool {
        self.cell(id).children.is_none()
    }

    fn alloc(&mut self, c: SourceCell) -> CellId {
        if let Some(idx) = self.free_list.pop() {
            self.cells[idx as usize] = Some(c);
            CellId(idx)
        } else {
            self.cells.push(Some(c));
            CellId((self.cells.len() - 1) as u32)
        }
    }

    /// Subdivides a leaf into a uniform `nu x nw` block of children by bilinear
    /// interpolation of its four corners (spec.md §4.B).
    pub fn split(&mut self, id: CellId, nu: usize, nw: usize) -> Result<(), GridError> {
        let (bounds, level, ii, jj) = {
            let c = self.cell(id);
            (c.bounds, c.level, c.ii, c.jj)
        };
        if level >= self.max_levels {
            return Err(GridError::MaxDepthExceeded { level, max_levels: self.max_levels });
        }
        if !self.is_leaf(id) {
            return Err(GridError::AlreadySplit);
        }
        let child_level = level + 1;
        let corners = bounds.corner_grid(nu, nw);
        let mut ids = Vec::with_capacity(nu * nw);
        for i in 0..nu {
            for j in 0..nw {
                let xmin = corners[i][j].x;
                let xmax = corners[i + 1][j].x;
                let ymin = corners[i][j].y;
                let ymax = corners[i][j + 1].y;
                let child_bounds = Rect::new(xmin.min(xmax), xmin.max(xmax), ymin.min(ymax), ymin.max(ymax));
                let child = SourceCell::new_leaf(
                    child_bounds,
                    child_bounds.center(),
                    child_bounds.area(),
                    child_level,
                    Some(id),
                    i,
                    j,
                );
                let cid = self.alloc(child);
                ids.push((i, j, cid));
            }
        }
        let mut ordered = vec![CellId(0); nu * nw];
        for (i, j, cid) in ids {
            ordered[i * nw + j] = cid;
        }
        self.cell_mut(id).children = Some(Children { nu, nw, ids: ordered });
        self.levels = self.levels.max(child_level);
        self.n_pixels += nu * nw - 1;
        self.rebuild_neighbors();
        Ok(())
    }

    /// Deletes an entire subtree, averaging leaf surface brightnesses back into
    /// the parent (spec.md §4.B).
    pub fn unsplit(&mut self, id: CellId) -> Result<(), GridError> {
        if self.is_leaf(id) {
            return Ok(());
        }
        let avg = self.average_and_free_subtree(id);
        let c = self.cell_mut(id);
        c.children = None;
        c.surface_brightness = avg;
        self.rebuild_neighbors();
        Ok(())
    }

    fn average_and_free_subtree(&mut self, id: CellId) -> Scalar {
        let children = self.cell(id).children.clone();
        let Some(children) = children else {
            return self.cell(id).surface_brightness;
        };
        let count = (children.nu * children.nw) as Scalar;
        let mut sum = 0.0;
        for &cid in &children.ids {
            sum += self.average_and_free_subtree(cid);
            self.free(cid);
        }
        self.n_pixels -= children.nu * children.nw - 1;
        sum / count
    }

    fn free(&mut self, id: CellId) {
        self.cells[id.index()] = None;
        self.free_list.push(id.0);
    }

    /// Pre-order traversal of leaf cells in the canonical order (outer w, inner u),
    /// per spec.md I4 / Design Notes §9.
    pub fn leaves_preorder(&self) -> Vec<CellId> {
        let mut out = Vec::new();
        self.collect_leaves_preorder(self.root, &mut out);
        out
    }

    fn collect_leaves_preorder(&self, id: CellId, out: &mut Vec<CellId>) {
        match &self.cell(id).children {
            None => out.push(id),
            Some(children) => {
                for j in 0..children.nw {
                    for i in 0..children.nu {
                        self.collect_leaves_preorder(children.get(i, j), out);
                    }
                }
            }
        }
    }

    /// Re-order traversal of *all* cells (leaves and internal nodes), pre-order,
    /// visiting a node before its children.
    pub fn all_cells_preorder(&self) -> Vec<CellId> {
        let mut out = Vec::new();
        self.collect_all_preorder(self.root, &mut out);
        out
    }

    fn collect_all_preorder(&self, id: CellId, out: &mut Vec<CellId>) {
        out.push(id);
        if let Some(children) = self.cell(id).children.clone() {
            for j in 0..children.nw {
                for i in 0..children.nu {
                    self.collect_all_preorder(children.get(i, j), out);
                }
            }
        }
    }

    /// Assigns a dense `index` to every leaf in pre-order, and recomputes the
    /// tree's max depth. Returns the max depth (spec.md §4.B).
    pub fn assign_indices_and_count_levels(&mut self) -> usize {
        let leaves = self.leaves_preorder();
        for (k, id) in leaves.iter().enumerate() {
            self.cell_mut(*id).index = Some(k);
        }
        let mut max_level = 0;
        for id in self.all_cells_preorder() {
            max_level = max_level.max(self.cell(id).level);
        }
        self.levels = max_level;
        self.levels
    }

    /// Assigns dense active indices to the subset of leaves selected by `policy`
    /// (spec.md §4.B). When `regrid_if_unmapped_subcells` triggers an unsplit,
    /// the caller should re-run this until it returns without having unsplit
    /// anything further; [`SourceGrid::assign_active_indices`] itself loops
    /// internally until stable.
    pub fn assign_active_indices(&mut self, policy: ActivationPolicy) -> usize {
        loop {
            let did_unsplit = self.regrid_unmapped_subcells(policy);
            if !did_unsplit {
                break;
            }
        }
        let leaves = self.leaves_preorder();
        let mut next = 0usize;
        for id in leaves {
            let is_first_level = self.cell(id).level == 1;
            let cell = self.cell_mut(id);
            let mapped = cell.maps_to_image_pixel;
            // Mirrors original_source/pixelgrid.cpp assign_active_indices: an unmapped
            // leaf is still activated when activate_unmapped is set AND either we are
            // not regridding unmapped subcells at all, or this leaf is a first-level
            // cell (which can never be dropped via unsplit since it has no parent to
            // unsplit into).
            let activate_despite_unmapped =
                policy.activate_unmapped && (!policy.regrid_if_unmapped_subcells || is_first_level);
            let eligible = (mapped || activate_despite_unmapped)
                && (!policy.exclude_outside_window || cell.maps_to_image_window);
            if eligible {
                cell.active = true;
                cell.active_index = Some(next);
                next += 1;
            } else {
                cell.active = false;
                cell.active_index = None;
            }
        }
        next
    }

    /// Walks leaves at level >= 2 that failed to map to any image pixel and
    /// unsplits their parent, per spec.md §4.B's `regrid_if_unmapped_subcells`
    /// policy. Returns whether any unsplit happened.
    fn regrid_unmapped_subcells(&mut self, policy: ActivationPolicy) -> bool {
        if !policy.regrid_if_unmapped_subcells {
            return false;
        }
        let mut parents_to_unsplit = Vec::new();
        for id in self.leaves_preorder() {
            let c = self.cell(id);
            if c.level >= 2 && !c.maps_to_image_pixel {
                if let Some(parent) = c.parent {
                    if !parents_to_unsplit.contains(&parent) {
                        parents_to_unsplit.push(parent);
                    }
                }
            }
        }
        let any = !parents_to_unsplit.is_empty();
        for parent in parents_to_unsplit {
            let _ = self.unsplit(parent);
        }
        any
    }

    /// Re-derives every cell's four neighbor references from scratch, top-down
    /// by level (spec.md §4.B's neighbor-maintenance rule). Simpler than an
    /// incremental local rebuild and correct after any split/unsplit; called
    /// automatically by [`SourceGrid::split`] and [`SourceGrid::unsplit`].
    pub(crate) fn rebuild_neighbors(&mut self) {
        neighbor::rebuild_neighbors(self);
    }

    /// Computes the bounding first-level-cell index range intersected by a quad's
    /// bounding box (spec.md §4.B `bisection_search_overlap`).
    pub fn bisection_search_overlap(&self, quad_bbox: Rect) -> Option<BoundingIndices> {
        bisection::bisection_search_overlap(self, quad_bbox)
    }

    /// Resets per-mapping-pass flags (`maps_to_image_pixel`, `maps_to_image_window`,
    /// `overlap_pixel_ids`, `total_magnification`, `n_images`) on every cell, ahead
    /// of a fresh mapping pass (spec.md §4.H step 2).
    pub fn reset_mapping_state(&mut self) {
        for id in self.all_cells_preorder() {
            let c = self.cell_mut(id);
            c.maps_to_image_pixel = false;
            c.maps_to_image_window = false;
            c.total_magnification = 0.0;
            c.n_images = 0.0;
            c.overlap_pixel_ids.clear();
        }
    }

    pub(crate) fn children_of(&self, id: CellId) -> Option<Children> {
        self.cell(id).children.clone()
    }

    /// The first-level cell at `(i, j)` (`0 <= i < nu0`, `0 <= j < nw0`); the
    /// root is always split into a uniform `nu0 x nw0` block by
    /// [`SourceGrid::new`], so this is a direct lookup.
    pub fn first_level_cell(&self, i: usize, j: usize) -> CellId {
        let children = self.children_of(self.root).expect("root is always split at construction");
        children.get(i, j)
    }

    /// All leaves of the subtree rooted at `id`, in the same pre-order
    /// (outer w, inner u) used by [`SourceGrid::leaves_preorder`].
    pub fn leaves_in_subtree(&self, id: CellId) -> Vec<CellId> {
        let mut out = Vec::new();
        self.collect_leaves_preorder(id, &mut out);
        out
    }

    /// Descends the tree to the leaf containing `p`, or `None` if `p` lies
    /// outside the domain (used by the Interpolate mapping mode, spec.md
    /// §4.D). Ties at a shared boundary resolve to the lower-index child
    /// since [`Rect::contains`] is inclusive on both ends.
    pub fn locate_leaf(&self, p: Point) -> Option<CellId> {
        if !self.domain.contains(p) {
            return None;
        }
        let mut current = self.root;
        loop {
            match self.children_of(current) {
                None => return Some(current),
                Some(children) => {
                    let mut next = children.ids[0];
                    'search: for i in 0..children.nu {
                        for j in 0..children.nw {
                            let cid = children.get(i, j);
                            if self.cell(cid).bounds.contains(p) {
                                next = cid;
                                break 'search;
                            }
                        }
                    }
                    current = next;
                }
            }
        }
    }
}

/// BFS queue helper used by a couple of internal traversals that need level order
/// rather than pre-order.
pub(crate) fn bfs_order(grid: &SourceGrid) -> Vec<CellId> {
    let mut out = Vec::new();
    let mut q = VecDeque::new();
    q.push_back(grid.root());
    while let Some(id) = q.pop_front() {
        out.push(id);
        if let Some(children) = grid.children_of(id) {
            for cid in children.ids {
                q.push_back(cid);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> Rect {
        Rect::new(-1.0, 1.0, -1.0, 1.0)
    }

    #[test]
    fn uniform_first_level_has_correct_leaf_count() {
        let grid = SourceGrid::new(domain(), 2, 2, 6).unwrap();
        assert_eq!(grid.leaves_preorder().len(), 4);
    }

    #[test]
    fn children_tile_parent_without_gap_or_overlap() {
        let mut grid = SourceGrid::new(domain(), 2, 2, 6).unwrap();
        let leaf = grid.leaves_preorder()[0];
        grid.split(leaf, 2, 2).unwrap();
        let parent_bounds = {
            // re-derive the parent bounds from before the split by reconstructing from children
            let children = grid.children_of(leaf).unwrap();
            let mut area_sum = 0.0;
            for cid in &children.ids {
                area_sum += grid.cell(*cid).bounds.area();
            }
            area_sum
        };
        // Parent cell occupied one quadrant of a 2x2 split of [-1,1]^2, i.e area 1.0
        assert!((parent_bounds - 1.0).abs() < 1e-12);
    }

    #[test]
    fn split_then_unsplit_restores_leaf_count() {
        let mut grid = SourceGrid::new(domain(), 2, 2, 6).unwrap();
        let before = grid.leaves_preorder().len();
        let leaf = grid.leaves_preorder()[0];
        grid.split(leaf, 2, 2).unwrap();
        assert_eq!(grid.leaves_preorder().len(), before + 3);
        grid.unsplit(leaf).unwrap();
        assert_eq!(grid.leaves_preorder().len(), before);
    }

    #[test]
    fn unsplit_averages_child_surface_brightness() {
        let mut grid = SourceGrid::new(domain(), 2, 2, 6).unwrap();
        let leaf = grid.leaves_preorder()[0];
        grid.split(leaf, 2, 2).unwrap();
        let children = grid.children_of(leaf).unwrap();
        for (k, cid) in children.ids.iter().enumerate() {
            grid.cell_mut(*cid).surface_brightness = k as Scalar;
        }
        grid.unsplit(leaf).unwrap();
        // average of 0,1,2,3 = 1.5
        assert!((grid.cell(leaf).surface_brightness - 1.5).abs() < 1e-12);
    }

    #[test]
    fn split_beyond_max_levels_is_rejected() {
        let mut grid = SourceGrid::new(domain(), 2, 2, 1).unwrap();
        let leaf = grid.leaves_preorder()[0];
        assert!(grid.split(leaf, 2, 2).is_err());
    }

    #[test]
    fn active_indices_are_dense_permutation() {
        let mut grid = SourceGrid::new(domain(), 4, 4, 6).unwrap();
        for id in grid.leaves_preorder() {
            grid.cell_mut(id).maps_to_image_pixel = true;
        }
        let n = grid.assign_active_indices(ActivationPolicy {
            activate_unmapped: false,
            regrid_if_unmapped_subcells: false,
            exclude_outside_window: false,
        });
        assert_eq!(n, 16);
        let mut seen = vec![false; n];
        for id in grid.leaves_preorder() {
            let idx = grid.cell(id).active_index.unwrap();
            assert!(!seen[idx]);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&b| b));
    }
}
