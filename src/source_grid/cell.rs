use super::{CellId, Children};
use crate::numeric::{Point, Rect, Scalar};

/// A node of the adaptive source-plane quad-tree (spec.md §3).
#[derive(Clone, Debug)]
pub struct SourceCell {
    pub(crate) bounds: Rect,
    pub(crate) center: Point,
    pub(crate) area: Scalar,
    pub(crate) level: usize,
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Option<Children>,
    /// Neighbor slot order matches `original_source/pixelgrid.cpp`: 0 = +u, 1 = -u, 2 = +w, 3 = -w.
    pub(crate) neighbors: [Option<CellId>; 4],
    /// Index of this cell within its parent's child block.
    pub(crate) ii: usize,
    pub(crate) jj: usize,

    pub active: bool,
    pub maps_to_image_pixel: bool,
    pub maps_to_image_window: bool,
    pub surface_brightness: Scalar,
    pub total_magnification: Scalar,
    pub n_images: Scalar,
    pub active_index: Option<usize>,
    pub index: Option<usize>,
    pub overlap_pixel_ids: Vec<u32>,
}

/// Face indices into [`SourceCell::neighbors`] / the L/R-matrix neighbor lookups.
pub const FACE_PLUS_U: usize = 0;
pub const FACE_MINUS_U: usize = 1;
pub const FACE_PLUS_W: usize = 2;
pub const FACE_MINUS_W: usize = 3;

pub fn opposite_face(face: usize) -> usize {
    match face {
        FACE_PLUS_U => FACE_MINUS_U,
        FACE_MINUS_U => FACE_PLUS_U,
        FACE_PLUS_W => FACE_MINUS_W,
        FACE_MINUS_W => FACE_PLUS_W,
        _ => unreachable!("face index out of range"),
    }
}

impl SourceCell {
    pub(crate) fn new_leaf(
        bounds: Rect,
        center: Point,
        area: Scalar,
        level: usize,
        parent: Option<CellId>,
        ii: usize,
        jj: usize,
    ) -> Self {
        Self {
            bounds,
            center,
            area,
            level,
            parent,
            children: None,
            neighbors: [None; 4],
            ii,
            jj,
            active: false,
            maps_to_image_pixel: false,
            maps_to_image_window: false,
            surface_brightness: 0.0,
            total_magnification: 0.0,
            n_images: 0.0,
            active_index: None,
            index: None,
            overlap_pixel_ids: Vec::new(),
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn center(&self) -> Point {
        self.center
    }

    pub fn area(&self) -> Scalar {
        self.area
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn parent(&self) -> Option<CellId> {
        self.parent
    }

    pub fn neighbor(&self, face: usize) -> Option<CellId> {
        self.neighbors[face]
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}
