//! Geometric types shared between the image grid, mapping engine, and the
//! TriRect overlap kernel (spec.md §3, §4.A).

pub mod tri_rect;

use crate::numeric::{Point, Rect, Scalar};

/// A deformed quadrilateral, e.g. the four ray-traced source-plane corners
/// of one image cell. Corner order is `(c0, c1, c2, c3)` as in spec.md §4.A;
/// the quad is always split along the `0 -> 3` diagonal into the two
/// triangles `(c0, c1, c2)` and `(c1, c3, c2)`.
#[derive(Clone, Copy, Debug)]
pub struct Quad {
    pub corners: [Point; 4],
}

impl Quad {
    pub fn new(c0: Point, c1: Point, c2: Point, c3: Point) -> Self {
        Self { corners: [c0, c1, c2, c3] }
    }

    /// The two triangles formed by splitting this quad along the `0 -> 3` diagonal.
    pub fn triangles(&self) -> (Triangle, Triangle) {
        let [c0, c1, c2, c3] = self.corners;
        (Triangle(c0, c1, c2), Triangle(c1, c3, c2))
    }

    pub fn bounding_box(&self) -> Rect {
        let xs = self.corners.map(|p| p.x);
        let ys = self.corners.map(|p| p.y);
        Rect::new(
            xs.iter().cloned().fold(Scalar::INFINITY, Scalar::min),
            xs.iter().cloned().fold(Scalar::NEG_INFINITY, Scalar::max),
            ys.iter().cloned().fold(Scalar::INFINITY, Scalar::min),
            ys.iter().cloned().fold(Scalar::NEG_INFINITY, Scalar::max),
        )
    }
}

/// A triangle with vertices in source- or image-plane coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Triangle(pub Point, pub Point, pub Point);

impl Triangle {
    pub fn area(&self) -> Scalar {
        let Triangle(a, b, c) = *self;
        0.5 * ((b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)).abs()
    }

    pub fn signed_area2(&self) -> Scalar {
        let Triangle(a, b, c) = *self;
        (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)
    }
}
