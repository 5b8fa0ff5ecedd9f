//! Scalar and point types shared across the crate.
//!
//! The reference implementation (`pixelgrid.cpp`) uses `double` throughout
//! with no templated precision, so unlike a mesh-extraction library that
//! has to support both `f32` and `f64` meshes, this crate fixes the scalar
//! type instead of threading a `Real` trait through every module.

use nalgebra::Point2;

/// Scalar type used for every coordinate, weight, and matrix entry in this crate.
pub type Scalar = f64;

/// A point in either the image plane or the source plane.
pub type Point = Point2<Scalar>;

/// Axis-aligned rectangle, `[xmin, xmax] x [ymin, ymax]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub xmin: Scalar,
    pub xmax: Scalar,
    pub ymin: Scalar,
    pub ymax: Scalar,
}

impl Rect {
    pub fn new(xmin: Scalar, xmax: Scalar, ymin: Scalar, ymax: Scalar) -> Self {
        debug_assert!(xmin <= xmax && ymin <= ymax);
        Self { xmin, xmax, ymin, ymax }
    }

    pub fn width(&self) -> Scalar {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> Scalar {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> Scalar {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new(0.5 * (self.xmin + self.xmax), 0.5 * (self.ymin + self.ymax))
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.xmin && p.x <= self.xmax && p.y >= self.ymin && p.y <= self.ymax
    }

    /// Bilinearly-interpolated corner grid for splitting this rectangle into `nu x nw` children.
    pub fn corner_grid(&self, nu: usize, nw: usize) -> Vec<Vec<Point>> {
        let mut grid = Vec::with_capacity(nu + 1);
        for i in 0..=nu {
            let mut col = Vec::with_capacity(nw + 1);
            let u = i as Scalar / nu as Scalar;
            for j in 0..=nw {
                let w = j as Scalar / nw as Scalar;
                let x = self.xmin + u * self.width();
                let y = self.ymin + w * self.height();
                col.push(Point::new(x, y));
            }
            grid.push(col);
        }
        grid
    }
}
