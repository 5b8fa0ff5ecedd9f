//! Regular image-plane grid with ray-traced corners/centers (spec.md §4.C).

use crate::deflector::Deflector;
use crate::geometry::Quad;
use crate::numeric::{Point, Rect, Scalar};
use rayon::prelude::*;

/// One cell of the regular image-plane grid, at index `(i, j)`.
#[derive(Clone, Debug)]
pub struct ImageCell {
    /// The four image-plane corners, in the order used by [`Quad`]: `(c0, c1, c2, c3)`.
    pub corners: [Point; 4],
    pub center: Point,
    /// Ray-traced source-plane corners, same ordering as `corners`.
    pub source_corners: [Point; 4],
    pub source_center: Point,
    /// Area of the two source-plane triangles formed by splitting the deformed
    /// quad along the `0 -> 3` diagonal (spec.md §4.A/§4.C).
    pub source_triangle_areas: [Scalar; 2],
    pub center_magnification: Scalar,
    pub fit_mask: bool,
    pub active_index: Option<usize>,
    /// Source cells (by arena id, stored as raw `u32` to avoid a dependency
    /// cycle with `source_grid`) that this pixel's L-matrix row touches.
    pub mapped_source_cells: Vec<u32>,
}

impl ImageCell {
    pub fn source_quad(&self) -> Quad {
        Quad::new(
            self.source_corners[0],
            self.source_corners[1],
            self.source_corners[2],
            self.source_corners[3],
        )
    }
}

/// Regular `nx x ny` image-plane pixel grid, ray-traced through a [`Deflector`].
pub struct ImageGrid {
    window: Rect,
    nx: usize,
    ny: usize,
    cells: Vec<ImageCell>,
}

impl ImageGrid {
    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn window(&self) -> Rect {
        self.window
    }

    pub fn cell(&self, i: usize, j: usize) -> &ImageCell {
        &self.cells[j * self.nx + i]
    }

    pub fn cell_mut(&mut self, i: usize, j: usize) -> &mut ImageCell {
        &mut self.cells[j * self.nx + i]
    }

    pub fn cells(&self) -> &[ImageCell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [ImageCell] {
        &mut self.cells
    }

    pub fn pixel_area(&self) -> Scalar {
        (self.window.width() / self.nx as Scalar) * (self.window.height() / self.ny as Scalar)
    }

    pub fn index_of(&self, i: usize, j: usize) -> usize {
        j * self.nx + i
    }

    /// Builds a fresh `nx x ny` image grid over `window`, ray-tracing every
    /// corner and center through `deflector` (spec.md §4.C). `fit_mask`, if
    /// given, must have `nx*ny` entries in the same `[j*nx+i]` order.
    pub fn new(
        window: Rect,
        nx: usize,
        ny: usize,
        deflector: &dyn Deflector,
        fit_mask: Option<&[bool]>,
        enable_multi_threading: bool,
    ) -> Self {
        let xstep = window.width() / nx as Scalar;
        let ystep = window.height() / ny as Scalar;

        // Image-plane corner grid, (nx+1) x (ny+1) points.
        let corner_grid: Vec<Vec<Point>> = (0..=nx)
            .map(|i| {
                (0..=ny)
                    .map(|j| Point::new(window.xmin + i as Scalar * xstep, window.ymin + j as Scalar * ystep))
                    .collect()
            })
            .collect();

        let build_cell = |idx: usize| -> ImageCell {
            let i = idx % nx;
            let j = idx / nx;
            let c0 = corner_grid[i][j];
            let c1 = corner_grid[i][j + 1];
            let c2 = corner_grid[i + 1][j];
            let c3 = corner_grid[i + 1][j + 1];
            let center = Point::new(0.5 * (c0.x + c3.x), 0.5 * (c0.y + c3.y));
            let thread_hint = idx % rayon::current_num_threads().max(1);
            let sc0 = deflector.deflect(c0.x, c0.y, thread_hint);
            let sc1 = deflector.deflect(c1.x, c1.y, thread_hint);
            let sc2 = deflector.deflect(c2.x, c2.y, thread_hint);
            let sc3 = deflector.deflect(c3.x, c3.y, thread_hint);
            let s_center = deflector.deflect(center.x, center.y, thread_hint);
            let mag = deflector.magnification(center.x, center.y, thread_hint);
            let quad = Quad::new(sc0, sc1, sc2, sc3);
            let (t1, t2) = quad.triangles();
            ImageCell {
                corners: [c0, c1, c2, c3],
                center,
                source_corners: [sc0, sc1, sc2, sc3],
                source_center: s_center,
                source_triangle_areas: [t1.area(), t2.area()],
                center_magnification: mag,
                fit_mask: fit_mask.map(|m| m[idx]).unwrap_or(true),
                active_index: None,
                mapped_source_cells: Vec::new(),
            }
        };

        let n = nx * ny;
        let cells = if enable_multi_threading {
            (0..n).into_par_iter().map(build_cell).collect()
        } else {
            (0..n).map(build_cell).collect()
        };

        Self { window, nx, ny, cells }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn identity_deflector_leaves_triangle_areas_equal_to_half_pixel_area() {
        let grid = ImageGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 4, 4, &Identity, None, false);
        let pixel_area = grid.pixel_area();
        for cell in grid.cells() {
            let sum: f64 = cell.source_triangle_areas.iter().sum();
            assert!((sum - pixel_area).abs() < 1e-10);
        }
    }

    #[test]
    fn fit_mask_is_threaded_through() {
        let mut mask = vec![true; 16];
        mask[0] = false;
        let grid = ImageGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), 4, 4, &Identity, Some(&mask), false);
        assert!(!grid.cell(0, 0).fit_mask);
        assert!(grid.cell(1, 0).fit_mask);
    }
}
