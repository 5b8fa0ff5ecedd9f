//! PSF convolution of `L` (spec.md §4.F), grounded on
//! `original_source/pixelgrid.cpp::Lens::PSF_convolution_Lmatrix` and
//! `load_psf_fits`.
//!
//! A kernel `K` of odd `(nx, ny)` extent replaces every image pixel's
//! `L`-row with a kernel-weighted sum of its neighbors' rows: `L'[i,j] =
//! sum_{ox,oy} K[ox,oy] * L[i-ox, j-oy]`, skipping any neighbor that falls
//! off the image grid. Sparsity is preserved since the sum only ever touches
//! the (few) neighbors the kernel footprint covers.

use crate::error::ConfigError;
use crate::image_grid::ImageGrid;
use crate::numeric::Scalar;
use crate::sparse::LMatrix;
use rayon::prelude::*;
use std::collections::HashMap;

/// A 2D array handed in by a caller-supplied FITS reader (spec.md §6: "FITS
/// input/output (optional)"). This crate does not vendor a FITS-reading
/// dependency (no fetchable, widely-used FITS crate in this corpus, see
/// DESIGN.md); an embedding application populates this struct from whatever
/// FITS library it already depends on and hands it to
/// [`PsfKernel::from_array`] via its fields.
#[cfg(feature = "io")]
#[derive(Clone, Debug)]
pub struct FitsArray {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<Scalar>,
}

/// An odd-dimensioned, sum-normalized convolution kernel centered on its
/// middle entry, indexed `data[oy * nx + ox]` with `ox in [-half_x, half_x]`,
/// `oy in [-half_y, half_y]` mapped to `[0, nx)`/`[0, ny)` by adding the half
/// width (spec.md §4.F).
#[derive(Clone, Debug)]
pub struct PsfKernel {
    nx: usize,
    ny: usize,
    data: Vec<Scalar>,
}

impl PsfKernel {
    fn half_x(&self) -> i64 {
        (self.nx / 2) as i64
    }

    fn half_y(&self) -> i64 {
        (self.ny / 2) as i64
    }

    fn at(&self, ox: i64, oy: i64) -> Scalar {
        let ix = (ox + self.half_x()) as usize;
        let iy = (oy + self.half_y()) as usize;
        self.data[iy * self.nx + ix]
    }

    fn normalize(&mut self) {
        let sum: Scalar = self.data.iter().sum();
        if sum.abs() > 0.0 {
            for v in self.data.iter_mut() {
                *v /= sum;
            }
        }
    }

    /// Synthesizes a separable Gaussian kernel over a `+/-1.6 sigma`
    /// footprint (spec.md §4.F), given the per-pixel step sizes of the image
    /// grid it will convolve. Rounds the half-width up when the fractional
    /// remainder exceeds one half, exactly as
    /// `PSF_convolution_Lmatrix`'s `nx_half_dec`/`ny_half_dec` rounding.
    pub fn gaussian(sigma_x: Scalar, sigma_y: Scalar, pixel_dx: Scalar, pixel_dy: Scalar) -> Self {
        const SIGMA_FRACTION: Scalar = 1.6;
        let round_half = |half_dec: Scalar| -> i64 {
            let half = half_dec as i64;
            if half_dec - half as Scalar > 0.5 {
                half + 1
            } else {
                half
            }
        };
        let half_x = round_half(SIGMA_FRACTION * sigma_x / pixel_dx).max(0);
        let half_y = round_half(SIGMA_FRACTION * sigma_y / pixel_dy).max(0);
        let nx = (2 * half_x + 1) as usize;
        let ny = (2 * half_y + 1) as usize;
        let mut data = vec![0.0; nx * ny];
        for (iy, row) in data.chunks_mut(nx).enumerate() {
            let y = (iy as i64 - half_y) as Scalar * pixel_dy;
            for (ix, cell) in row.iter_mut().enumerate() {
                let x = (ix as i64 - half_x) as Scalar * pixel_dx;
                *cell = (-0.5 * ((x / sigma_x).powi(2) + (y / sigma_y).powi(2))).exp();
            }
        }
        let mut kernel = Self { nx, ny, data };
        kernel.normalize();
        kernel
    }

    /// Builds a kernel from a caller-supplied 2D array (e.g. loaded from a
    /// FITS file by the embedding application), thresholding small entries
    /// to zero before re-normalizing to sum 1, matching
    /// `load_psf_fits`'s `psf_threshold` handling.
    pub fn from_array(nx: usize, ny: usize, mut data: Vec<Scalar>, threshold: Scalar) -> Result<Self, ConfigError> {
        if nx % 2 == 0 || ny % 2 == 0 {
            return Err(ConfigError::EvenPsfDimensions { nx, ny });
        }
        if data.len() != nx * ny {
            return Err(ConfigError::PsfDataLengthMismatch { expected: nx * ny, actual: data.len() });
        }
        for v in data.iter_mut() {
            if *v < threshold {
                *v = 0.0;
            }
        }
        let mut kernel = Self { nx, ny, data };
        kernel.normalize();
        Ok(kernel)
    }

    /// The trivial 1x1 identity kernel (used in tests and as a documented
    /// no-op default).
    pub fn unit() -> Self {
        Self { nx: 1, ny: 1, data: vec![1.0] }
    }
}

/// Convolves every row of `l` with `kernel` (spec.md §4.F), returning the
/// blurred matrix; `image` supplies the `(nx, ny)` raster shape and each
/// cell's `active_index` needed to map `(i, j)` offsets back to L-matrix
/// rows.
pub fn convolve(l: &LMatrix, kernel: &PsfKernel, image: &ImageGrid) -> LMatrix {
    if kernel.nx == 1 && kernel.ny == 1 {
        return l.clone();
    }
    let nx = image.nx();
    let ny = image.ny();
    let half_x = kernel.half_x();
    let half_y = kernel.half_y();

    let rows: Vec<Option<Vec<(usize, Scalar)>>> = (0..nx * ny)
        .into_par_iter()
        .map(|idx| {
            let i = (idx % nx) as i64;
            let j = (idx / nx) as i64;
            image.cell(idx % nx, idx / nx).active_index?;
            let mut acc: HashMap<usize, Scalar> = HashMap::new();
            for oy in -half_y..=half_y {
                let sj = j - oy;
                if sj < 0 || sj >= ny as i64 {
                    continue;
                }
                for ox in -half_x..=half_x {
                    let si = i - ox;
                    if si < 0 || si >= nx as i64 {
                        continue;
                    }
                    let Some(src_idx) = image.cell(si as usize, sj as usize).active_index else {
                        continue;
                    };
                    let weight = kernel.at(ox, oy);
                    if weight == 0.0 {
                        continue;
                    }
                    for &(col, w) in l.row(src_idx) {
                        *acc.entry(col).or_insert(0.0) += weight * w;
                    }
                }
            }
            let mut row: Vec<(usize, Scalar)> = acc.into_iter().collect();
            row.sort_unstable_by_key(|&(c, _)| c);
            Some(row)
        })
        .collect();

    let mut out = LMatrix::new(l.n_rows(), l.n_cols());
    for (idx, row) in rows.into_iter().enumerate() {
        let Some(row) = row else { continue };
        let Some(row_idx) = image.cell(idx % nx, idx / nx).active_index else { continue };
        out.set_row(row_idx, row);
    }
    out
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

    fn active_image_grid(n: usize) -> ImageGrid {
        let mut grid = ImageGrid::new(Rect::new(-1.0, 1.0, -1.0, 1.0), n, n, &Identity, None, false);
        for (idx, cell) in grid.cells_mut().iter_mut().enumerate() {
            cell.active_index = Some(idx);
        }
        grid
    }

    #[test]
    fn unit_kernel_leaves_l_unchanged() {
        let image = active_image_grid(3);
        let mut l = LMatrix::new(9, 4);
        l.set_row(4, vec![(0, 0.5), (1, 0.5)]);
        let kernel = PsfKernel::unit();
        let out = convolve(&l, &kernel, &image);
        assert_eq!(out.row(4), l.row(4));
    }

    #[test]
    fn normalized_kernel_preserves_row_sums() {
        let image = active_image_grid(4);
        let mut l = LMatrix::new(16, 2);
        for i in 0..16 {
            l.set_row(i, vec![(0, 0.5), (1, 0.5)]);
        }
        let kernel = PsfKernel::gaussian(1.0, 1.0, 1.0, 1.0);
        let out = convolve(&l, &kernel, &image);
        // Interior pixel (full footprint available) row sum must be preserved.
        let interior_idx = image.index_of(2, 2);
        let sum: Scalar = out.row(interior_idx).iter().map(|&(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-9, "expected row sum 1.0, got {sum}");
    }

    #[test]
    fn gaussian_kernel_has_odd_dimensions() {
        let kernel = PsfKernel::gaussian(2.0, 0.5, 1.0, 1.0);
        assert_eq!(kernel.nx % 2, 1);
        assert_eq!(kernel.ny % 2, 1);
    }

    #[test]
    fn from_array_rejects_even_dimensions() {
        assert!(matches!(
            PsfKernel::from_array(4, 3, vec![1.0; 12], 0.0),
            Err(ConfigError::EvenPsfDimensions { nx: 4, ny: 3 })
        ));
    }

    #[test]
    fn from_array_rejects_mismatched_data_length() {
        assert!(matches!(
            PsfKernel::from_array(3, 3, vec![1.0; 5], 0.0),
            Err(ConfigError::PsfDataLengthMismatch { expected: 9, actual: 5 })
        ));
    }

    #[test]
    fn from_array_thresholds_and_renormalizes() {
        let k = PsfKernel::from_array(3, 1, vec![0.01, 1.0, 0.01], 0.5).unwrap();
        assert_eq!(k.at(-1, 0), 0.0);
        assert!((k.at(0, 0) - 1.0).abs() < 1e-12);
    }
}
