//! Bisection search for the bounding range of first-level cells overlapped by
//! a quad (spec.md §4.B `bisection_search_overlap`), grounded on
//! `original_source/pixelgrid.cpp::SourcePixelGrid::bisection_search_overlap`.
//!
//! The first level is always a uniform `nu0 x nw0` tiling of the domain
//! (later splits only ever subdivide within a first-level cell), so its
//! cell boundaries can be derived directly from grid geometry without
//! walking any tree nodes.

use super::SourceGrid;
use crate::numeric::Rect;

/// An inclusive `[imin, imax] x [jmin, jmax]` range of first-level cell indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingIndices {
    pub imin: usize,
    pub imax: usize,
    pub jmin: usize,
    pub jmax: usize,
}

fn first_level_rect(grid: &SourceGrid, i: usize, j: usize) -> Rect {
    let d = grid.domain();
    let xmin = d.xmin + (i as f64 / grid.nu0 as f64) * d.width();
    let xmax = d.xmin + ((i + 1) as f64 / grid.nu0 as f64) * d.width();
    let ymin = d.ymin + (j as f64 / grid.nw0 as f64) * d.height();
    let ymax = d.ymin + ((j + 1) as f64 / grid.nw0 as f64) * d.height();
    Rect::new(xmin, xmax, ymin, ymax)
}

fn block_rect(grid: &SourceGrid, imin: usize, imax: usize, jmin: usize, jmax: usize) -> Rect {
    let lo = first_level_rect(grid, imin, jmin);
    let hi = first_level_rect(grid, imax, jmax);
    Rect::new(lo.xmin, hi.xmax, lo.ymin, hi.ymax)
}

/// Narrows `[0, nu0-1] x [0, nw0-1]` down to the smallest sub-range of
/// first-level cells whose union bounding box contains `quad_bbox`'s
/// overlap, using repeated quadrant bisection; shifts the dividing lines to
/// 1/3-2/3 positions (and the two mixed combinations) up to four times if
/// the quad straddles the midpoint, per spec.md §4.B, before giving up and
/// returning the best range found so far.
pub fn bisection_search_overlap(grid: &SourceGrid, quad_bbox: Rect) -> Option<BoundingIndices> {
    let mut imin = 0usize;
    let mut imax = grid.nu0 - 1;
    let mut jmin = 0usize;
    let mut jmax = grid.nw0 - 1;

    // Quick reject: no overlap with the whole domain at all.
    let whole = block_rect(grid, imin, imax, jmin, jmax);
    if quad_bbox.xmax < whole.xmin || quad_bbox.xmin > whole.xmax || quad_bbox.ymax < whole.ymin || quad_bbox.ymin > whole.ymax {
        return None;
    }

    let mut reduce_mid = 0u8;
    loop {
        let (imid, jmid) = match reduce_mid {
            0 => ((imax + imin) / 2, (jmax + jmin) / 2),
            1 => ((imax + 2 * imin) / 3, (jmax + 2 * jmin) / 3),
            2 => ((2 * imax + imin) / 3, (2 * jmax + jmin) / 3),
            3 => ((imax + 2 * imin) / 3, (2 * jmax + jmin) / 3),
            4 => ((2 * imax + imin) / 3, (jmax + 2 * jmin) / 3),
            _ => unreachable!(),
        };
        if imid == imin || imid == imax || jmid == jmin || jmid == jmax {
            break;
        }

        // Four quadrants of the current [imin,imax]x[jmin,jmax] block.
        let quadrants = [
            (imin, imid, jmin, jmid),
            (imin, imid, jmid + 1, jmax),
            (imid + 1, imax, jmin, jmid),
            (imid + 1, imax, jmid + 1, jmax),
        ];
        let mut inside_quadrant = [false; 4];
        let mut n_inside = 0;
        for (k, &(qi0, qi1, qj0, qj1)) in quadrants.iter().enumerate() {
            let qrect = block_rect(grid, qi0, qi1, qj0, qj1);
            let overlaps = !(quad_bbox.xmax < qrect.xmin
                || quad_bbox.xmin > qrect.xmax
                || quad_bbox.ymax < qrect.ymin
                || quad_bbox.ymin > qrect.ymax);
            if overlaps {
                inside_quadrant[k] = true;
                n_inside += 1;
            }
        }

        if n_inside == 0 {
            return None;
        }
        if n_inside > 1 {
            if reduce_mid > 0 {
                if reduce_mid < 4 {
                    reduce_mid += 1;
                    continue;
                } else {
                    break;
                }
            } else {
                reduce_mid = 1;
                continue;
            }
        } else if reduce_mid > 0 {
            reduce_mid = 0;
        }

        if inside_quadrant[0] {
            imax = imid;
            jmax = jmid;
        } else if inside_quadrant[1] {
            imax = imid;
            jmin = jmid + 1;
        } else if inside_quadrant[2] {
            imin = imid + 1;
            jmax = jmid;
        } else {
            imin = imid + 1;
            jmin = jmid + 1;
        }
        if imax.saturating_sub(imin) <= 1 || jmax.saturating_sub(jmin) <= 1 {
            break;
        }
    }

    Some(BoundingIndices { imin, imax, jmin, jmax })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::Rect as R;

    #[test]
    fn bbox_fully_outside_domain_returns_none() {
        let grid = SourceGrid::new(R::new(-1.0, 1.0, -1.0, 1.0), 4, 4, 6).unwrap();
        let bbox = R::new(5.0, 6.0, 5.0, 6.0);
        assert!(bisection_search_overlap(&grid, bbox).is_none());
    }

    #[test]
    fn bbox_covering_single_cell_narrows_tightly() {
        let grid = SourceGrid::new(R::new(0.0, 4.0, 0.0, 4.0), 4, 4, 6).unwrap();
        // cell (i=2,j=1) spans x in [2,3], y in [1,2]
        let bbox = R::new(2.1, 2.9, 1.1, 1.9);
        let bi = bisection_search_overlap(&grid, bbox).unwrap();
        assert!(bi.imin <= 2 && bi.imax >= 2);
        assert!(bi.jmin <= 1 && bi.jmax >= 1);
    }
}
