//! Triangle/rectangle geometric predicates and overlap area (spec.md §4.A).
//!
//! The polygon-clip overlap area is a standard Sutherland-Hodgman clip of
//! the triangle against the rectangle's four half-planes; the cheap
//! bounding-box pre-tests (`in_neighborhood`, `overlap`) exist so that the
//! mapping engine (component D) can reject the overwhelming majority of
//! candidate source cells without ever running the clip.

use super::{Quad, Triangle};
use crate::numeric::{Point, Rect, Scalar};

/// Cheap bounding-box test used to prune candidate source cells before any
/// triangle overlap test is attempted (spec.md §4.A).
///
/// Returns `(possible, strictly_inside)`: `possible` is false only when the
/// quad's bounding box and `rect` are disjoint; `strictly_inside` is true
/// when the quad's bounding box lies entirely within `rect`.
pub fn in_neighborhood(quad: &Quad, rect: &Rect) -> (bool, bool) {
    let bbox = quad.bounding_box();
    let disjoint = bbox.xmax < rect.xmin || bbox.xmin > rect.xmax || bbox.ymax < rect.ymin || bbox.ymin > rect.ymax;
    if disjoint {
        return (false, false);
    }
    let strictly_inside =
        bbox.xmin >= rect.xmin && bbox.xmax <= rect.xmax && bbox.ymin >= rect.ymin && bbox.ymax <= rect.ymax;
    (true, strictly_inside)
}

/// Exact triangle/rectangle overlap test via separating axis on the
/// rectangle's two axes plus the triangle's three edge normals.
pub fn overlap(tri: &Triangle, rect: &Rect) -> bool {
    let verts = [tri.0, tri.1, tri.2];

    // Rectangle axes: triangle's bbox must intersect the rectangle.
    let (txmin, txmax) = min_max(verts.iter().map(|p| p.x));
    let (tymin, tymax) = min_max(verts.iter().map(|p| p.y));
    if txmax < rect.xmin || txmin > rect.xmax || tymax < rect.ymin || tymin > rect.ymax {
        return false;
    }

    // Triangle edge normals as separating axes against the rectangle's four corners.
    let rect_corners = [
        Point::new(rect.xmin, rect.ymin),
        Point::new(rect.xmax, rect.ymin),
        Point::new(rect.xmax, rect.ymax),
        Point::new(rect.xmin, rect.ymax),
    ];
    for i in 0..3 {
        let a = verts[i];
        let b = verts[(i + 1) % 3];
        let edge = b - a;
        let normal = Point::new(-edge.y, edge.x);
        let tri_proj: Vec<Scalar> = verts.iter().map(|p| normal.x * (p.x - a.x) + normal.y * (p.y - a.y)).collect();
        let (tmin, tmax) = min_max(tri_proj.into_iter());
        let rect_proj: Vec<Scalar> =
            rect_corners.iter().map(|p| normal.x * (p.x - a.x) + normal.y * (p.y - a.y)).collect();
        let (rmin, rmax) = min_max(rect_proj.into_iter());
        if tmax < rmin || tmin > rmax {
            return false;
        }
    }
    true
}

fn min_max(it: impl Iterator<Item = Scalar>) -> (Scalar, Scalar) {
    it.fold((Scalar::INFINITY, Scalar::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Exact polygon-clip overlap area between a triangle and an axis-aligned
/// rectangle (spec.md §4.A).
pub fn overlap_area(tri: &Triangle, rect: &Rect) -> Scalar {
    let (possible, strictly_inside) = in_neighborhood(
        &Quad::new(tri.0, tri.1, tri.2, tri.2),
        rect,
    );
    if !possible {
        return 0.0;
    }
    if strictly_inside {
        return tri.area();
    }

    let mut poly = vec![tri.0, tri.1, tri.2];
    poly = clip_half_plane(&poly, |p| p.x - rect.xmin, |a, b, t| lerp(a, b, t));
    poly = clip_half_plane(&poly, |p| rect.xmax - p.x, lerp);
    poly = clip_half_plane(&poly, |p| p.y - rect.ymin, lerp);
    poly = clip_half_plane(&poly, |p| rect.ymax - p.y, lerp);
    polygon_area(&poly)
}

fn lerp(a: Point, b: Point, t: Scalar) -> Point {
    Point::new(a.x + t * (b.x - a.x), a.y + t * (b.y - a.y))
}

/// Clips a (convex, CCW-or-CW agnostic) polygon against the half-plane
/// `inside(p) >= 0`, via Sutherland-Hodgman.
fn clip_half_plane(poly: &[Point], inside: impl Fn(Point) -> Scalar, interp: impl Fn(Point, Point, Scalar) -> Point) -> Vec<Point> {
    if poly.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(poly.len() + 1);
    for i in 0..poly.len() {
        let curr = poly[i];
        let prev = poly[(i + poly.len() - 1) % poly.len()];
        let curr_in = inside(curr) >= 0.0;
        let prev_in = inside(prev) >= 0.0;
        if curr_in {
            if !prev_in {
                let t = inside(prev) / (inside(prev) - inside(curr));
                out.push(interp(prev, curr, t));
            }
            out.push(curr);
        } else if prev_in {
            let t = inside(prev) / (inside(prev) - inside(curr));
            out.push(interp(prev, curr, t));
        }
    }
    out
}

fn polygon_area(poly: &[Point]) -> Scalar {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    0.5 * sum.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_rect() -> Rect {
        Rect::new(0.0, 1.0, 0.0, 1.0)
    }

    #[test]
    fn triangle_strictly_inside_matches_own_area() {
        let tri = Triangle(Point::new(0.1, 0.1), Point::new(0.5, 0.1), Point::new(0.1, 0.5));
        assert!((overlap_area(&tri, &unit_rect()) - tri.area()).abs() < 1e-12);
    }

    #[test]
    fn disjoint_triangle_has_zero_overlap() {
        let tri = Triangle(Point::new(2.0, 2.0), Point::new(3.0, 2.0), Point::new(2.0, 3.0));
        assert_eq!(overlap_area(&tri, &unit_rect()), 0.0);
        assert!(!overlap(&tri, &unit_rect()));
    }

    #[test]
    fn triangle_straddling_corner_clips_to_quarter_area() {
        // Right triangle with legs 2 covering the corner (0,0)..(1,1) symmetric region:
        // triangle (-0.5,-0.5),(1.5,-0.5),(-0.5,1.5) fully covers the unit square.
        let tri = Triangle(Point::new(-0.5, -0.5), Point::new(1.5, -0.5), Point::new(-0.5, 1.5));
        let area = overlap_area(&tri, &unit_rect());
        assert!((area - 1.0).abs() < 1e-9, "expected full unit square coverage, got {area}");
    }

    #[test]
    fn half_covering_triangle_clips_to_half_square() {
        // Triangle covering exactly the lower-left half of the unit square via its hypotenuse.
        let tri = Triangle(Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0));
        let area = overlap_area(&tri, &unit_rect());
        assert!((area - 0.5).abs() < 1e-9);
    }
}
