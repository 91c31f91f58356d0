//! Small geometry kernel shared by the tile store and the query engine.
//!
//! Everything in here is a pure function on points. The nav-mesh convention
//! is Y-up; "2D" tests work on the XZ-plane and ignore height.

use bevy::prelude::Vec3;

/// Two points closer than this (squared) are considered the same vertex.
pub const VERTEX_EQUAL_THRESHOLD_SQUARED: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);

const SEGMENT_PARALLEL_EPSILON: f32 = 0.000_000_01;

#[inline]
pub fn next_pow2(mut v: u32) -> u32 {
    v -= 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v + 1
}

#[inline]
pub fn ilog2(mut v: u32) -> u32 {
    let mut r = ((v > 0xffff) as u32) << 4;
    v >>= r;
    let mut shift = ((v > 0xff) as u32) << 3;
    v >>= shift;
    r |= shift;
    shift = ((v > 0xf) as u32) << 2;
    v >>= shift;
    r |= shift;
    shift = ((v > 0x3) as u32) << 1;
    v >>= shift;
    r |= shift;
    r | (v >> 1)
}

/// Signed area of the triangle on the XZ-plane. Negative when `c` lies to
/// the right of the directed edge `a -> b`.
#[inline]
pub fn triangle_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let ab_x = b.x - a.x;
    let ab_z = b.z - a.z;
    let ac_x = c.x - a.x;
    let ac_z = c.z - a.z;
    ac_x * ab_z - ab_x * ac_z
}

#[inline]
pub fn vequal(a: Vec3, b: Vec3) -> bool {
    a.distance_squared(b) < VERTEX_EQUAL_THRESHOLD_SQUARED
}

/// Closest point on triangle `abc` to `p`, via the seven Voronoi regions.
pub fn closest_pt_point_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    // Inside the face region.
    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Height of triangle `abc` at `p`'s XZ location, if `p` projects onto it.
pub fn closest_height_point_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.x * v0.x + v0.z * v0.z;
    let dot01 = v0.x * v1.x + v0.z * v1.z;
    let dot02 = v0.x * v2.x + v0.z * v2.z;
    let dot11 = v1.x * v1.x + v1.z * v1.z;
    let dot12 = v1.x * v2.x + v1.z * v2.z;

    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        Some(a.y + v0.y * u + v1.y * v)
    } else {
        None
    }
}

/// Squared XZ distance from `pt` to segment `p -> q`, and the segment
/// parameter of the closest point.
pub fn distance_pt_seg_sqr_2d(pt: Vec3, p: Vec3, q: Vec3) -> (f32, f32) {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;
    let dx = pt.x - p.x;
    let dz = pt.z - p.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;
    (dx * dx + dz * dz, t)
}

/// Per-edge squared distances and parameters from `pt` to the polygon
/// boundary. Returns whether `pt` is inside the polygon on the XZ-plane.
pub fn distance_pt_poly_edges_sqr(
    pt: Vec3,
    verts: &[Vec3],
    edge_dist: &mut [f32],
    edge_t: &mut [f32],
) -> bool {
    let nv = verts.len();
    let mut inside = false;
    let mut j = nv - 1;
    for i in 0..nv {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > pt.z) != (vj.z > pt.z))
            && (pt.x < (vj.x - vi.x) * (pt.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        let (d, t) = distance_pt_seg_sqr_2d(pt, vj, vi);
        edge_dist[j] = d;
        edge_t[j] = t;
        j = i;
    }
    inside
}

#[inline]
pub fn point_in_polygon(pt: Vec3, verts: &[Vec3]) -> bool {
    let nv = verts.len();
    let mut inside = false;
    let mut j = nv - 1;
    for i in 0..nv {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > pt.z) != (vj.z > pt.z))
            && (pt.x < (vj.x - vi.x) * (pt.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Clips segment `p0 -> p1` against a convex polygon on the XZ-plane.
///
/// Returns `(t_min, t_max, seg_min, seg_max)` where the seg indices name the
/// entry/exit edges, or -1 when the corresponding endpoint lies inside.
pub fn intersect_segment_poly_2d(
    p0: Vec3,
    p1: Vec3,
    verts: &[Vec3],
) -> Option<(f32, f32, i32, i32)> {
    let mut tmin = 0.0;
    let mut tmax = 1.0;
    let mut seg_min = -1;
    let mut seg_max = -1;

    let dir = p1 - p0;
    let nv = verts.len();
    let mut j = nv - 1;
    for i in 0..nv {
        let edge = verts[i] - verts[j];
        let diff = p0 - verts[j];
        let n = edge.z * diff.x - edge.x * diff.z;
        let d = dir.z * edge.x - dir.x * edge.z;
        if d.abs() < SEGMENT_PARALLEL_EPSILON {
            // Nearly parallel to this edge.
            if n < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = n / d;
        if d < 0.0 {
            // Entering across this edge.
            if t > tmin {
                tmin = t;
                seg_min = j as i32;
                if tmin > tmax {
                    return None;
                }
            }
        } else {
            // Leaving across this edge.
            if t < tmax {
                tmax = t;
                seg_max = j as i32;
                if tmax < tmin {
                    return None;
                }
            }
        }
        j = i;
    }

    Some((tmin, tmax, seg_min, seg_max))
}

/// Intersection parameters of segments `ap -> aq` and `bp -> bq` on the
/// XZ-plane, or `None` when they are parallel.
pub fn intersect_seg_seg_2d(ap: Vec3, aq: Vec3, bp: Vec3, bq: Vec3) -> Option<(f32, f32)> {
    let u = aq - ap;
    let v = bq - bp;
    let w = ap - bp;
    let d = u.x * v.z - u.z * v.x;
    if d.abs() < 1e-6 {
        return None;
    }
    let s = (v.x * w.z - v.z * w.x) / d;
    let t = (u.x * w.z - u.z * w.x) / d;
    Some((s, t))
}

fn project_poly_2d(axis: Vec3, verts: &[Vec3]) -> (f32, f32) {
    let mut min = axis.x * verts[0].x + axis.z * verts[0].z;
    let mut max = min;
    for v in &verts[1..] {
        let d = axis.x * v.x + axis.z * v.z;
        min = min.min(d);
        max = max.max(d);
    }
    (min, max)
}

#[inline]
fn overlap_range(amin: f32, amax: f32, bmin: f32, bmax: f32, eps: f32) -> bool {
    !((amin + eps) > bmax || (amax - eps) < bmin)
}

/// Separating-axis overlap test between two convex polygons on the XZ-plane.
pub fn overlap_poly_poly_2d(polya: &[Vec3], polyb: &[Vec3]) -> bool {
    const EPS: f32 = 1e-4;

    for (poly, other) in [(polya, polyb), (polyb, polya)] {
        let nv = poly.len();
        let mut j = nv - 1;
        for i in 0..nv {
            let va = poly[j];
            let vb = poly[i];
            let axis = Vec3::new(vb.z - va.z, 0.0, -(vb.x - va.x));
            let (amin, amax) = project_poly_2d(axis, polya);
            let (bmin, bmax) = project_poly_2d(axis, polyb);
            if !overlap_range(amin, amax, bmin, bmax, EPS) {
                // Found separating axis.
                return false;
            }
            j = i;
        }
    }
    true
}

#[inline]
pub fn overlap_boxes(amin: Vec3, amax: Vec3, bmin: Vec3, bmax: Vec3) -> bool {
    amin.x <= bmax.x
        && amax.x >= bmin.x
        && amin.y <= bmax.y
        && amax.y >= bmin.y
        && amin.z <= bmax.z
        && amax.z >= bmin.z
}

#[inline]
pub fn overlap_quantized_boxes(
    amin: [u16; 3],
    amax: [u16; 3],
    bmin: [u16; 3],
    bmax: [u16; 3],
) -> bool {
    amin[0] <= bmax[0]
        && amax[0] >= bmin[0]
        && amin[1] <= bmax[1]
        && amax[1] >= bmin[1]
        && amin[2] <= bmax[2]
        && amax[2] >= bmin[2]
}

/// Projects a tile-boundary edge onto the boundary plane.
///
/// Sides 0/4 run along the X boundary so the slab axis is Z; sides 2/6 run
/// along the Z boundary so the slab axis is X. The second component is
/// always height.
pub fn calc_slab_end_points(va: Vec3, vb: Vec3, side: u8) -> ([f32; 2], [f32; 2]) {
    if side == 0 || side == 4 {
        if va.z < vb.z {
            ([va.z, va.y], [vb.z, vb.y])
        } else {
            ([vb.z, vb.y], [va.z, va.y])
        }
    } else {
        if va.x < vb.x {
            ([va.x, va.y], [vb.x, vb.y])
        } else {
            ([vb.x, vb.y], [va.x, va.y])
        }
    }
}

/// Overlap test for two boundary-edge slabs: horizontal extents padded by
/// `px`, vertical tolerance `py` (walkable climb). Crossing segments always
/// overlap.
pub fn overlap_slabs(amin: [f32; 2], amax: [f32; 2], bmin: [f32; 2], bmax: [f32; 2], px: f32, py: f32) -> bool {
    let minx = (amin[0] - px).max(bmin[0] - px);
    let maxx = (amax[0] + px).min(bmax[0] + px);
    if minx > maxx {
        return false;
    }

    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    if dmin * dmax < 0.0 {
        return true;
    }

    let thr = (py * 2.0) * (py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_and_log2() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(64), 64);
        assert_eq!(next_pow2(65), 128);
        assert_eq!(ilog2(1), 0);
        assert_eq!(ilog2(2), 1);
        assert_eq!(ilog2(255), 7);
        assert_eq!(ilog2(256), 8);
    }

    #[test]
    fn triangle_area_sign() {
        let a = Vec3::ZERO;
        let b = Vec3::new(1.0, 0.0, 0.0);
        let left = Vec3::new(0.5, 0.0, 1.0);
        let right = Vec3::new(0.5, 0.0, -1.0);
        assert!(triangle_area_2d(a, b, left) < 0.0);
        assert!(triangle_area_2d(a, b, right) > 0.0);
    }

    #[test]
    fn closest_point_regions() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 2.0);

        // Inside projects straight down.
        let p = closest_pt_point_triangle(Vec3::new(0.5, 3.0, 0.5), a, b, c);
        assert!(p.abs_diff_eq(Vec3::new(0.5, 0.0, 0.5), 1e-6));
        // Vertex region.
        let p = closest_pt_point_triangle(Vec3::new(-1.0, 0.0, -1.0), a, b, c);
        assert!(p.abs_diff_eq(a, 1e-6));
        // Edge region.
        let p = closest_pt_point_triangle(Vec3::new(1.0, 0.0, -1.0), a, b, c);
        assert!(p.abs_diff_eq(Vec3::new(1.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn height_interpolation() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 2.0, 0.0);
        let c = Vec3::new(0.0, 2.0, 2.0);

        let h = closest_height_point_triangle(Vec3::new(0.5, 10.0, 0.5), a, b, c).unwrap();
        assert!((h - 1.0).abs() < 1e-5);
        assert!(closest_height_point_triangle(Vec3::new(3.0, 0.0, 3.0), a, b, c).is_none());
    }

    #[test]
    fn point_to_segment() {
        let p = Vec3::new(0.0, 0.0, 0.0);
        let q = Vec3::new(4.0, 0.0, 0.0);
        let (d, t) = distance_pt_seg_sqr_2d(Vec3::new(2.0, 5.0, 3.0), p, q);
        assert!((d - 9.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
        // Clamped to the endpoint.
        let (d, t) = distance_pt_seg_sqr_2d(Vec3::new(-2.0, 0.0, 0.0), p, q);
        assert!((d - 4.0).abs() < 1e-6);
        assert_eq!(t, 0.0);
    }

    fn unit_square() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ]
    }

    #[test]
    fn polygon_containment() {
        let square = unit_square();
        assert!(point_in_polygon(Vec3::new(0.5, 0.0, 0.5), &square));
        assert!(!point_in_polygon(Vec3::new(1.5, 0.0, 0.5), &square));
    }

    #[test]
    fn segment_polygon_clip() {
        let square = unit_square();

        let (tmin, tmax, seg_min, seg_max) = intersect_segment_poly_2d(
            Vec3::new(-1.0, 0.0, 0.5),
            Vec3::new(2.0, 0.0, 0.5),
            &square,
        )
        .unwrap();
        assert!((tmin - 1.0 / 3.0).abs() < 1e-5);
        assert!((tmax - 2.0 / 3.0).abs() < 1e-5);
        assert!(seg_min >= 0 && seg_max >= 0);

        // Fully inside: no exit edge.
        let (_, _, _, seg_max) = intersect_segment_poly_2d(
            Vec3::new(0.4, 0.0, 0.5),
            Vec3::new(0.6, 0.0, 0.5),
            &square,
        )
        .unwrap();
        assert_eq!(seg_max, -1);

        assert!(intersect_segment_poly_2d(
            Vec3::new(-1.0, 0.0, 5.0),
            Vec3::new(2.0, 0.0, 5.0),
            &square,
        )
        .is_none());
    }

    #[test]
    fn poly_poly_overlap() {
        let a = unit_square();
        let b: Vec<Vec3> = a.iter().map(|v| *v + Vec3::new(0.5, 0.0, 0.5)).collect();
        let c: Vec<Vec3> = a.iter().map(|v| *v + Vec3::new(2.0, 0.0, 0.0)).collect();
        assert!(overlap_poly_poly_2d(&a, &b));
        assert!(!overlap_poly_poly_2d(&a, &c));
    }

    #[test]
    fn slab_overlap() {
        // Matching edges on a shared boundary.
        let a = calc_slab_end_points(Vec3::new(8.0, 0.0, 0.0), Vec3::new(8.0, 0.0, 4.0), 0);
        let b = calc_slab_end_points(Vec3::new(8.0, 0.0, 1.0), Vec3::new(8.0, 0.0, 3.0), 4);
        assert!(overlap_slabs(a.0, a.1, b.0, b.1, 0.01, 0.5));

        // Vertically separated edges do not connect.
        let c = calc_slab_end_points(Vec3::new(8.0, 5.0, 0.0), Vec3::new(8.0, 5.0, 4.0), 4);
        assert!(!overlap_slabs(a.0, a.1, c.0, c.1, 0.01, 0.5));
    }
}
