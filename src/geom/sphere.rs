use std::f64::consts::TAU;

/// Convert (RA, Dec) in radians to a unit vector `[x, y, z]`.
pub fn radec_to_xyz(ra: f64, dec: f64) -> [f64; 3] {
    let cos_dec = dec.cos();
    [cos_dec * ra.cos(), cos_dec * ra.sin(), dec.sin()]
}

/// Convert a unit vector to (RA, Dec) in radians.
/// RA is in `[0, 2*pi)`, Dec is in `[-pi/2, pi/2]`.
pub fn xyz_to_radec(xyz: [f64; 3]) -> (f64, f64) {
    let mut ra = f64::atan2(xyz[1], xyz[0]);
    if ra < 0.0 {
        ra += TAU;
    }
    let dec = xyz[2].clamp(-1.0, 1.0).asin();
    (ra, dec)
}

/// Dot product.
#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Cross product `a x b`.
#[inline]
pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Squared chord length `|a - b|^2`; for unit vectors equals `2(1 - a.b)`.
///
/// A monotone proxy for angular distance: a circle of angular radius `r`
/// collects exactly the points with `dist2 <= 4 sin^2(r/2)`.
#[inline]
pub fn dist2(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

/// Normalize to unit length. Returns `None` for the zero vector.
pub fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let n = dot(v, v).sqrt();
    if n == 0.0 || !n.is_finite() {
        return None;
    }
    let inv = 1.0 / n;
    Some([v[0] * inv, v[1] * inv, v[2] * inv])
}

/// Midpoint of two points on the unit sphere (normalized).
pub fn midpoint(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    let mx = a[0] + b[0];
    let my = a[1] + b[1];
    let mz = a[2] + b[2];
    let norm = (mx * mx + my * my + mz * mz).sqrt();
    let inv = 1.0 / norm;
    [mx * inv, my * inv, mz * inv]
}

/// Great-circle angular distance between two unit vectors, in radians.
pub fn angular_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    dot(a, b).clamp(-1.0, 1.0).acos()
}

/// Squared chord distance `4 sin^2(theta/2)` for an angle in radians.
pub fn angle_to_dist2(theta: f64) -> f64 {
    let s = (theta * 0.5).sin();
    4.0 * s * s
}

/// Minimum squared chord distance from `p` to the great-circle arc `a -> b`.
///
/// When the closest point of the full great circle falls within the arc the
/// distance to the circle is used; otherwise the nearer endpoint wins. `a`
/// and `b` must not be parallel or antipodal.
pub fn edge_dist2(p: [f64; 3], a: [f64; 3], b: [f64; 3]) -> f64 {
    let n = cross(a, b);
    let nn = dot(n, n);
    if nn == 0.0 {
        return dist2(p, a).min(dist2(p, b));
    }
    // The in-plane projection of p lies between a and b exactly when both
    // triple products have the orientation of n.
    if dot(cross(a, p), n) >= 0.0 && dot(cross(p, b), n) >= 0.0 {
        let s2 = dot(p, n) * dot(p, n) / nn;
        let c = (1.0 - s2).max(0.0).sqrt();
        2.0 - 2.0 * c
    } else {
        dist2(p, a).min(dist2(p, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    const EPS: f64 = 1e-12;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() < tol,
            "expected {a} ~= {b} (diff = {})",
            (a - b).abs()
        );
    }

    fn assert_vec_close(a: [f64; 3], b: [f64; 3], tol: f64) {
        for i in 0..3 {
            assert_close(a[i], b[i], tol);
        }
    }

    #[test]
    fn roundtrip_radec_xyz() {
        let cases = [
            (0.0, 0.0),
            (PI, 0.0),
            (PI / 4.0, PI / 6.0),
            (3.0 * PI / 2.0, -PI / 4.0),
            (0.0, FRAC_PI_2),
            (0.0, -FRAC_PI_2),
            (1.234, 0.567),
        ];
        for (ra, dec) in cases {
            let xyz = radec_to_xyz(ra, dec);
            let (ra2, dec2) = xyz_to_radec(xyz);
            assert_close(dec, dec2, EPS);
            let dra = ((ra - ra2 + PI) % TAU + TAU) % TAU - PI;
            assert_close(dra, 0.0, EPS);
        }
    }

    #[test]
    fn known_positions() {
        assert_vec_close(radec_to_xyz(0.0, 0.0), [1.0, 0.0, 0.0], EPS);
        assert_vec_close(radec_to_xyz(FRAC_PI_2, 0.0), [0.0, 1.0, 0.0], EPS);
        assert_vec_close(radec_to_xyz(0.0, FRAC_PI_2), [0.0, 0.0, 1.0], EPS);
        assert_vec_close(radec_to_xyz(0.0, -FRAC_PI_2), [0.0, 0.0, -1.0], EPS);
    }

    #[test]
    fn dist2_matches_secant_formula() {
        let a = radec_to_xyz(0.3, -0.2);
        let b = radec_to_xyz(1.1, 0.4);
        assert_close(dist2(a, b), 2.0 * (1.0 - dot(a, b)), EPS);
        assert_close(dist2(a, b), angle_to_dist2(angular_distance(a, b)), 1e-10);

        // Quarter turn: chord^2 = 2. Antipodes: chord^2 = 4.
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        assert_close(dist2(x, y), 2.0, EPS);
        assert_close(dist2(x, [-1.0, 0.0, 0.0]), 4.0, EPS);
    }

    #[test]
    fn angular_distance_known() {
        let a = radec_to_xyz(0.0, 0.0);
        let b = radec_to_xyz(FRAC_PI_2, 0.0);
        assert_close(angular_distance(a, b), FRAC_PI_2, EPS);
        assert_close(angular_distance(a, a), 0.0, EPS);
        let c = radec_to_xyz(PI, 0.0);
        assert_close(angular_distance(a, c), PI, EPS);
    }

    #[test]
    fn midpoint_basic() {
        let a = radec_to_xyz(0.0, 0.0);
        let b = radec_to_xyz(FRAC_PI_2, 0.0);
        let m = midpoint(a, b);
        assert_vec_close(m, radec_to_xyz(PI / 4.0, 0.0), EPS);
        assert_close(dot(m, m).sqrt(), 1.0, EPS);
    }

    #[test]
    fn midpoint_symmetric() {
        let a = radec_to_xyz(0.5, 0.3);
        let b = radec_to_xyz(0.7, -0.1);
        assert_vec_close(midpoint(a, b), midpoint(b, a), EPS);
    }

    #[test]
    fn normalize_rejects_zero() {
        assert!(normalize([0.0, 0.0, 0.0]).is_none());
        let v = normalize([3.0, 0.0, 4.0]).unwrap();
        assert_vec_close(v, [0.6, 0.0, 0.8], EPS);
    }

    #[test]
    fn edge_dist2_interior_closest_point() {
        // Arc along the equator from (1,0,0) to (0,1,0); query above its middle.
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        let p = radec_to_xyz(PI / 4.0, 0.3);
        assert_close(edge_dist2(p, a, b), angle_to_dist2(0.3), 1e-10);
    }

    #[test]
    fn edge_dist2_endpoint_closest_point() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        // Query behind endpoint a, on the equator.
        let p = radec_to_xyz(-0.4, 0.0);
        assert_close(edge_dist2(p, a, b), dist2(p, a), EPS);
    }

    #[test]
    fn edge_dist2_on_arc_is_zero() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        let p = radec_to_xyz(0.7, 0.0);
        assert_close(edge_dist2(p, a, b), 0.0, EPS);
    }
}
