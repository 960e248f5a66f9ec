//! Spherical query regions and their trixel classification.
//!
//! Three region shapes are supported: circles (spherical caps), ellipses and
//! convex polygons. Each can test a single point for membership and classify
//! a whole trixel, which is what drives both the range enumerator and the
//! tree walker. Classification may degrade `Inside` to `Intersect` when
//! containment cannot be proven cheaply; it must never report `Contains` or
//! `Disjoint` unless they are certain.

use crate::error::{Error, Result};
use crate::geom::sphere::{angle_to_dist2, cross, dist2, dot, edge_dist2, normalize};
use crate::htm::Trixel;

/// How a trixel relates to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// No overlap.
    Disjoint,
    /// Partial overlap (or overlap that could not be classified more tightly).
    Intersect,
    /// The trixel lies entirely inside the region.
    Contains,
    /// The region lies entirely inside the trixel.
    Inside,
}

/// A region on the unit sphere that can answer point membership and trixel
/// classification.
pub trait Region {
    fn contains(&self, v: [f64; 3]) -> bool;
    fn classify(&self, trixel: &Trixel) -> Coverage;
}

fn min_edge_dist2(t: &Trixel, p: [f64; 3]) -> f64 {
    let [v0, v1, v2] = t.verts;
    edge_dist2(p, v0, v1)
        .min(edge_dist2(p, v1, v2))
        .min(edge_dist2(p, v2, v0))
}

// ---------------------------------------------------------------------------
// Circle
// ---------------------------------------------------------------------------

/// A spherical cap: center plus squared secant distance `4 sin^2(r/2)`.
///
/// Negative radii give the empty region, radii of 180 degrees or more the
/// whole sphere; both short-circuit in every predicate.
#[derive(Debug, Clone, Copy)]
pub struct Circle {
    center: [f64; 3],
    d2: f64,
}

impl Circle {
    /// Build a circle from a center direction and an angular radius in
    /// degrees. The center is normalized; a zero center is rejected.
    pub fn new(center: [f64; 3], radius_deg: f64) -> Result<Circle> {
        let center = normalize(center)
            .ok_or_else(|| Error::InvalidArgument("circle center is the zero vector".into()))?;
        let d2 = if radius_deg < 0.0 {
            -1.0
        } else if radius_deg >= 180.0 {
            4.0
        } else {
            angle_to_dist2(radius_deg.to_radians())
        };
        Ok(Circle { center, d2 })
    }

    pub fn center(&self) -> [f64; 3] {
        self.center
    }

    /// Squared secant-distance threshold.
    pub fn dist2_threshold(&self) -> f64 {
        self.d2
    }
}

impl Region for Circle {
    fn contains(&self, v: [f64; 3]) -> bool {
        dist2(v, self.center) <= self.d2
    }

    fn classify(&self, t: &Trixel) -> Coverage {
        if self.d2 < 0.0 {
            return Coverage::Disjoint;
        }
        if self.d2 >= 4.0 {
            return Coverage::Contains;
        }
        let nin = t.verts.iter().filter(|&&v| self.contains(v)).count();
        if nin == 3 {
            // Caps up to 90 degrees are convex: vertex containment is enough.
            // Wider caps additionally need the antipodal cap (squared secant
            // radius 4 - d2) to miss the trixel entirely.
            if self.d2 <= 2.0 {
                return Coverage::Contains;
            }
            let anti = [-self.center[0], -self.center[1], -self.center[2]];
            if !t.contains(anti) && min_edge_dist2(t, anti) >= 4.0 - self.d2 {
                return Coverage::Contains;
            }
            return Coverage::Intersect;
        }
        if nin != 0 {
            return Coverage::Intersect;
        }
        // No vertex inside the cap.
        if min_edge_dist2(t, self.center) <= self.d2 {
            return Coverage::Intersect;
        }
        if t.contains(self.center) {
            // Every edge is farther than the radius and the center is in the
            // trixel, so the whole cap is.
            Coverage::Inside
        } else {
            Coverage::Disjoint
        }
    }
}

// ---------------------------------------------------------------------------
// Ellipse
// ---------------------------------------------------------------------------

/// A spherical ellipse: the locus of points whose angular distances to two
/// foci sum to at most twice the semi-major axis.
///
/// Stored as the center, a symmetric quadratic form `Q` with `p' Q p <= 0`
/// on the interior of the center hemisphere, and the secant-squared radius
/// of the bounding circle (the semi-major axis).
#[derive(Debug, Clone, Copy)]
pub struct Ellipse {
    center: [f64; 3],
    // Quadratic form coefficients: q(p) = xx x^2 + yy y^2 + zz z^2
    //                                    + 2 (xy xy + xz xz + yz yz).
    xx: f64,
    yy: f64,
    zz: f64,
    xy: f64,
    xz: f64,
    yz: f64,
    bound_d2: f64,
}

impl Ellipse {
    /// Build an ellipse from its two foci and the semi-major axis angle in
    /// degrees. Requires `0 < major < 90` and a semi-major axis no smaller
    /// than half the focal separation.
    pub fn from_foci(f1: [f64; 3], f2: [f64; 3], major_deg: f64) -> Result<Ellipse> {
        if !(0.0 < major_deg && major_deg < 90.0) {
            return Err(Error::InvalidArgument(format!(
                "ellipse semi-major axis {major_deg} outside (0, 90) degrees"
            )));
        }
        let f1 = normalize(f1)
            .ok_or_else(|| Error::InvalidArgument("ellipse focus is the zero vector".into()))?;
        let f2 = normalize(f2)
            .ok_or_else(|| Error::InvalidArgument("ellipse focus is the zero vector".into()))?;
        let center = normalize([f1[0] + f2[0], f1[1] + f2[1], f1[2] + f2[2]])
            .ok_or_else(|| Error::InvalidArgument("ellipse foci are antipodal".into()))?;

        let cos_gamma = dot(center, f1).clamp(-1.0, 1.0);
        let cos_a = major_deg.to_radians().cos();
        if cos_a > cos_gamma {
            return Err(Error::InvalidArgument(
                "ellipse semi-major axis smaller than half the focal separation".into(),
            ));
        }
        // Semi-minor axis from the right spherical triangle
        // center-focus-covertex: cos a = cos gamma * cos b.
        let cos_b = (cos_a / cos_gamma).clamp(-1.0, 1.0);

        // Principal axes: x' along the foci, y' completing the frame.
        let xa = match normalize([f2[0] - f1[0], f2[1] - f1[1], f2[2] - f1[2]]) {
            Some(v) => v,
            // Coincident foci: a circle, any transverse axis will do.
            None => {
                let pick = if center[0].abs() < 0.9 { [1.0, 0.0, 0.0] } else { [0.0, 1.0, 0.0] };
                normalize(cross(center, pick)).ok_or_else(|| {
                    Error::InvalidArgument("degenerate ellipse orientation".into())
                })?
            }
        };
        let ya = cross(center, xa);

        let sin_a2 = 1.0 - cos_a * cos_a;
        let sin_b2 = 1.0 - cos_b * cos_b;
        if sin_b2 <= 0.0 {
            return Err(Error::InvalidArgument(
                "degenerate ellipse: semi-minor axis is zero".into(),
            ));
        }
        let cot_a2 = cos_a * cos_a / sin_a2;
        let cot_b2 = cos_b * cos_b / sin_b2;

        // Q = cot^2(a) x'x'^T + cot^2(b) y'y'^T - c c^T, expanded once here
        // so that classification never touches trig again.
        let sym = |i: usize, j: usize| {
            cot_a2 * xa[i] * xa[j] + cot_b2 * ya[i] * ya[j] - center[i] * center[j]
        };
        Ok(Ellipse {
            center,
            xx: sym(0, 0),
            yy: sym(1, 1),
            zz: sym(2, 2),
            xy: sym(0, 1),
            xz: sym(0, 2),
            yz: sym(1, 2),
            bound_d2: angle_to_dist2(major_deg.to_radians()),
        })
    }

    pub fn center(&self) -> [f64; 3] {
        self.center
    }

    fn quadratic_form(&self, v: [f64; 3]) -> f64 {
        self.xx * v[0] * v[0]
            + self.yy * v[1] * v[1]
            + self.zz * v[2] * v[2]
            + 2.0 * (self.xy * v[0] * v[1] + self.xz * v[0] * v[2] + self.yz * v[1] * v[2])
    }
}

impl Region for Ellipse {
    fn contains(&self, v: [f64; 3]) -> bool {
        self.quadratic_form(v) <= 0.0 && dot(v, self.center) >= 0.0
    }

    fn classify(&self, t: &Trixel) -> Coverage {
        let nin = t.verts.iter().filter(|&&v| self.contains(v)).count();
        if nin == 3 {
            // The ellipse interior is convex for semi-major axes below 90
            // degrees, so the vertex test settles containment.
            return Coverage::Contains;
        }
        if nin != 0 {
            return Coverage::Intersect;
        }
        // No vertex inside. Fall back to the bounding circle: anything the
        // bounding circle cannot reach, the ellipse cannot either.
        if min_edge_dist2(t, self.center) <= self.bound_d2 {
            return Coverage::Intersect;
        }
        if t.contains(self.center) {
            Coverage::Inside
        } else {
            Coverage::Disjoint
        }
    }
}

// ---------------------------------------------------------------------------
// Convex polygon
// ---------------------------------------------------------------------------

/// A convex spherical polygon: ordered vertices plus precomputed edge-plane
/// normals oriented so the interior is on the positive side of every plane.
#[derive(Debug, Clone)]
pub struct ConvexPolygon {
    verts: Vec<[f64; 3]>,
    edges: Vec<[f64; 3]>,
    center: [f64; 3],
}

impl ConvexPolygon {
    /// Build a polygon from at least three vertices. A uniformly clockwise
    /// winding is reversed automatically; mixed winding (a non-convex chain)
    /// is rejected, as are vertex sets spanning more than a hemisphere.
    pub fn new(verts: &[[f64; 3]]) -> Result<ConvexPolygon> {
        if verts.len() < 3 {
            return Err(Error::InvalidArgument(format!(
                "polygon needs at least 3 vertices, got {}",
                verts.len()
            )));
        }
        let mut verts: Vec<[f64; 3]> = verts
            .iter()
            .map(|&v| {
                normalize(v)
                    .ok_or_else(|| Error::InvalidArgument("polygon vertex is the zero vector".into()))
            })
            .collect::<Result<_>>()?;

        let orientation = |vs: &[[f64; 3]]| -> i32 {
            let n = vs.len();
            let mut sign = 0;
            for i in 0..n {
                let s = dot(cross(vs[i], vs[(i + 1) % n]), vs[(i + 2) % n]);
                if s > 0.0 {
                    if sign < 0 {
                        return 0;
                    }
                    sign = 1;
                } else if s < 0.0 {
                    if sign > 0 {
                        return 0;
                    }
                    sign = -1;
                }
            }
            sign
        };
        match orientation(&verts) {
            1 => {}
            -1 => verts.reverse(),
            _ => {
                return Err(Error::InvalidArgument(
                    "polygon is not convex with a consistent winding".into(),
                ));
            }
        }

        let n = verts.len();
        let mut edges = Vec::with_capacity(n);
        for i in 0..n {
            let e = normalize(cross(verts[i], verts[(i + 1) % n])).ok_or_else(|| {
                Error::InvalidArgument("polygon has coincident or antipodal neighbors".into())
            })?;
            edges.push(e);
        }

        let sum = verts.iter().fold([0.0; 3], |acc, v| {
            [acc[0] + v[0], acc[1] + v[1], acc[2] + v[2]]
        });
        let center = normalize(sum)
            .ok_or_else(|| Error::InvalidArgument("polygon vertices have no mean direction".into()))?;
        if verts.iter().any(|&v| dot(v, center) <= 0.0) {
            return Err(Error::InvalidArgument(
                "polygon spans more than a hemisphere".into(),
            ));
        }

        Ok(ConvexPolygon { verts, edges, center })
    }

    /// Build a polygon from (RA, Dec) pairs in radians.
    pub fn from_radec(coords: &[(f64, f64)]) -> Result<ConvexPolygon> {
        let verts: Vec<[f64; 3]> = coords
            .iter()
            .map(|&(ra, dec)| crate::geom::sphere::radec_to_xyz(ra, dec))
            .collect();
        ConvexPolygon::new(&verts)
    }

    pub fn verts(&self) -> &[[f64; 3]] {
        &self.verts
    }

    pub fn center(&self) -> [f64; 3] {
        self.center
    }
}

/// Clip a spherical polygon against the half-space `dot(n, p) >= 0`
/// (Sutherland-Hodgman, with great-circle edges).
fn clip_halfspace(points: &[[f64; 3]], n: [f64; 3]) -> Vec<[f64; 3]> {
    let mut out = Vec::with_capacity(points.len() + 1);
    let len = points.len();
    for i in 0..len {
        let cur = points[i];
        let next = points[(i + 1) % len];
        let dc = dot(n, cur);
        let dn = dot(n, next);
        if dc >= 0.0 {
            out.push(cur);
        }
        if (dc >= 0.0) != (dn >= 0.0) {
            // Crossing point: on the clip plane, between cur and next.
            let w = if dc < 0.0 {
                [
                    cur[0] * dn - next[0] * dc,
                    cur[1] * dn - next[1] * dc,
                    cur[2] * dn - next[2] * dc,
                ]
            } else {
                [
                    next[0] * dc - cur[0] * dn,
                    next[1] * dc - cur[1] * dn,
                    next[2] * dc - cur[2] * dn,
                ]
            };
            if let Some(w) = normalize(w) {
                out.push(w);
            }
        }
    }
    out
}

impl Region for ConvexPolygon {
    fn contains(&self, v: [f64; 3]) -> bool {
        self.edges.iter().all(|&e| dot(e, v) >= 0.0)
    }

    fn classify(&self, t: &Trixel) -> Coverage {
        let nin = t.verts.iter().filter(|&&v| self.contains(v)).count();
        if nin == 3 {
            // Convexity: geodesics between contained vertices stay inside.
            return Coverage::Contains;
        }
        if nin != 0 {
            return Coverage::Intersect;
        }
        // No trixel vertex inside the polygon. If every polygon vertex sits
        // in the trixel, the convex hull does too.
        if self.verts.iter().all(|&v| t.contains(v)) {
            return Coverage::Inside;
        }
        // Clip the trixel against the polygon's edge planes; an empty result
        // means no overlap.
        let mut clipped: Vec<[f64; 3]> = t.verts.to_vec();
        for &e in &self.edges {
            clipped = clip_halfspace(&clipped, e);
            if clipped.is_empty() {
                return Coverage::Disjoint;
            }
        }
        Coverage::Intersect
    }
}
