//! Hierarchical Triangular Mesh: a recursive decomposition of the unit
//! sphere into spherical triangles (trixels).
//!
//! Eight root trixels come from projecting an octahedron onto the sphere,
//! four in the southern hemisphere (S0..S3, ids 8..11) and four in the
//! northern (N0..N3, ids 12..15). Subdividing a trixel at its edge midpoints
//! yields four children; the child id is `parent * 4 + {0, 1, 2, 3}`, so
//! trixels at level `L` occupy ids `[8 << 2L, 16 << 2L)` and the id encodes
//! the full descent path from its root.

pub mod cover;

use crate::geom::sphere::{cross, dot, midpoint};

/// Deepest supported subdivision level.
pub const MAX_LEVEL: u32 = 20;

/// Number of root trixels.
pub const NROOTS: u64 = 8;

const X: [f64; 3] = [1.0, 0.0, 0.0];
const Y: [f64; 3] = [0.0, 1.0, 0.0];
const Z: [f64; 3] = [0.0, 0.0, 1.0];
const NX: [f64; 3] = [-1.0, 0.0, 0.0];
const NY: [f64; 3] = [0.0, -1.0, 0.0];
const NZ: [f64; 3] = [0.0, 0.0, -1.0];

/// Root trixel vertices, in root order S0..S3, N0..N3. Each triple is
/// positively oriented (counterclockwise seen from outside the sphere).
const ROOT_VERTS: [[[f64; 3]; 3]; 8] = [
    [X, NZ, Y],   // S0
    [Y, NZ, NX],  // S1
    [NX, NZ, NY], // S2
    [NY, NZ, X],  // S3
    [X, Z, NY],   // N0
    [NY, Z, NX],  // N1
    [NX, Z, Y],   // N2
    [Y, Z, X],    // N3
];

/// A single HTM triangle: its id and three unit vertices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trixel {
    pub id: u64,
    pub verts: [[f64; 3]; 3],
}

impl Trixel {
    /// The root trixel with the given index (0..8).
    pub fn root(root: usize) -> Trixel {
        Trixel {
            id: NROOTS + root as u64,
            verts: ROOT_VERTS[root],
        }
    }

    /// Reconstruct a trixel from its id by replaying the descent path.
    /// Returns `None` for ids that do not name a trixel.
    pub fn from_id(id: u64) -> Option<Trixel> {
        let level = level(id)?;
        let root = ((id >> (2 * level)) - NROOTS) as usize;
        let mut t = Trixel::root(root);
        for k in (0..level).rev() {
            let child = ((id >> (2 * k)) & 3) as usize;
            t = t.children()[child];
        }
        Some(t)
    }

    /// Whether `p` lies in this (closed) trixel: on the positive side of all
    /// three edge planes.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        let [v0, v1, v2] = self.verts;
        dot(cross(v0, v1), p) >= 0.0
            && dot(cross(v1, v2), p) >= 0.0
            && dot(cross(v2, v0), p) >= 0.0
    }

    /// The four children produced by subdividing at the edge midpoints.
    /// Child order matches the id encoding: corner children at the original
    /// vertices first, the central (midpoint) child last.
    pub fn children(&self) -> [Trixel; 4] {
        let [v0, v1, v2] = self.verts;
        let m0 = midpoint(v1, v2);
        let m1 = midpoint(v2, v0);
        let m2 = midpoint(v0, v1);
        let id = self.id << 2;
        [
            Trixel { id, verts: [v0, m2, m1] },
            Trixel { id: id | 1, verts: [v1, m0, m2] },
            Trixel { id: id | 2, verts: [v2, m1, m0] },
            Trixel { id: id | 3, verts: [m0, m1, m2] },
        ]
    }
}

/// Subdivision level of an id, or `None` if the id is not a valid trixel id.
///
/// Valid ids have an even bit length of at least 4: the four root bits plus
/// two bits per level.
pub fn level(id: u64) -> Option<u32> {
    if id < NROOTS {
        return None;
    }
    let bits = 64 - id.leading_zeros();
    if bits % 2 != 0 {
        return None;
    }
    let l = (bits - 4) / 2;
    (l <= MAX_LEVEL).then_some(l)
}

/// Map a unit vector to the id of the level-`level` trixel containing it.
///
/// Finds the containing root, then descends by midpoint subdivision. Points
/// on shared edges resolve to the first matching child in id order, so the
/// mapping is total and deterministic.
pub fn vec_to_id(v: [f64; 3], level: u32) -> u64 {
    debug_assert!(level <= MAX_LEVEL);
    let mut t = (0..8)
        .map(Trixel::root)
        .find(|t| t.contains(v))
        .unwrap_or_else(|| Trixel::root(0));
    for _ in 0..level {
        let children = t.children();
        t = children[..3]
            .iter()
            .copied()
            .find(|c| c.contains(v))
            .unwrap_or(children[3]);
    }
    t.id
}

/// Smallest id at `level`.
pub fn first_id(level: u32) -> u64 {
    NROOTS << (2 * level)
}

/// Largest id at `level`.
pub fn last_id(level: u32) -> u64 {
    (2 * NROOTS << (2 * level)) - 1
}
