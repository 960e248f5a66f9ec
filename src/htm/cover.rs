//! Region-to-id-range enumeration.
//!
//! Converts a spherical region into a short sorted list of trixel-id ranges
//! at a target level, by depth-first descent over the HTM tree. When the
//! list would exceed a caller-supplied cap, the enumerator coarsens: it
//! lowers the effective subdivision level, rounds existing ranges out to the
//! coarser grain, and stops descending past it. The result is always a
//! superset cover of the region, never a subset.

use crate::error::{Error, Result};
use crate::geom::sphere::midpoint;
use crate::htm::{MAX_LEVEL, Trixel};
use crate::region::{Coverage, Region};

/// A closed range of trixel ids `[lo, hi]` at the enumeration level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub lo: u64,
    pub hi: u64,
}

/// Sorted, coalesced list of id ranges. Appends must be in ascending order;
/// adjacent and overlapping ranges merge on the fly.
#[derive(Debug, Default)]
struct IdList {
    ranges: Vec<IdRange>,
}

impl IdList {
    fn add(&mut self, lo: u64, hi: u64) {
        if let Some(last) = self.ranges.last_mut()
            && lo <= last.hi + 1
        {
            last.hi = last.hi.max(hi);
            return;
        }
        self.ranges.push(IdRange { lo, hi });
    }

    /// Round every range outward to level boundaries `grain` levels coarser
    /// than the enumeration level, then re-merge. Each endpoint stays an id
    /// at the enumeration level; only its low `2 * grain` bits are forced to
    /// all-zeros (lo) or all-ones (hi).
    fn simplify(&mut self, grain: u32) {
        if grain == 0 || self.ranges.is_empty() {
            return;
        }
        let mask = (1u64 << (2 * grain)) - 1;
        let mut merged: Vec<IdRange> = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            let lo = r.lo & !mask;
            let hi = r.hi | mask;
            if let Some(last) = merged.last_mut()
                && lo <= last.hi + 1
            {
                last.hi = last.hi.max(hi);
            } else {
                merged.push(IdRange { lo, hi });
            }
        }
        self.ranges = merged;
    }

    fn len(&self) -> usize {
        self.ranges.len()
    }

    fn into_vec(self) -> Vec<IdRange> {
        self.ranges
    }
}

/// One level of the descent stack: the trixel being visited, its midpoints
/// (filled in when the first child is generated) and the next child to try.
#[derive(Clone, Copy)]
struct PathNode {
    verts: [[f64; 3]; 3],
    mids: [[f64; 3]; 3],
    child: u8,
    id: u64,
}

impl PathNode {
    fn from_root(root: usize) -> PathNode {
        let t = Trixel::root(root);
        PathNode {
            verts: t.verts,
            mids: [[0.0; 3]; 3],
            child: 0,
            id: t.id,
        }
    }

    fn trixel(&self) -> Trixel {
        Trixel {
            id: self.id,
            verts: self.verts,
        }
    }

    fn compute_mids(&mut self) {
        let [v0, v1, v2] = self.verts;
        self.mids = [midpoint(v1, v2), midpoint(v2, v0), midpoint(v0, v1)];
    }

    /// Child `c`, using this node's already-computed midpoints.
    fn make_child(&self, c: u8) -> PathNode {
        let [v0, v1, v2] = self.verts;
        let [m0, m1, m2] = self.mids;
        let verts = match c {
            0 => [v0, m2, m1],
            1 => [v1, m0, m2],
            2 => [v2, m1, m0],
            _ => [m0, m1, m2],
        };
        PathNode {
            verts,
            mids: [[0.0; 3]; 3],
            child: 0,
            id: (self.id << 2) | u64::from(c),
        }
    }
}

/// Enumerate id ranges at `level` covering `region`, keeping the list at or
/// under `maxranges` entries by adaptive coarsening (a single range is always
/// allowed, whatever the cap).
///
/// Every point of the region is covered by the result; the overshoot is
/// bounded by one trixel at the coarsest effective level reached.
pub fn cover<R: Region + ?Sized>(
    region: &R,
    level: u32,
    maxranges: usize,
) -> Result<Vec<IdRange>> {
    if level > MAX_LEVEL {
        return Err(Error::Level(level));
    }
    let mut list = IdList::default();
    let mut eff = level;

    let mut stack = [PathNode::from_root(0); (MAX_LEVEL + 1) as usize];
    'roots: for root in 0..8 {
        stack[0] = PathNode::from_root(root);
        // depth == -1 signals an exhausted root.
        let mut depth: i32 = 0;
        let mut last_root = false;

        loop {
            let d = depth as usize;
            let du32 = depth as u32;
            let cov = region.classify(&stack[d].trixel());

            let mut emit = false;
            match cov {
                Coverage::Contains => {
                    // Trixel fully inside the region: emit its whole range.
                    emit = true;
                }
                Coverage::Inside | Coverage::Intersect => {
                    if cov == Coverage::Inside {
                        // Region fully inside this trixel: no sibling (or
                        // other root) can contribute anything.
                        if d == 0 {
                            last_root = true;
                        } else {
                            stack[d - 1].child = 4;
                        }
                    }
                    if du32 < eff {
                        stack[d].compute_mids();
                        stack[d + 1] = stack[d].make_child(0);
                        stack[d].child = 1;
                        depth += 1;
                        continue;
                    }
                    emit = true;
                }
                Coverage::Disjoint => {}
            }

            if emit {
                let shift = 2 * (level - du32);
                let lo = stack[d].id << shift;
                list.add(lo, lo + (1u64 << shift) - 1);
                while list.len() > maxranges && eff > 0 {
                    // Too many ranges: coarsen and pop above the new level.
                    eff -= 1;
                    if depth as u32 > eff {
                        depth = eff as i32;
                    }
                    list.simplify(level - eff);
                }
            }

            // Ascend to the nearest ancestor with an unvisited child.
            depth -= 1;
            while depth >= 0 && stack[depth as usize].child == 4 {
                depth -= 1;
            }
            if depth < 0 {
                break;
            }
            let d = depth as usize;
            let c = stack[d].child;
            stack[d + 1] = stack[d].make_child(c);
            stack[d].child = c + 1;
            depth += 1;
        }

        if last_root {
            break 'roots;
        }
    }
    Ok(list.into_vec())
}

/// Enumerate ranges for a circle, handling the degenerate radii without a
/// descent: an empty region yields an empty list, the full sphere a single
/// range spanning all eight roots.
pub fn circle_cover(
    circle: &crate::region::Circle,
    level: u32,
    maxranges: usize,
) -> Result<Vec<IdRange>> {
    if level > MAX_LEVEL {
        return Err(Error::Level(level));
    }
    let d2 = circle.dist2_threshold();
    if d2 < 0.0 {
        return Ok(Vec::new());
    }
    if d2 >= 4.0 {
        return Ok(vec![IdRange {
            lo: crate::htm::first_id(level),
            hi: crate::htm::last_id(level),
        }]);
    }
    cover(circle, level, maxranges)
}
