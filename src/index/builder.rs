//! Offline construction of the point file and its tree index.
//!
//! Points are sorted by their deepest-level trixel id, written out as the
//! point file, and mirrored by a varint tree whose nodes subdivide until a
//! node holds no more than `leafthresh` points. Serialization is bottom-up:
//! child records are encoded first, then each parent's forward offsets are
//! sized by fixpoint iteration (an offset's varint length depends on the
//! lengths of the offsets after it, which only ever grow).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::geom::sphere::normalize;
use crate::htm::{self, MAX_LEVEL};
use crate::index::{DataLayout, Field, FieldKind};
use crate::varint;

/// One catalog point: a direction plus one value per payload field.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub position: [f64; 3],
    pub values: Vec<f64>,
}

/// Build parameters.
pub struct BuildConfig {
    /// Nodes with at most this many points become inline leaves. Raised
    /// automatically when deepest-level trixels hold more.
    pub leafthresh: u64,
    /// Subdivision level of the sort keys; the tree never grows deeper.
    pub level: u32,
    /// Show progress bars (CLI use; tests and library callers leave this off).
    pub progress: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            leafthresh: 64,
            level: MAX_LEVEL,
            progress: false,
        }
    }
}

/// What a build produced.
#[derive(Debug)]
pub struct BuildStats {
    pub count: u64,
    pub leafthresh: u64,
    pub data_bytes: u64,
    pub index_bytes: u64,
}

struct BuildNode {
    index: u64,
    count: u64,
    /// `None` for leaves; absent children hold no points.
    children: Option<[Option<Box<BuildNode>>; 4]>,
}

/// Write the point file and tree index for `points`.
///
/// Entry payloads follow `fields` (every record must carry one value per
/// field); positions are normalized before indexing. The catalog must be
/// non-empty.
pub fn build_files(
    points: &[PointRecord],
    fields: &[Field],
    data_path: &Path,
    index_path: &Path,
    config: &BuildConfig,
) -> Result<BuildStats> {
    if points.is_empty() {
        return Err(Error::InvalidArgument("cannot index an empty catalog".into()));
    }
    if config.level > MAX_LEVEL {
        return Err(Error::Level(config.level));
    }
    for (i, p) in points.iter().enumerate() {
        if p.values.len() != fields.len() {
            return Err(Error::InvalidArgument(format!(
                "point {i} has {} payload values, schema has {}",
                p.values.len(),
                fields.len()
            )));
        }
    }

    let pb = progress_bar(config.progress, points.len() as u64, "computing trixel ids");
    let mut order: Vec<(u64, [f64; 3], usize)> = points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let v = normalize(p.position).ok_or_else(|| {
                Error::InvalidArgument(format!("point {i} has a zero direction vector"))
            })?;
            pb.inc(1);
            Ok((htm::vec_to_id(v, config.level), v, i))
        })
        .collect::<Result<_>>()?;
    pb.finish_and_clear();

    order.par_sort_unstable_by(|a, b| (a.0, a.2).cmp(&(b.0, b.2)));

    // Deepest-level trixels cannot subdivide further, so the leaf threshold
    // must admit the fullest of them.
    let mut longest_run = 1u64;
    let mut run = 1u64;
    for w in order.windows(2) {
        if w[0].0 == w[1].0 {
            run += 1;
            longest_run = longest_run.max(run);
        } else {
            run = 1;
        }
    }
    let leafthresh = config.leafthresh.max(1).max(longest_run);

    let layout = DataLayout::with_fields(fields.to_vec());
    let data_bytes = write_data_file(points, &order, &layout, data_path)?;

    let pb = progress_bar(config.progress, 8, "building tree index");
    let ids: Vec<u64> = order.iter().map(|&(id, _, _)| id).collect();
    let mut root_bufs: Vec<Option<Vec<u8>>> = Vec::with_capacity(8);
    for root in 0..8 {
        let root_id = 8 + root as u64;
        let (base, slice) = id_span(&ids, 0, root_id, 0, config.level);
        if slice.is_empty() {
            root_bufs.push(None);
        } else {
            let node = build_node(slice, base, root_id, 0, config.level, leafthresh);
            root_bufs.push(Some(encode_node(&node)));
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let mut index_buf = Vec::new();
    varint::encode(leafthresh, &mut index_buf);
    varint::encode(order.len() as u64, &mut index_buf);
    encode_with_offsets(&mut index_buf, &root_bufs);

    let mut w = BufWriter::new(File::create(index_path)?);
    w.write_all(&index_buf)?;
    w.flush()?;

    Ok(BuildStats {
        count: order.len() as u64,
        leafthresh,
        data_bytes,
        index_bytes: index_buf.len() as u64,
    })
}

/// Locate the span of sorted `ids` (a sub-slice starting at point index
/// `base`) that falls under the trixel `node_id` at `node_level`.
fn id_span<'a>(
    ids: &'a [u64],
    base: usize,
    node_id: u64,
    node_level: u32,
    level: u32,
) -> (usize, &'a [u64]) {
    let shift = 2 * (level - node_level);
    let lo = node_id << shift;
    let hi = (node_id + 1) << shift;
    let start = ids.partition_point(|&id| id < lo);
    let end = ids.partition_point(|&id| id < hi);
    (base + start, &ids[start..end])
}

fn build_node(
    ids: &[u64],
    base: usize,
    node_id: u64,
    node_level: u32,
    level: u32,
    leafthresh: u64,
) -> BuildNode {
    let count = ids.len() as u64;
    if count <= leafthresh || node_level == level {
        return BuildNode {
            index: base as u64,
            count,
            children: None,
        };
    }
    let mut children: [Option<Box<BuildNode>>; 4] = [None, None, None, None];
    for (c, slot) in children.iter_mut().enumerate() {
        let child_id = (node_id << 2) | c as u64;
        let (child_base, slice) = id_span(ids, base, child_id, node_level + 1, level);
        if !slice.is_empty() {
            *slot = Some(Box::new(build_node(
                slice,
                child_base,
                child_id,
                node_level + 1,
                level,
                leafthresh,
            )));
        }
    }
    BuildNode {
        index: base as u64,
        count,
        children: Some(children),
    }
}

fn encode_node(node: &BuildNode) -> Vec<u8> {
    let mut out = Vec::new();
    varint::encode(node.index, &mut out);
    varint::encode(node.count, &mut out);
    if let Some(children) = &node.children {
        let bufs: Vec<Option<Vec<u8>>> = children
            .iter()
            .map(|c| c.as_deref().map(encode_node))
            .collect();
        encode_with_offsets(&mut out, &bufs);
    }
    out
}

/// Append a block of relative forward offset fields followed by the records
/// they point at. Absent records get offset 0; present ones get
/// `1 + (bytes between the end of the field and the record)`, sized by
/// fixpoint iteration since later fields' lengths feed earlier offsets.
fn encode_with_offsets(out: &mut Vec<u8>, bufs: &[Option<Vec<u8>>]) {
    let n = bufs.len();
    let mut sizes = vec![1usize; n];
    let offset_value = |sizes: &[usize], c: usize| -> u64 {
        let after: usize = sizes[..=c].iter().sum();
        let total: usize = sizes.iter().sum();
        let preceding: usize = bufs[..c].iter().flatten().map(|b| b.len()).sum();
        (total + preceding - after + 1) as u64
    };
    loop {
        let mut changed = false;
        for c in 0..n {
            if bufs[c].is_some() {
                let need = varint::encoded_len(offset_value(&sizes, c));
                if need != sizes[c] {
                    sizes[c] = need;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    for c in 0..n {
        match bufs[c] {
            None => varint::encode(0, out),
            Some(_) => varint::encode(offset_value(&sizes, c), out),
        }
    }
    for b in bufs.iter().flatten() {
        out.extend_from_slice(b);
    }
}

fn write_data_file(
    points: &[PointRecord],
    order: &[(u64, [f64; 3], usize)],
    layout: &DataLayout,
    path: &Path,
) -> Result<u64> {
    let mut header = Vec::new();
    layout.write_header(&mut header)?;
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&header)?;
    for &(_, v, i) in order {
        for coord in v {
            w.write_all(&coord.to_le_bytes())?;
        }
        for (value, field) in points[i].values.iter().zip(&layout.fields) {
            match field.kind {
                FieldKind::Float64 => w.write_all(&value.to_le_bytes())?,
                FieldKind::Int64 => w.write_all(&(*value as i64).to_le_bytes())?,
            }
        }
    }
    w.flush()?;
    Ok(header.len() as u64 + order.len() as u64 * layout.entry_size as u64)
}

fn progress_bar(enabled: bool, len: u64, msg: &'static str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{msg:24} [{bar:30}] {pos}/{len}")
            .unwrap()
            .progress_chars("=> "),
    );
    pb.set_message(msg);
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::sphere::radec_to_xyz;
    use crate::index::Tree;
    use crate::region::{Circle, ConvexPolygon, Ellipse, Region};
    use std::f64::consts::TAU;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("octans_test_{name}_{}.bin", std::process::id()))
    }

    fn bare_points(positions: &[[f64; 3]]) -> Vec<PointRecord> {
        positions
            .iter()
            .map(|&position| PointRecord {
                position,
                values: Vec::new(),
            })
            .collect()
    }

    fn rng_unit_vectors(seed: u64, n: usize) -> Vec<[f64; 3]> {
        let mut state = seed;
        let mut rng = || -> f64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state as f64) / (u64::MAX as f64) * 2.0 - 1.0
        };
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(v) = normalize([rng(), rng(), rng()]) {
                out.push(v);
            }
        }
        out
    }

    /// Build both files, run `check` on the opened tree, then clean up.
    fn with_tree(
        name: &str,
        points: &[PointRecord],
        config: &BuildConfig,
        check: impl FnOnce(&Tree),
    ) {
        let data = temp_path(&format!("{name}_data"));
        let index = temp_path(&format!("{name}_index"));
        let stats = build_files(points, &[], &data, &index, config).unwrap();
        assert_eq!(stats.count, points.len() as u64);
        let tree = Tree::open(&data, Some(&index)).unwrap();
        assert_eq!(tree.count(), points.len() as u64);
        check(&tree);
        std::fs::remove_file(&data).ok();
        std::fs::remove_file(&index).ok();
    }

    #[test]
    fn single_point_tiny_circle() {
        let points = bare_points(&[[1.0, 0.0, 0.0]]);
        with_tree("single", &points, &BuildConfig::default(), |tree| {
            let hit = Circle::new([1.0, 0.0, 0.0], 0.001).unwrap();
            assert_eq!(tree.scan_count(&hit), 1);
            assert_eq!(tree.tree_count(&hit).unwrap(), 1);
            let miss = Circle::new([0.0, 1.0, 0.0], 0.001).unwrap();
            assert_eq!(tree.tree_count(&miss).unwrap(), 0);
        });
    }

    #[test]
    fn equator_points_polar_circle() {
        let positions: Vec<[f64; 3]> = (0..10)
            .map(|k| radec_to_xyz(TAU * k as f64 / 10.0, 0.0))
            .collect();
        let points = bare_points(&positions);
        with_tree("equator", &points, &BuildConfig::default(), |tree| {
            let narrow = Circle::new([0.0, 0.0, 1.0], 89.0).unwrap();
            assert_eq!(tree.scan_count(&narrow), 0);
            assert_eq!(tree.tree_count(&narrow).unwrap(), 0);
            let wide = Circle::new([0.0, 0.0, 1.0], 91.0).unwrap();
            assert_eq!(tree.scan_count(&wide), 10);
            assert_eq!(tree.tree_count(&wide).unwrap(), 10);
        });
    }

    #[test]
    fn tree_count_matches_scan_for_random_catalog() {
        let points = bare_points(&rng_unit_vectors(0xcafe, 1000));
        let config = BuildConfig {
            leafthresh: 8,
            level: 8,
            ..BuildConfig::default()
        };
        with_tree("equivalence", &points, &config, |tree| {
            let regions: Vec<Box<dyn Region>> = vec![
                Box::new(Circle::new(radec_to_xyz(0.5, 0.2), 10.0).unwrap()),
                Box::new(Circle::new([0.0, 0.0, 1.0], 60.0).unwrap()),
                Box::new(Circle::new(radec_to_xyz(3.5, -0.8), 130.0).unwrap()),
                Box::new(
                    Ellipse::from_foci(radec_to_xyz(1.0, 0.1), radec_to_xyz(1.2, 0.2), 15.0)
                        .unwrap(),
                ),
                Box::new(
                    ConvexPolygon::from_radec(&[
                        (-0.5, -0.4),
                        (0.5, -0.4),
                        (0.5, 0.4),
                        (-0.5, 0.4),
                    ])
                    .unwrap(),
                ),
            ];
            for (i, region) in regions.iter().enumerate() {
                let scan = tree.scan_count(region.as_ref());
                let walked = tree.tree_count(region.as_ref()).unwrap();
                assert_eq!(scan, walked, "region {i}: scan {scan} != tree {walked}");
            }
        });
    }

    #[test]
    fn polygon_square_on_thousand_points() {
        // Spherical square centered on the x axis, corners at y, z = +-0.5
        // before normalization.
        let points = bare_points(&rng_unit_vectors(0x1234, 1000));
        let config = BuildConfig {
            leafthresh: 16,
            level: 6,
            ..BuildConfig::default()
        };
        with_tree("square", &points, &config, |tree| {
            let poly = ConvexPolygon::new(&[
                normalize([1.0, -0.5, -0.5]).unwrap(),
                normalize([1.0, 0.5, -0.5]).unwrap(),
                normalize([1.0, 0.5, 0.5]).unwrap(),
                normalize([1.0, -0.5, 0.5]).unwrap(),
            ])
            .unwrap();
            assert_eq!(
                tree.scan_count(&poly),
                tree.tree_count(&poly).unwrap()
            );
        });
    }

    #[test]
    fn full_and_empty_circles() {
        let points = bare_points(&rng_unit_vectors(0xf011, 200));
        with_tree("degenerate", &points, &BuildConfig::default(), |tree| {
            let empty = Circle::new([0.0, 0.0, 1.0], -5.0).unwrap();
            assert_eq!(tree.scan_count(&empty), 0);
            assert_eq!(tree.tree_count(&empty).unwrap(), 0);
            let full = Circle::new([0.0, 0.0, 1.0], 180.0).unwrap();
            assert_eq!(tree.scan_count(&full), 200);
            assert_eq!(tree.tree_count(&full).unwrap(), 200);
        });
    }

    #[test]
    fn visit_reports_matches_in_entry_order() {
        let points = bare_points(&rng_unit_vectors(0x0bde4, 500));
        let config = BuildConfig {
            leafthresh: 4,
            level: 7,
            ..BuildConfig::default()
        };
        with_tree("order", &points, &config, |tree| {
            let circle = Circle::new(radec_to_xyz(2.0, -0.3), 40.0).unwrap();
            let mut visited = Vec::new();
            tree.tree_visit(&circle, |e| visited.push(e.index)).unwrap();
            assert!(visited.windows(2).all(|w| w[0] < w[1]), "out of order");
            let mut scanned = Vec::new();
            tree.scan_visit(&circle, |e| scanned.push(e.index));
            assert_eq!(visited, scanned);
        });
    }

    #[test]
    fn duplicate_positions_force_leaf_threshold() {
        // 50 identical points share one deepest-level trixel; the builder
        // must raise the leaf threshold rather than emit an unsplittable
        // internal node.
        let mut positions = vec![[0.3, 0.4, 0.5]; 50];
        positions.extend(rng_unit_vectors(0xd0d0, 100));
        let points = bare_points(&positions);
        let config = BuildConfig {
            leafthresh: 2,
            level: 10,
            ..BuildConfig::default()
        };
        with_tree("dups", &points, &config, |tree| {
            assert!(tree.leafthresh() >= 50);
            let around = Circle::new([0.3, 0.4, 0.5], 0.01).unwrap();
            assert_eq!(tree.tree_count(&around).unwrap(), 50);
            assert_eq!(tree.scan_count(&around), 50);
        });
    }

    #[test]
    fn payload_fields_survive_roundtrip() {
        let fields = vec![
            Field {
                name: "mag".into(),
                kind: FieldKind::Float64,
            },
            Field {
                name: "source_id".into(),
                kind: FieldKind::Int64,
            },
        ];
        let positions = rng_unit_vectors(0xfee7, 20);
        let points: Vec<PointRecord> = positions
            .iter()
            .enumerate()
            .map(|(i, &position)| PointRecord {
                position,
                values: vec![10.0 + i as f64 / 8.0, i as f64],
            })
            .collect();
        let data = temp_path("fields_data");
        let index = temp_path("fields_index");
        build_files(&points, &fields, &data, &index, &BuildConfig::default()).unwrap();
        let tree = Tree::open(&data, Some(&index)).unwrap();
        assert_eq!(tree.fields(), &fields[..]);

        // Every record carries its magnitude at offset 24 and its id at 32.
        let full = Circle::new([0.0, 0.0, 1.0], 180.0).unwrap();
        let mut seen = 0;
        tree.tree_visit(&full, |e| {
            let mag = f64::from_le_bytes(e.record[24..32].try_into().unwrap());
            let id = i64::from_le_bytes(e.record[32..40].try_into().unwrap());
            assert!((10.0..14.0).contains(&mag));
            assert!((0..20i64).contains(&id));
            seen += 1;
        })
        .unwrap();
        assert_eq!(seen, 20);
        std::fs::remove_file(&data).ok();
        std::fs::remove_file(&index).ok();
    }

    #[test]
    fn scan_fallback_without_index() {
        let positions = rng_unit_vectors(0x5ca9, 300);
        let points = bare_points(&positions);
        let data = temp_path("noindex_data");
        let index = temp_path("noindex_index");
        build_files(&points, &[], &data, &index, &BuildConfig::default()).unwrap();
        let tree = Tree::open(&data, None).unwrap();
        assert!(!tree.has_index());
        let circle = Circle::new(radec_to_xyz(1.0, 0.5), 30.0).unwrap();
        assert_eq!(tree.tree_count(&circle).unwrap(), tree.scan_count(&circle));
        std::fs::remove_file(&data).ok();
        std::fs::remove_file(&index).ok();
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let points = bare_points(&rng_unit_vectors(0xbad, 10));
        let data = temp_path("mismatch_data");
        let index = temp_path("mismatch_index");
        build_files(&points, &[], &data, &index, &BuildConfig::default()).unwrap();
        // Append one extra entry to the data file: derived count no longer
        // matches the index header.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&data).unwrap();
            f.write_all(&[0u8; 24]).unwrap();
        }
        let err = Tree::open(&data, Some(&index)).unwrap_err();
        assert!(
            matches!(err, Error::CorruptIndex(_)),
            "expected CorruptIndex, got {err:?}"
        );
        // The data file alone still opens.
        assert!(Tree::open(&data, None).is_ok());
        std::fs::remove_file(&data).ok();
        std::fs::remove_file(&index).ok();
    }

    #[test]
    fn empty_catalog_is_rejected() {
        let data = temp_path("empty_data");
        let index = temp_path("empty_index");
        let err = build_files(&[], &[], &data, &index, &BuildConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn offset_block_roundtrips_through_reader_convention() {
        // Three records behind a four-slot offset block, one slot absent.
        let bufs = vec![
            Some(vec![0xAA; 3]),
            None,
            Some(vec![0xBB; 200]),
            Some(vec![0xCC; 5]),
        ];
        let mut out = Vec::new();
        encode_with_offsets(&mut out, &bufs);
        // Decode the four offsets and check each lands on its record.
        let mut pos = 0;
        let mut targets = Vec::new();
        for _ in 0..4 {
            let (off, used) = varint::read(&out[pos..]).unwrap();
            pos += used;
            targets.push(if off == 0 {
                None
            } else {
                Some(pos + off as usize - 1)
            });
        }
        assert_eq!(targets[1], None);
        assert_eq!(out[targets[0].unwrap()], 0xAA);
        assert_eq!(out[targets[2].unwrap()], 0xBB);
        assert_eq!(out[targets[3].unwrap()], 0xCC);
        // Records are laid out contiguously after the offsets.
        assert_eq!(targets[0], Some(pos));
        assert_eq!(targets[2], Some(pos + 3));
        assert_eq!(targets[3], Some(pos + 203));
    }
}
