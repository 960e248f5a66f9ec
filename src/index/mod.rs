//! Memory-mapped catalog access: the point file, the optional tree index,
//! and the containment queries that consult them.
//!
//! Both files are mapped read-only once at open and never written. The point
//! file is a flat array of fixed-size entries whose first three
//! little-endian doubles are the unit-vector position; the tree index is a
//! varint-encoded HTM tree of forward-only byte offsets (see
//! [`builder`](crate::index::builder) for the writer). A `Tree` owns both
//! mappings; queries borrow from it and may run concurrently.

pub mod builder;

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::htm::Trixel;
use crate::region::{Coverage, Region};
use crate::varint;

const MAGIC: &[u8; 4] = b"OCTN";
const LAYOUT_VERSION: u32 = 1;

/// Size of the mandatory position prefix: three doubles.
pub const POSITION_SIZE: usize = 24;

/// Payload field type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float64,
    Int64,
}

/// One named payload column of a catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

/// Physical layout of the point file: an optional header to skip, the entry
/// stride, and the payload schema following the position prefix.
#[derive(Debug, Clone)]
pub struct DataLayout {
    /// Bytes to skip before the entry array begins.
    pub offset: u64,
    /// Size of one entry in bytes; at least [`POSITION_SIZE`].
    pub entry_size: usize,
    /// Payload columns stored after the position, eight bytes each.
    pub fields: Vec<Field>,
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout {
            offset: 0,
            entry_size: POSITION_SIZE,
            fields: Vec::new(),
        }
    }
}

impl DataLayout {
    /// Layout for entries of position plus the given payload fields.
    pub fn with_fields(fields: Vec<Field>) -> DataLayout {
        DataLayout {
            offset: 0,
            entry_size: POSITION_SIZE + 8 * fields.len(),
            fields,
        }
    }

    /// Serialize the self-describing file header. The number of bytes
    /// written equals the `offset` a reader will discover.
    pub fn write_header(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&LAYOUT_VERSION.to_le_bytes())?;
        w.write_all(&(self.entry_size as u32).to_le_bytes())?;
        w.write_all(&(self.fields.len() as u32).to_le_bytes())?;
        for field in &self.fields {
            let tag: u8 = match field.kind {
                FieldKind::Float64 => 0,
                FieldKind::Int64 => 1,
            };
            w.write_all(&[tag])?;
            w.write_all(&(field.name.len() as u16).to_le_bytes())?;
            w.write_all(field.name.as_bytes())?;
        }
        Ok(())
    }

    /// Recognize a self-describing header at the start of `buf`. Returns
    /// `None` when the magic is absent (a bare, headerless point file).
    pub fn parse(buf: &[u8]) -> Result<Option<DataLayout>> {
        if buf.len() < 4 || &buf[..4] != MAGIC {
            return Ok(None);
        }
        let corrupt = || Error::CorruptIndex("truncated data file header".into());
        let mut pos = 4;
        let read_u32 = |pos: &mut usize| -> Result<u32> {
            let bytes: [u8; 4] = buf
                .get(*pos..*pos + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(corrupt)?;
            *pos += 4;
            Ok(u32::from_le_bytes(bytes))
        };
        let version = read_u32(&mut pos)?;
        if version != LAYOUT_VERSION {
            return Err(Error::CorruptIndex(format!(
                "unsupported data file version {version}"
            )));
        }
        let entry_size = read_u32(&mut pos)? as usize;
        let nfields = read_u32(&mut pos)? as usize;
        let mut fields = Vec::with_capacity(nfields);
        for _ in 0..nfields {
            let tag = *buf.get(pos).ok_or_else(corrupt)?;
            pos += 1;
            let kind = match tag {
                0 => FieldKind::Float64,
                1 => FieldKind::Int64,
                _ => {
                    return Err(Error::CorruptIndex(format!(
                        "unknown field kind tag {tag}"
                    )));
                }
            };
            let len_bytes: [u8; 2] = buf
                .get(pos..pos + 2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(corrupt)?;
            pos += 2;
            let len = u16::from_le_bytes(len_bytes) as usize;
            let name = std::str::from_utf8(buf.get(pos..pos + len).ok_or_else(corrupt)?)
                .map_err(|_| Error::CorruptIndex("field name is not UTF-8".into()))?
                .to_string();
            pos += len;
            fields.push(Field { name, kind });
        }
        Ok(Some(DataLayout {
            offset: pos as u64,
            entry_size,
            fields,
        }))
    }
}

/// A single catalog entry handed to visit callbacks: its index in the point
/// array, its decoded position, and the raw record bytes (position prefix
/// included; interpret the rest via [`Tree::fields`]).
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub index: u64,
    pub position: [f64; 3],
    pub record: &'a [u8],
}

/// A parsed on-disk tree node. Internal nodes carry the byte positions of
/// their present children; leaves inline their points.
#[derive(Debug, Clone, Copy)]
struct DiskNode {
    index: u64,
    count: u64,
    children: Option<[Option<usize>; 4]>,
}

fn read_varint_at(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    if pos >= buf.len() {
        return Err(Error::CorruptIndex("offset beyond end of index".into()));
    }
    let (value, used) = varint::read(&buf[pos..])?;
    Ok((value, pos + used))
}

/// Resolve a relative forward offset field: `0` is absent, otherwise the
/// target starts `off - 1` bytes after the end of the field.
fn resolve_offset(buf: &[u8], off: u64, after: usize) -> Result<Option<usize>> {
    if off == 0 {
        return Ok(None);
    }
    let target = (after as u64)
        .checked_add(off - 1)
        .filter(|&t| t < buf.len() as u64)
        .ok_or_else(|| Error::CorruptIndex("offset beyond end of index".into()))?;
    Ok(Some(target as usize))
}

/// An opened catalog: the mmap'd point file, the optional mmap'd tree index,
/// and the parsed header. Read-only after construction; safe to share
/// between threads.
#[derive(Debug)]
pub struct Tree {
    data: Mmap,
    index: Option<Mmap>,
    layout: DataLayout,
    leafthresh: u64,
    count: u64,
    roots: [Option<usize>; 8],
}

impl Tree {
    /// Open a point file (and optionally its tree index), discovering the
    /// data layout from the file's own header when it has one.
    pub fn open(data_path: &Path, index_path: Option<&Path>) -> Result<Tree> {
        let data = map_readonly(data_path)?;
        let layout = DataLayout::parse(&data)?.unwrap_or_default();
        Tree::from_parts(data, layout, index_path)
    }

    /// Open with an externally supplied layout (for point files produced by
    /// another ingest, where the schema lives elsewhere).
    pub fn open_with_layout(
        data_path: &Path,
        index_path: Option<&Path>,
        layout: DataLayout,
    ) -> Result<Tree> {
        let data = map_readonly(data_path)?;
        Tree::from_parts(data, layout, index_path)
    }

    fn from_parts(data: Mmap, layout: DataLayout, index_path: Option<&Path>) -> Result<Tree> {
        if layout.entry_size < POSITION_SIZE {
            return Err(Error::InvalidArgument(format!(
                "entry size {} smaller than a position record",
                layout.entry_size
            )));
        }
        let datasize = (data.len() as u64)
            .checked_sub(layout.offset)
            .ok_or_else(|| {
                Error::InvalidArgument("data header longer than the file".into())
            })?;
        if datasize == 0 || datasize % layout.entry_size as u64 != 0 {
            return Err(Error::InvalidArgument(format!(
                "data size {datasize} is not a positive multiple of entry size {}",
                layout.entry_size
            )));
        }
        let count = datasize / layout.entry_size as u64;

        let mut tree = Tree {
            data,
            index: None,
            layout,
            leafthresh: 0,
            count,
            roots: [None; 8],
        };
        if let Some(path) = index_path {
            let index = map_readonly(path)?;
            let (leafthresh, header_count) = tree.parse_index_header(&index)?;
            if header_count != count {
                return Err(Error::CorruptIndex(format!(
                    "index says {header_count} points, data file holds {count}"
                )));
            }
            tree.leafthresh = leafthresh;
            tree.index = Some(index);
        }
        Ok(tree)
    }

    /// Parse `leafthresh`, `count` and the eight root offsets, filling
    /// `self.roots`.
    fn parse_index_header(&mut self, index: &Mmap) -> Result<(u64, u64)> {
        let buf: &[u8] = index;
        let (leafthresh, pos) = read_varint_at(buf, 0)?;
        let (count, mut pos) = read_varint_at(buf, pos)?;
        for root in 0..8 {
            let (off, after) = read_varint_at(buf, pos)?;
            self.roots[root] = resolve_offset(buf, off, after)?;
            pos = after;
        }
        Ok((leafthresh, count))
    }

    /// Pin the index mapping into resident memory, and the data mapping too
    /// when it is no larger than `datathresh` bytes. Stabilizes latency for
    /// small catalogs.
    pub fn lock(&self, datathresh: usize) -> Result<()> {
        if let Some(index) = &self.index {
            index.lock()?;
        }
        if self.data.len() <= datathresh {
            self.data.lock()?;
        }
        Ok(())
    }

    /// Number of catalog entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether a tree index is attached (otherwise queries scan).
    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Leaf threshold recorded in the index header.
    pub fn leafthresh(&self) -> u64 {
        self.leafthresh
    }

    /// Payload schema of the entries.
    pub fn fields(&self) -> &[Field] {
        &self.layout.fields
    }

    /// Raw bytes of entry `i`. Panics if `i >= count()`.
    pub fn entry(&self, i: u64) -> &[u8] {
        assert!(i < self.count, "entry index out of range");
        let start = self.layout.offset as usize + i as usize * self.layout.entry_size;
        &self.data[start..start + self.layout.entry_size]
    }

    /// Unit-vector position of entry `i`.
    pub fn position(&self, i: u64) -> [f64; 3] {
        let rec = self.entry(i);
        let mut p = [0.0; 3];
        for (k, out) in p.iter_mut().enumerate() {
            let bytes: [u8; 8] = rec[8 * k..8 * k + 8].try_into().unwrap();
            *out = f64::from_le_bytes(bytes);
        }
        p
    }

    fn make_entry(&self, i: u64) -> Entry<'_> {
        Entry {
            index: i,
            position: self.position(i),
            record: self.entry(i),
        }
    }

    /// Count matches by testing every entry. The reference implementation;
    /// also what small catalogs without an index use.
    pub fn scan_count<R: Region + ?Sized>(&self, region: &R) -> u64 {
        (0..self.count)
            .filter(|&i| region.contains(self.position(i)))
            .count() as u64
    }

    /// Invoke `f` for every matching entry, in entry order.
    pub fn scan_visit<R, F>(&self, region: &R, mut f: F)
    where
        R: Region + ?Sized,
        F: FnMut(Entry<'_>),
    {
        for i in 0..self.count {
            if region.contains(self.position(i)) {
                f(self.make_entry(i));
            }
        }
    }

    /// Count matches using the tree index, falling back to a linear scan
    /// when none is attached.
    pub fn tree_count<R: Region + ?Sized>(&self, region: &R) -> Result<u64> {
        let Some(index) = &self.index else {
            return Ok(self.scan_count(region));
        };
        let mut total = 0;
        for root in 0..8 {
            if let Some(pos) = self.roots[root] {
                let (n, consumed) = self.count_node(index, region, pos, &Trixel::root(root))?;
                total += n;
                if consumed {
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Invoke `f` for every matching entry, using the tree index when one is
    /// attached. Matches arrive in depth-first child-order traversal order,
    /// which for an indexed catalog is ascending entry order.
    pub fn tree_visit<R, F>(&self, region: &R, mut f: F) -> Result<()>
    where
        R: Region + ?Sized,
        F: FnMut(Entry<'_>),
    {
        let Some(index) = &self.index else {
            self.scan_visit(region, f);
            return Ok(());
        };
        for root in 0..8 {
            if let Some(pos) = self.roots[root]
                && self.visit_node(index, region, pos, &Trixel::root(root), &mut f)?
            {
                break;
            }
        }
        Ok(())
    }

    /// Read the node record at `pos`, validating its point span.
    fn read_node(&self, buf: &[u8], pos: usize) -> Result<DiskNode> {
        let (index, pos) = read_varint_at(buf, pos)?;
        let (count, mut pos) = read_varint_at(buf, pos)?;
        if index.checked_add(count).is_none_or(|end| end > self.count) {
            return Err(Error::CorruptIndex(format!(
                "node spans entries {index}..{index}+{count} beyond the catalog"
            )));
        }
        let children = if count > self.leafthresh {
            let mut offsets = [None; 4];
            for slot in &mut offsets {
                let (off, after) = read_varint_at(buf, pos)?;
                *slot = resolve_offset(buf, off, after)?;
                pos = after;
            }
            Some(offsets)
        } else {
            None
        };
        Ok(DiskNode { index, count, children })
    }

    /// Count matches under the node at `pos`. The boolean is true when the
    /// region is known to lie entirely under this node, so the caller can
    /// skip the remaining siblings at every level.
    fn count_node<R: Region + ?Sized>(
        &self,
        buf: &[u8],
        region: &R,
        pos: usize,
        trixel: &Trixel,
    ) -> Result<(u64, bool)> {
        let cov = region.classify(trixel);
        match cov {
            Coverage::Disjoint => Ok((0, false)),
            Coverage::Contains => {
                // Every point under this node matches; tally without touching
                // the entries.
                let node = self.read_node(buf, pos)?;
                Ok((node.count, false))
            }
            Coverage::Intersect | Coverage::Inside => {
                let node = self.read_node(buf, pos)?;
                let mut consumed = cov == Coverage::Inside;
                let mut n = 0;
                match node.children {
                    None => {
                        for i in node.index..node.index + node.count {
                            if region.contains(self.position(i)) {
                                n += 1;
                            }
                        }
                    }
                    Some(children) => {
                        let sub = trixel.children();
                        for (child, subtrixel) in children.iter().zip(&sub) {
                            if let Some(child_pos) = child {
                                let (cn, sub_consumed) =
                                    self.count_node(buf, region, *child_pos, subtrixel)?;
                                n += cn;
                                if sub_consumed {
                                    consumed = true;
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok((n, consumed))
            }
        }
    }

    /// Visit matches under the node at `pos`; same walk as [`count_node`]
    /// but emitting entries. Entries of fully-contained nodes are emitted
    /// without running the predicate.
    fn visit_node<R, F>(
        &self,
        buf: &[u8],
        region: &R,
        pos: usize,
        trixel: &Trixel,
        f: &mut F,
    ) -> Result<bool>
    where
        R: Region + ?Sized,
        F: FnMut(Entry<'_>),
    {
        let cov = region.classify(trixel);
        match cov {
            Coverage::Disjoint => Ok(false),
            Coverage::Contains => {
                let node = self.read_node(buf, pos)?;
                for i in node.index..node.index + node.count {
                    f(self.make_entry(i));
                }
                Ok(false)
            }
            Coverage::Intersect | Coverage::Inside => {
                let node = self.read_node(buf, pos)?;
                let mut consumed = cov == Coverage::Inside;
                match node.children {
                    None => {
                        for i in node.index..node.index + node.count {
                            if region.contains(self.position(i)) {
                                f(self.make_entry(i));
                            }
                        }
                    }
                    Some(children) => {
                        let sub = trixel.children();
                        for (child, subtrixel) in children.iter().zip(&sub) {
                            if let Some(child_pos) = child
                                && self.visit_node(buf, region, *child_pos, subtrixel, f)?
                            {
                                consumed = true;
                                break;
                            }
                        }
                    }
                }
                Ok(consumed)
            }
        }
    }
}

fn map_readonly(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // Safety: mapped read-only; the builder writes whole files and renames
    // nothing in place, so the mapping is stable for the Tree's lifetime.
    let map = unsafe { Mmap::map(&file)? };
    #[cfg(unix)]
    map.advise(memmap2::Advice::Random)?;
    Ok(map)
}
