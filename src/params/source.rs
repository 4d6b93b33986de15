//! The composable parameter-source tree.
//!
//! Sources form a tree of combinators over leaves; every node can report
//! its length, fill a [`ParameterPoint`] for an index, describe its
//! parameter names, hash itself structurally and reconcile against changed
//! underlying data (`resync`). Constructors normalize eagerly: null
//! children are stripped, single-child multi-sources collapse, nested
//! sources of the same associative kind flatten, and infinite children of
//! a chain are wrapped in `truncate(child, 1)`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{GcError, Result};
use crate::params::point::{ParameterMetadata, ParameterPoint};

/// Outcome of a resync pass: indices to redo, indices to disable and
/// whether the enumerated length changed. Indices are local to the node
/// that produced the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncResult {
    pub redo: BTreeSet<u64>,
    pub disable: BTreeSet<u64>,
    pub size_changed: bool,
}

impl ResyncResult {
    pub fn is_unchanged(&self) -> bool {
        self.redo.is_empty() && self.disable.is_empty() && !self.size_changed
    }

    /// Union both index sets and OR the size flags.
    pub fn merge(&mut self, other: ResyncResult) {
        self.redo.extend(other.redo);
        self.disable.extend(other.disable);
        self.size_changed |= other.size_changed;
    }
}

/// A leaf of the source tree. Concrete leaves carry the actual data; the
/// combinators in [`ParameterSource`] only coordinate indices.
pub trait LeafSource: Send + Sync + fmt::Debug {
    /// Number of points, or `None` for an inexhaustible leaf.
    fn parameter_len(&self) -> Option<u64>;
    fn fill(&self, pnum: u64, point: &mut ParameterPoint);
    fn metadata(&self, out: &mut Vec<ParameterMetadata>);
    fn leaf_hash(&self) -> String;
    fn resync(&mut self) -> ResyncResult {
        ResyncResult::default()
    }
    fn describe(&self) -> String;
    fn clone_leaf(&self) -> Box<dyn LeafSource>;
}

/// One slot of a cross product: the child's length (`None` = infinite,
/// passed through untransformed) and the product of all finite lengths to
/// its left.
#[derive(Debug, Clone, Copy)]
struct CrossSlot {
    len: Option<u64>,
    group: u64,
}

pub enum ParameterSource {
    Null,
    Leaf(Box<dyn LeafSource>),
    Truncate {
        child: Box<ParameterSource>,
        limit: u64,
        child_len: Option<u64>,
    },
    Range {
        child: Box<ParameterSource>,
        start: u64,
        end_user: Option<u64>,
        end: u64,
    },
    Chain {
        children: Vec<ParameterSource>,
        lens: Vec<u64>,
        offsets: Vec<u64>,
    },
    Cross {
        children: Vec<ParameterSource>,
        layout: Vec<CrossSlot>,
        len: u64,
    },
    Repeat {
        child: Box<ParameterSource>,
        times: u64,
        child_len: u64,
    },
    ZipLong {
        children: Vec<ParameterSource>,
        lens: Vec<Option<u64>>,
    },
    ZipShort {
        children: Vec<ParameterSource>,
        lens: Vec<Option<u64>>,
    },
}

// ---------- constructors ----------

impl ParameterSource {
    pub fn null() -> Self {
        ParameterSource::Null
    }

    pub fn leaf(leaf: Box<dyn LeafSource>) -> Self {
        ParameterSource::Leaf(leaf)
    }

    /// Convenience leaf: a tracked variable over a fixed value list.
    pub fn var(name: &str, values: &[&str]) -> Self {
        ParameterSource::Leaf(Box::new(VarSource::new(name, values)))
    }

    /// Limit `child` to its first `limit` points. `limit == 0` collapses to
    /// null, a negative limit is a no-op.
    pub fn truncate(child: ParameterSource, limit: i64) -> Self {
        if limit == 0 {
            return ParameterSource::Null;
        }
        if limit < 0 {
            return child;
        }
        let child_len = child.parameter_len();
        ParameterSource::Truncate {
            child: Box::new(child),
            limit: limit as u64,
            child_len,
        }
    }

    /// View `child` through the index window `[start, end]`. An omitted
    /// `end` tracks the child's last index; that requires a finite child.
    pub fn range(child: ParameterSource, start: u64, end: Option<u64>) -> Result<Self> {
        let end_resolved = match end {
            Some(e) => e,
            None => match child.parameter_len() {
                Some(len) => len.saturating_sub(1),
                None => {
                    return Err(GcError::Parameter(format!(
                        "range over inexhaustible source {child} requires an explicit end"
                    )));
                }
            },
        };
        Ok(ParameterSource::Range {
            child: Box::new(child),
            start,
            end_user: end,
            end: end_resolved,
        })
    }

    /// Concatenate sources. Infinite children are wrapped in
    /// `truncate(child, 1)` so the chain itself stays finite.
    pub fn chain(children: Vec<ParameterSource>) -> Result<Self> {
        let mut kids = Vec::new();
        for child in children {
            match child {
                ParameterSource::Null => {}
                ParameterSource::Chain { children, .. } => kids.extend(children),
                other => kids.push(other),
            }
        }
        let kids: Vec<ParameterSource> = kids
            .into_iter()
            .map(|c| {
                if c.parameter_len().is_none() {
                    ParameterSource::truncate(c, 1)
                } else {
                    c
                }
            })
            .collect();
        match kids.len() {
            0 => Ok(ParameterSource::Null),
            1 => Ok(kids.into_iter().next().expect("one child")),
            _ => {
                let lens: Vec<u64> = kids
                    .iter()
                    .map(|c| c.parameter_len().expect("chain children are finite"))
                    .collect();
                let offsets = chain_offsets(&lens);
                let node = ParameterSource::Chain {
                    children: kids,
                    lens,
                    offsets,
                };
                node.fill_metadata(&mut Vec::new())?;
                Ok(node)
            }
        }
    }

    /// Cross product. With fewer than two finite children this collapses
    /// to [`ParameterSource::zip_long`].
    pub fn cross(children: Vec<ParameterSource>) -> Result<Self> {
        let mut kids = Vec::new();
        for child in children {
            match child {
                ParameterSource::Null => {}
                ParameterSource::Cross { children, .. } => kids.extend(children),
                other => kids.push(other),
            }
        }
        let finite = kids
            .iter()
            .filter(|c| c.parameter_len().is_some())
            .count();
        if finite < 2 {
            return ParameterSource::zip_long(kids);
        }
        let (layout, len) = cross_layout(&kids);
        let node = ParameterSource::Cross {
            children: kids,
            layout,
            len,
        };
        node.fill_metadata(&mut Vec::new())?;
        Ok(node)
    }

    /// Repeat `child` `times` times. Negative counts are a no-op, zero
    /// collapses to null, one collapses to the child; an inexhaustible
    /// child degenerates to `truncate(child, times)`.
    pub fn repeat(child: ParameterSource, times: i64) -> Self {
        if times < 0 {
            return child;
        }
        let child_len = match child.parameter_len() {
            Some(len) => len,
            None => return ParameterSource::truncate(child, times),
        };
        match times {
            0 => ParameterSource::Null,
            1 => child,
            _ => ParameterSource::Repeat {
                child: Box::new(child),
                times: times as u64,
                child_len,
            },
        }
    }

    /// Enumerate children in parallel, up to the longest one.
    pub fn zip_long(children: Vec<ParameterSource>) -> Result<Self> {
        let kids = zip_strip(children, true);
        match kids.len() {
            0 => Ok(ParameterSource::Null),
            1 => Ok(kids.into_iter().next().expect("one child")),
            _ => {
                let lens = kids.iter().map(ParameterSource::parameter_len).collect();
                let node = ParameterSource::ZipLong {
                    children: kids,
                    lens,
                };
                node.fill_metadata(&mut Vec::new())?;
                Ok(node)
            }
        }
    }

    /// Enumerate children in parallel, up to the shortest one.
    pub fn zip_short(children: Vec<ParameterSource>) -> Result<Self> {
        let kids = zip_strip(children, false);
        match kids.len() {
            0 => Ok(ParameterSource::Null),
            1 => Ok(kids.into_iter().next().expect("one child")),
            _ => {
                let lens = kids.iter().map(ParameterSource::parameter_len).collect();
                let node = ParameterSource::ZipShort {
                    children: kids,
                    lens,
                };
                node.fill_metadata(&mut Vec::new())?;
                Ok(node)
            }
        }
    }

    /// Variation sweep: one all-central baseline row, then one branch per
    /// finite child sweeping that axis while the others stay at their
    /// first value. Expands into chain/cross/range combinators.
    pub fn variation(children: Vec<ParameterSource>) -> Result<Self> {
        let kids: Vec<ParameterSource> = children
            .into_iter()
            .filter(|c| !matches!(c, ParameterSource::Null))
            .collect();
        let central: Vec<ParameterSource> = kids
            .iter()
            .map(|c| ParameterSource::range(c.clone(), 0, Some(0)))
            .collect::<Result<_>>()?;
        let mut rows = vec![ParameterSource::zip_long(central.clone())?];
        for (idx, child) in kids.iter().enumerate() {
            if child.parameter_len().is_some() {
                let mut branch = central.clone();
                branch[idx] = ParameterSource::range(child.clone(), 1, None)?;
                rows.push(ParameterSource::cross(branch)?);
            }
        }
        ParameterSource::chain(rows)
    }
}

fn zip_strip(children: Vec<ParameterSource>, long: bool) -> Vec<ParameterSource> {
    let mut kids = Vec::new();
    for child in children {
        match child {
            ParameterSource::Null => {}
            ParameterSource::ZipLong { children, .. } if long => kids.extend(children),
            ParameterSource::ZipShort { children, .. } if !long => kids.extend(children),
            other => kids.push(other),
        }
    }
    kids
}

fn chain_offsets(lens: &[u64]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(lens.len());
    let mut total = 0;
    for len in lens {
        offsets.push(total);
        total += len;
    }
    offsets
}

fn cross_layout(children: &[ParameterSource]) -> (Vec<CrossSlot>, u64) {
    let mut layout = Vec::with_capacity(children.len());
    let mut group = 1;
    for child in children {
        let len = child.parameter_len();
        layout.push(CrossSlot { len, group });
        if let Some(l) = len
            && l > 0
        {
            group *= l;
        }
    }
    let len = children
        .iter()
        .filter_map(ParameterSource::parameter_len)
        .product::<u64>();
    (layout, len)
}

fn zip_len(lens: &[Option<u64>], long: bool) -> Option<u64> {
    let finite: Vec<u64> = lens.iter().copied().flatten().collect();
    if finite.is_empty() {
        None
    } else if long {
        finite.iter().copied().max()
    } else {
        finite.iter().copied().min()
    }
}

// ---------- node operations ----------

impl ParameterSource {
    /// Number of enumerated points; `None` means inexhaustible.
    pub fn parameter_len(&self) -> Option<u64> {
        match self {
            ParameterSource::Null => Some(0),
            ParameterSource::Leaf(leaf) => leaf.parameter_len(),
            ParameterSource::Truncate { limit, .. } => Some(*limit),
            ParameterSource::Range { start, end, .. } => {
                Some((end + 1).saturating_sub(*start))
            }
            ParameterSource::Chain { lens, .. } => Some(lens.iter().sum()),
            ParameterSource::Cross { len, .. } => Some(*len),
            ParameterSource::Repeat {
                times, child_len, ..
            } => Some(times * child_len),
            ParameterSource::ZipLong { lens, .. } => zip_len(lens, true),
            ParameterSource::ZipShort { lens, .. } => zip_len(lens, false),
        }
    }

    /// Populate `point` with the values of index `pnum`. Out-of-range
    /// indices leave the point untouched.
    pub fn fill(&self, pnum: u64, point: &mut ParameterPoint) {
        match self {
            ParameterSource::Null => {}
            ParameterSource::Leaf(leaf) => leaf.fill(pnum, point),
            ParameterSource::Truncate {
                child, child_len, ..
            } => {
                if child_len.is_none_or(|len| pnum < len) {
                    child.fill(pnum, point);
                }
            }
            ParameterSource::Range { child, start, .. } => child.fill(pnum + start, point),
            ParameterSource::Chain { children, lens, .. } => {
                let mut limit = 0;
                for (child, len) in children.iter().zip(lens) {
                    if pnum < limit + len {
                        child.fill(pnum - limit, point);
                        return;
                    }
                    limit += len;
                }
            }
            ParameterSource::Cross {
                children, layout, ..
            } => {
                for (child, slot) in children.iter().zip(layout) {
                    match slot.len {
                        Some(len) if len > 0 => {
                            child.fill((pnum / slot.group) % len, point);
                        }
                        Some(_) => {}
                        None => child.fill(pnum, point),
                    }
                }
            }
            ParameterSource::Repeat {
                child, child_len, ..
            } => child.fill(pnum % child_len, point),
            ParameterSource::ZipLong { children, lens }
            | ParameterSource::ZipShort { children, lens } => {
                for (child, len) in children.iter().zip(lens) {
                    match len {
                        Some(len) => {
                            if pnum < *len {
                                child.fill(pnum, point);
                            }
                        }
                        None => child.fill(pnum, point),
                    }
                }
            }
        }
    }

    /// Collect parameter metadata. Within a multi-source two children must
    /// not emit the same name; a chain tolerates repeats as long as their
    /// tracking status agrees.
    pub fn fill_metadata(&self, out: &mut Vec<ParameterMetadata>) -> Result<()> {
        match self {
            ParameterSource::Null => Ok(()),
            ParameterSource::Leaf(leaf) => {
                leaf.metadata(out);
                Ok(())
            }
            ParameterSource::Truncate { child, .. }
            | ParameterSource::Range { child, .. }
            | ParameterSource::Repeat { child, .. } => child.fill_metadata(out),
            ParameterSource::Chain { children, .. } => {
                let mut tracking: BTreeMap<String, bool> = BTreeMap::new();
                let mut seen_in: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for child in children {
                    let mut local = Vec::new();
                    child.fill_metadata(&mut local)?;
                    for meta in local {
                        let status = *tracking
                            .entry(meta.name.clone())
                            .or_insert(meta.untracked);
                        if status != meta.untracked {
                            return Err(GcError::Parameter(format!(
                                "collision of tracking status for parameter {} between {} and {}",
                                meta.name,
                                child,
                                seen_in
                                    .get(&meta.name)
                                    .map(|v| v.join("; "))
                                    .unwrap_or_default()
                            )));
                        }
                        if !seen_in.contains_key(&meta.name) {
                            out.push(meta.clone());
                        }
                        seen_in
                            .entry(meta.name)
                            .or_default()
                            .push(child.to_string());
                    }
                }
                Ok(())
            }
            ParameterSource::Cross { children, .. }
            | ParameterSource::ZipLong { children, .. }
            | ParameterSource::ZipShort { children, .. } => {
                let mut owner: BTreeMap<String, String> = BTreeMap::new();
                for child in children {
                    let mut local = Vec::new();
                    child.fill_metadata(&mut local)?;
                    for meta in local {
                        if let Some(other) = owner.get(&meta.name) {
                            return Err(GcError::Parameter(format!(
                                "collision of parameter {} between {} and {}",
                                meta.name, child, other
                            )));
                        }
                        owner.insert(meta.name.clone(), child.to_string());
                        out.push(meta);
                    }
                }
                Ok(())
            }
        }
    }

    /// Structural + content digest. Semantically equal normalized trees
    /// hash identically.
    pub fn source_hash(&self) -> String {
        let material = match self {
            ParameterSource::Null => "null".to_string(),
            ParameterSource::Leaf(leaf) => return leaf.leaf_hash(),
            ParameterSource::Truncate { child, limit, .. } => {
                format!("{}{}", child.source_hash(), limit)
            }
            ParameterSource::Range {
                child, start, end, ..
            } => format!("{}[{}, {}]", child.source_hash(), start, end),
            ParameterSource::Repeat { child, times, .. } => {
                format!("{}{}", child.source_hash(), times)
            }
            ParameterSource::Chain { children, .. } => multi_hash_material("chain", children),
            ParameterSource::Cross { children, .. } => multi_hash_material("cross", children),
            ParameterSource::ZipLong { children, .. } => multi_hash_material("zip", children),
            ParameterSource::ZipShort { children, .. } => multi_hash_material("szip", children),
        };
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    /// Re-evaluate this subtree after its underlying data has changed.
    /// The returned sets hold indices local to this node.
    pub fn resync(&mut self) -> ResyncResult {
        match self {
            ParameterSource::Null => ResyncResult::default(),
            ParameterSource::Leaf(leaf) => leaf.resync(),
            ParameterSource::Truncate {
                child,
                limit,
                child_len,
            } => {
                let inner = child.resync();
                let limit = *limit;
                *child_len = child.parameter_len();
                ResyncResult {
                    redo: inner.redo.into_iter().filter(|p| *p < limit).collect(),
                    disable: inner.disable.into_iter().filter(|p| *p < limit).collect(),
                    // The enumerated length is pinned by the limit.
                    size_changed: false,
                }
            }
            ParameterSource::Range {
                child,
                start,
                end_user,
                end,
            } => {
                let inner = child.resync();
                let (start, old_end) = (*start, *end);
                let translate = |set: BTreeSet<u64>| {
                    set.into_iter()
                        .filter(|p| *p >= start && *p <= old_end)
                        .map(|p| p - start)
                        .collect()
                };
                let result = ResyncResult {
                    redo: translate(inner.redo),
                    disable: translate(inner.disable),
                    size_changed: false,
                };
                if end_user.is_none()
                    && let Some(len) = child.parameter_len()
                {
                    *end = len.saturating_sub(1);
                }
                ResyncResult {
                    size_changed: old_end != *end,
                    ..result
                }
            }
            ParameterSource::Chain {
                children,
                lens,
                offsets,
            } => {
                let old_len: u64 = lens.iter().sum();
                let inner: Vec<ResyncResult> =
                    children.iter_mut().map(ParameterSource::resync).collect();
                *lens = children
                    .iter()
                    .map(|c| c.parameter_len().unwrap_or(1))
                    .collect();
                *offsets = chain_offsets(lens);
                let mut result = ResyncResult::default();
                for (idx, child_result) in inner.into_iter().enumerate() {
                    let offset = offsets[idx];
                    result.redo.extend(child_result.redo.iter().map(|p| p + offset));
                    result
                        .disable
                        .extend(child_result.disable.iter().map(|p| p + offset));
                }
                result.size_changed = old_len != lens.iter().sum::<u64>();
                result
            }
            ParameterSource::Cross {
                children,
                layout,
                len,
            } => {
                let old_len = *len;
                let inner: Vec<ResyncResult> =
                    children.iter_mut().map(ParameterSource::resync).collect();
                let (new_layout, new_len) = cross_layout(children);
                *layout = new_layout;
                *len = new_len;
                let mut result = ResyncResult::default();
                for (idx, child_result) in inner.into_iter().enumerate() {
                    let slot = layout[idx];
                    for pnum in child_result.redo {
                        result.redo.extend(cross_translate(slot, pnum, *len));
                    }
                    for pnum in child_result.disable {
                        result.disable.extend(cross_translate(slot, pnum, *len));
                    }
                }
                result.size_changed = old_len != *len;
                result
            }
            ParameterSource::Repeat {
                child,
                times,
                child_len,
            } => {
                let old_total = *times * *child_len;
                let inner = child.resync();
                *child_len = child.parameter_len().unwrap_or(*child_len);
                let (times, child_len) = (*times, *child_len);
                let translate = |set: BTreeSet<u64>| {
                    set.into_iter()
                        .flat_map(|p| (0..times).map(move |i| p + i * child_len))
                        .collect()
                };
                ResyncResult {
                    redo: translate(inner.redo),
                    disable: translate(inner.disable),
                    size_changed: old_total != times * child_len,
                }
            }
            ParameterSource::ZipLong { children, lens } => zip_resync(children, lens, true),
            ParameterSource::ZipShort { children, lens } => zip_resync(children, lens, false),
        }
    }
}

fn zip_resync(
    children: &mut [ParameterSource],
    lens: &mut Vec<Option<u64>>,
    long: bool,
) -> ResyncResult {
    let old_len = zip_len(lens, long);
    let mut result = ResyncResult::default();
    for child in children.iter_mut() {
        result.merge(child.resync());
    }
    *lens = children.iter().map(ParameterSource::parameter_len).collect();
    result.size_changed = old_len != zip_len(lens, long);
    result
}

fn multi_hash_material(tag: &str, children: &[ParameterSource]) -> String {
    let hashes: Vec<String> = children.iter().map(ParameterSource::source_hash).collect();
    format!("{tag}[{}]", hashes.join(", "))
}

fn cross_translate(slot: CrossSlot, pnum: u64, total: u64) -> Vec<u64> {
    match slot.len {
        Some(len) if len > 0 => (0..total)
            .filter(|q| (q / slot.group) % len == pnum)
            .collect(),
        _ => Vec::new(),
    }
}

impl Clone for ParameterSource {
    fn clone(&self) -> Self {
        match self {
            ParameterSource::Null => ParameterSource::Null,
            ParameterSource::Leaf(leaf) => ParameterSource::Leaf(leaf.clone_leaf()),
            ParameterSource::Truncate {
                child,
                limit,
                child_len,
            } => ParameterSource::Truncate {
                child: child.clone(),
                limit: *limit,
                child_len: *child_len,
            },
            ParameterSource::Range {
                child,
                start,
                end_user,
                end,
            } => ParameterSource::Range {
                child: child.clone(),
                start: *start,
                end_user: *end_user,
                end: *end,
            },
            ParameterSource::Chain {
                children,
                lens,
                offsets,
            } => ParameterSource::Chain {
                children: children.clone(),
                lens: lens.clone(),
                offsets: offsets.clone(),
            },
            ParameterSource::Cross {
                children,
                layout,
                len,
            } => ParameterSource::Cross {
                children: children.clone(),
                layout: layout.clone(),
                len: *len,
            },
            ParameterSource::Repeat {
                child,
                times,
                child_len,
            } => ParameterSource::Repeat {
                child: child.clone(),
                times: *times,
                child_len: *child_len,
            },
            ParameterSource::ZipLong { children, lens } => ParameterSource::ZipLong {
                children: children.clone(),
                lens: lens.clone(),
            },
            ParameterSource::ZipShort { children, lens } => ParameterSource::ZipShort {
                children: children.clone(),
                lens: lens.clone(),
            },
        }
    }
}

impl fmt::Debug for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSource::Null => write!(f, "null()"),
            ParameterSource::Leaf(leaf) => write!(f, "{}", leaf.describe()),
            ParameterSource::Truncate { child, limit, .. } => {
                write!(f, "truncate({child}, {limit})")
            }
            ParameterSource::Range {
                child,
                start,
                end_user,
                ..
            } => match end_user {
                Some(end) => write!(f, "range({child}, {start}, {end})"),
                None => write!(f, "range({child}, {start})"),
            },
            ParameterSource::Chain { children, .. } => write_multi(f, "chain", children),
            ParameterSource::Cross { children, .. } => write_multi(f, "cross", children),
            ParameterSource::Repeat { child, times, .. } => {
                write!(f, "repeat({child}, {times})")
            }
            ParameterSource::ZipLong { children, .. } => write_multi(f, "zip", children),
            ParameterSource::ZipShort { children, .. } => write_multi(f, "szip", children),
        }
    }
}

fn write_multi(
    f: &mut fmt::Formatter<'_>,
    tag: &str,
    children: &[ParameterSource],
) -> fmt::Result {
    write!(f, "{tag}(")?;
    for (idx, child) in children.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{child}")?;
    }
    write!(f, ")")
}

// ---------- concrete leaves ----------

/// A named variable over a list of values. The backing list is shared, so
/// it can be replaced between resyncs; the leaf enumerates a snapshot and
/// reconciles against the live data on `resync`.
#[derive(Debug)]
pub struct VarSource {
    name: String,
    untracked: bool,
    store: Arc<RwLock<Vec<String>>>,
    snapshot: Vec<String>,
}

impl VarSource {
    pub fn new(name: &str, values: &[&str]) -> Self {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        VarSource {
            name: name.to_string(),
            untracked: false,
            snapshot: values.clone(),
            store: Arc::new(RwLock::new(values)),
        }
    }

    pub fn untracked(name: &str, values: &[&str]) -> Self {
        VarSource {
            untracked: true,
            ..VarSource::new(name, values)
        }
    }

    /// Leaf over externally owned data; replace the store's contents and
    /// call `resync` on the tree to pick the change up.
    pub fn shared(name: &str, store: Arc<RwLock<Vec<String>>>) -> Self {
        let snapshot = store.read().expect("var store poisoned").clone();
        VarSource {
            name: name.to_string(),
            untracked: false,
            store,
            snapshot,
        }
    }
}

impl LeafSource for VarSource {
    fn parameter_len(&self) -> Option<u64> {
        Some(self.snapshot.len() as u64)
    }

    fn fill(&self, pnum: u64, point: &mut ParameterPoint) {
        if let Some(value) = self.snapshot.get(pnum as usize) {
            point.set(&self.name, value);
        }
    }

    fn metadata(&self, out: &mut Vec<ParameterMetadata>) {
        out.push(ParameterMetadata {
            name: self.name.clone(),
            untracked: self.untracked,
        });
    }

    fn leaf_hash(&self) -> String {
        let material = format!(
            "var\0{}\0{}\0{}",
            self.name,
            self.untracked,
            self.snapshot.join("\0")
        );
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    fn resync(&mut self) -> ResyncResult {
        let live = self.store.read().expect("var store poisoned").clone();
        let mut result = ResyncResult {
            size_changed: live.len() != self.snapshot.len(),
            ..ResyncResult::default()
        };
        let common = live.len().min(self.snapshot.len());
        for idx in 0..common {
            if live[idx] != self.snapshot[idx] {
                result.redo.insert(idx as u64);
            }
        }
        // Grown entries are fresh content, shrunk entries are gone.
        for idx in self.snapshot.len()..live.len() {
            result.redo.insert(idx as u64);
        }
        for idx in live.len()..self.snapshot.len() {
            result.disable.insert(idx as u64);
        }
        self.snapshot = live;
        result
    }

    fn describe(&self) -> String {
        format!("var({:?})", self.name)
    }

    fn clone_leaf(&self) -> Box<dyn LeafSource> {
        Box::new(VarSource {
            name: self.name.clone(),
            untracked: self.untracked,
            store: Arc::clone(&self.store),
            snapshot: self.snapshot.clone(),
        })
    }
}

/// An inexhaustible counter: index `p` yields `base + p`. Untracked, since
/// the value is derived from the job position itself.
#[derive(Debug, Clone)]
pub struct CounterSource {
    name: String,
    base: u64,
}

impl CounterSource {
    pub fn new(name: &str, base: u64) -> Self {
        CounterSource {
            name: name.to_string(),
            base,
        }
    }
}

impl LeafSource for CounterSource {
    fn parameter_len(&self) -> Option<u64> {
        None
    }

    fn fill(&self, pnum: u64, point: &mut ParameterPoint) {
        point.set(&self.name, (self.base + pnum).to_string());
    }

    fn metadata(&self, out: &mut Vec<ParameterMetadata>) {
        out.push(ParameterMetadata::untracked(self.name.clone()));
    }

    fn leaf_hash(&self) -> String {
        format!(
            "{:x}",
            md5::compute(format!("counter\0{}\0{}", self.name, self.base).as_bytes())
        )
    }

    fn describe(&self) -> String {
        format!("counter({:?}, {})", self.name, self.base)
    }

    fn clone_leaf(&self) -> Box<dyn LeafSource> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_of(src: &ParameterSource, pnum: u64) -> ParameterPoint {
        let mut point = ParameterPoint::new();
        src.fill(pnum, &mut point);
        point
    }

    fn enumerate(src: &ParameterSource) -> Vec<ParameterPoint> {
        (0..src.parameter_len().expect("finite source"))
            .map(|p| point_of(src, p))
            .collect()
    }

    #[test]
    fn cross_of_chain_enumerates_the_expected_space() {
        // cross(chain(range(A{x,y}, 0, 1), range(A{z}, 0, 0)), range(B{1,2,3}, 0, 2))
        let a_xy = ParameterSource::range(ParameterSource::var("A", &["x", "y"]), 0, Some(1))
            .unwrap();
        let a_z = ParameterSource::range(ParameterSource::var("A", &["z"]), 0, Some(0)).unwrap();
        let a = ParameterSource::chain(vec![a_xy, a_z]).unwrap();
        let b = ParameterSource::range(ParameterSource::var("B", &["1", "2", "3"]), 0, Some(2))
            .unwrap();
        let tree = ParameterSource::cross(vec![a, b]).unwrap();

        assert_eq!(tree.parameter_len(), Some(9));
        let p4 = point_of(&tree, 4);
        assert_eq!(p4.get("A"), Some("y"));
        assert_eq!(p4.get("B"), Some("2"));
    }

    #[test]
    fn cross_coordinates_match_mixed_radix_decomposition() {
        let a = ParameterSource::var("A", &["a0", "a1"]);
        let b = ParameterSource::var("B", &["b0", "b1", "b2"]);
        let tree = ParameterSource::cross(vec![a.clone(), b.clone()]).unwrap();
        for p in 0..6 {
            let point = point_of(&tree, p);
            assert_eq!(point.get("A"), point_of(&a, p % 2).get("A"));
            assert_eq!(point.get("B"), point_of(&b, (p / 2) % 3).get("B"));
        }
    }

    #[test]
    fn finite_enumeration_is_a_bijection() {
        let tree = ParameterSource::cross(vec![
            ParameterSource::var("A", &["x", "y"]),
            ParameterSource::var("B", &["1", "2", "3"]),
        ])
        .unwrap();
        let points = enumerate(&tree);
        for (i, a) in points.iter().enumerate() {
            for b in points.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn nested_associative_kinds_flatten_and_hash_alike() {
        let mk = |name: &str| ParameterSource::var(name, &["1", "2"]);
        let flat = ParameterSource::chain(vec![mk("A"), mk("B"), mk("C")]).unwrap();
        let nested = ParameterSource::chain(vec![
            ParameterSource::chain(vec![mk("A"), mk("B")]).unwrap(),
            mk("C"),
        ])
        .unwrap();
        assert_eq!(flat.source_hash(), nested.source_hash());
        assert_eq!(flat.parameter_len(), nested.parameter_len());
    }

    #[test]
    fn single_child_multi_sources_collapse() {
        let leaf = ParameterSource::var("A", &["x"]);
        let chained = ParameterSource::chain(vec![leaf.clone()]).unwrap();
        assert_eq!(chained.source_hash(), leaf.source_hash());

        let empty = ParameterSource::chain(vec![ParameterSource::null()]).unwrap();
        assert_eq!(empty.parameter_len(), Some(0));
        assert_eq!(empty.source_hash(), ParameterSource::null().source_hash());
    }

    #[test]
    fn cross_with_one_finite_child_collapses_to_zip() {
        let a = ParameterSource::var("A", &["x", "y"]);
        let crossed = ParameterSource::cross(vec![a.clone()]).unwrap();
        assert_eq!(crossed.source_hash(), a.source_hash());
    }

    #[test]
    fn repeat_normalization_rules() {
        let leaf = ParameterSource::var("A", &["x", "y"]);
        assert_eq!(
            ParameterSource::repeat(leaf.clone(), 1).source_hash(),
            leaf.source_hash()
        );
        assert_eq!(
            ParameterSource::repeat(leaf.clone(), 0).parameter_len(),
            Some(0)
        );
        assert_eq!(
            ParameterSource::repeat(leaf.clone(), -1).source_hash(),
            leaf.source_hash()
        );
        let repeated = ParameterSource::repeat(leaf, 3);
        assert_eq!(repeated.parameter_len(), Some(6));
        assert_eq!(point_of(&repeated, 5).get("A"), Some("y"));
    }

    #[test]
    fn truncate_boundaries() {
        let leaf = ParameterSource::var("A", &["x", "y"]);
        assert_eq!(
            ParameterSource::truncate(leaf.clone(), 0).parameter_len(),
            Some(0)
        );
        assert_eq!(
            ParameterSource::truncate(leaf.clone(), -3).source_hash(),
            leaf.source_hash()
        );
        let over = ParameterSource::truncate(leaf, 5);
        assert_eq!(over.parameter_len(), Some(5));
        // Beyond the child's length, fill produces empty points.
        assert!(point_of(&over, 4).values().is_empty());
        assert_eq!(point_of(&over, 1).get("A"), Some("y"));
    }

    #[test]
    fn range_with_inverted_bounds_is_empty() {
        let leaf = ParameterSource::var("A", &["x", "y", "z"]);
        let inverted = ParameterSource::range(leaf, 2, Some(1)).unwrap();
        assert_eq!(inverted.parameter_len(), Some(0));
    }

    #[test]
    fn chain_wraps_infinite_children() {
        let counter = ParameterSource::leaf(Box::new(CounterSource::new("N", 0)));
        let leaf = ParameterSource::var("A", &["x", "y"]);
        let chained = ParameterSource::chain(vec![counter, leaf]).unwrap();
        assert_eq!(chained.parameter_len(), Some(3));
        assert_eq!(point_of(&chained, 0).get("N"), Some("0"));
        assert_eq!(point_of(&chained, 2).get("A"), Some("y"));
    }

    #[test]
    fn cross_with_empty_child_is_empty() {
        let empty = ParameterSource::var("A", &[]);
        let full = ParameterSource::var("B", &["1", "2"]);
        let tree = ParameterSource::cross(vec![empty, full]).unwrap();
        assert_eq!(tree.parameter_len(), Some(0));
    }

    #[test]
    fn zip_name_collision_is_a_parameter_error() {
        let err = ParameterSource::zip_long(vec![
            ParameterSource::var("A", &["x"]),
            ParameterSource::var("A", &["y"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GcError::Parameter(_)), "got {err:?}");
    }

    #[test]
    fn chain_tolerates_repeats_with_matching_tracking() {
        let tree = ParameterSource::chain(vec![
            ParameterSource::var("A", &["x"]),
            ParameterSource::var("A", &["y"]),
        ])
        .unwrap();
        let mut meta = Vec::new();
        tree.fill_metadata(&mut meta).unwrap();
        assert_eq!(meta.len(), 1);

        let err = ParameterSource::chain(vec![
            ParameterSource::var("A", &["x"]),
            ParameterSource::leaf(Box::new(VarSource::untracked("A", &["y"]))),
        ])
        .unwrap_err();
        assert!(matches!(err, GcError::Parameter(_)), "got {err:?}");
    }

    #[test]
    fn variation_sweeps_one_axis_at_a_time() {
        let a = ParameterSource::var("A", &["a0", "a1"]);
        let b = ParameterSource::var("B", &["b0", "b1", "b2"]);
        let tree = ParameterSource::variation(vec![a, b]).unwrap();
        assert_eq!(tree.parameter_len(), Some(4));
        let rows: Vec<(Option<String>, Option<String>)> = enumerate(&tree)
            .iter()
            .map(|p| {
                (
                    p.get("A").map(String::from),
                    p.get("B").map(String::from),
                )
            })
            .collect();
        assert_eq!(
            rows,
            vec![
                (Some("a0".into()), Some("b0".into())),
                (Some("a1".into()), Some("b0".into())),
                (Some("a0".into()), Some("b1".into())),
                (Some("a0".into()), Some("b2".into())),
            ]
        );
    }

    #[test]
    fn zip_long_resync_reports_growth() {
        let store = Arc::new(RwLock::new(vec!["x".to_string(), "y".to_string()]));
        let a = ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        let b = ParameterSource::var("B", &["1", "2", "3"]);
        let mut tree = ParameterSource::zip_long(vec![a, b]).unwrap();
        assert_eq!(tree.parameter_len(), Some(3));

        store
            .write()
            .unwrap()
            .extend(["z".to_string(), "w".to_string()]);
        let result = tree.resync();
        assert_eq!(tree.parameter_len(), Some(4));
        assert!(result.size_changed);
        assert!(result.redo.contains(&2) && result.redo.contains(&3));
    }

    #[test]
    fn resync_without_changes_is_empty() {
        let store = Arc::new(RwLock::new(vec!["x".to_string()]));
        let a = ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        let mut tree =
            ParameterSource::cross(vec![a, ParameterSource::var("B", &["1", "2"])]).unwrap();
        store.write().unwrap()[0] = "other".to_string();
        assert!(!tree.resync().is_unchanged());
        assert!(tree.resync().is_unchanged());
    }

    #[test]
    fn cross_resync_translates_to_all_affected_rows() {
        let store = Arc::new(RwLock::new(vec![
            "b0".to_string(),
            "b1".to_string(),
            "b2".to_string(),
        ]));
        let a = ParameterSource::var("A", &["a0", "a1"]);
        let b = ParameterSource::leaf(Box::new(VarSource::shared("B", Arc::clone(&store))));
        let mut tree = ParameterSource::cross(vec![a, b]).unwrap();

        store.write().unwrap()[1] = "changed".to_string();
        let result = tree.resync();
        // B is the second axis with group size 2: local index 1 covers rows 2 and 3.
        assert_eq!(result.redo, BTreeSet::from([2, 3]));
        assert!(!result.size_changed);
    }

    #[test]
    fn repeat_resync_translates_to_every_repetition() {
        let store = Arc::new(RwLock::new(vec!["x".to_string(), "y".to_string()]));
        let leaf = ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        let mut tree = ParameterSource::repeat(leaf, 3);

        store.write().unwrap()[1] = "other".to_string();
        let result = tree.resync();
        assert_eq!(result.redo, BTreeSet::from([1, 3, 5]));
    }

    #[test]
    fn truncate_resync_never_changes_size() {
        let store = Arc::new(RwLock::new(vec!["x".to_string(), "y".to_string()]));
        let leaf = ParameterSource::leaf(Box::new(VarSource::shared("A", Arc::clone(&store))));
        let mut tree = ParameterSource::truncate(leaf, 2);

        store.write().unwrap().push("z".to_string());
        let result = tree.resync();
        assert!(!result.size_changed);
        assert!(result.redo.is_empty());
        assert_eq!(tree.parameter_len(), Some(2));
    }
}
