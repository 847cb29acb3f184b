//! Bulk-loaded R-tree over leaf tile MBRs.
//!
//! The tree is built bottom-up from a pre-sorted sequence of leaf MBRs and is
//! immutable afterwards; it supports no insertions or deletions. Each level
//! stores its MBRs in one contiguous coordinate buffer, level 0 being the
//! single-MBR root. Range queries walk the tree depth-first and report, per
//! leaf tile, whether the query covers it fully or partially and by what
//! volume fraction.

use bytes::Bytes;

use crate::datatype::{CoordData, CoordValue, Datatype};
use crate::error::{CelldexError, Result};
use crate::mbr;

/// One level of the tree: a count plus a flat coordinate buffer holding
/// `mbr_num` MBRs of `2 * dim_num` values each.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    mbr_num: u64,
    mbrs: CoordData,
}

impl Level {
    pub fn mbr_num(&self) -> u64 {
        self.mbr_num
    }
}

/// Per-tile classification of a range query result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileCover {
    /// The query covers the whole leaf tile.
    Full(u64),
    /// The query covers this fraction of the leaf tile, in `(0, 1]`.
    Partial(u64, f64),
}

impl TileCover {
    pub fn tile_idx(&self) -> u64 {
        match self {
            TileCover::Full(idx) => *idx,
            TileCover::Partial(idx, _) => *idx,
        }
    }

    pub fn ratio(&self) -> f64 {
        match self {
            TileCover::Full(_) => 1.0,
            TileCover::Partial(_, ratio) => *ratio,
        }
    }
}

/// Result of a range query: fully covered leaf tiles as contiguous inclusive
/// index ranges, partially covered leaves with their overlap ratios. Both
/// lists are ascending by leaf index and mutually disjoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TileOverlap {
    pub tile_ranges: Vec<(u64, u64)>,
    pub tiles: Vec<(u64, f64)>,
}

impl TileOverlap {
    pub fn is_empty(&self) -> bool {
        self.tile_ranges.is_empty() && self.tiles.is_empty()
    }

    /// Iterate all covered tiles in ascending leaf order, expanding the full
    /// ranges tile by tile.
    pub fn iter(&self) -> TileOverlapIter<'_> {
        TileOverlapIter {
            overlap: self,
            range_pos: 0,
            range_offset: 0,
            partial_pos: 0,
        }
    }
}

/// Merging iterator over [`TileOverlap`]; see [`TileOverlap::iter`].
pub struct TileOverlapIter<'a> {
    overlap: &'a TileOverlap,
    range_pos: usize,
    range_offset: u64,
    partial_pos: usize,
}

impl Iterator for TileOverlapIter<'_> {
    type Item = TileCover;

    fn next(&mut self) -> Option<TileCover> {
        let next_full = self
            .overlap
            .tile_ranges
            .get(self.range_pos)
            .map(|(start, _)| start + self.range_offset);
        let next_partial = self
            .overlap
            .tiles
            .get(self.partial_pos)
            .map(|(idx, _)| *idx);

        match (next_full, next_partial) {
            (None, None) => None,
            (Some(full), partial) if partial.is_none() || full < partial.unwrap() => {
                let (_, end) = self.overlap.tile_ranges[self.range_pos];
                if full == end {
                    self.range_pos += 1;
                    self.range_offset = 0;
                } else {
                    self.range_offset += 1;
                }
                Some(TileCover::Full(full))
            }
            _ => {
                let (idx, ratio) = self.overlap.tiles[self.partial_pos];
                self.partial_pos += 1;
                Some(TileCover::Partial(idx, ratio))
            }
        }
    }
}

/// Height-balanced, bottom-up bulk-loaded R-tree.
///
/// Immutable and freely shareable across threads once built; reads take no
/// locks. Cloning performs a deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RTree {
    dim_num: u32,
    fanout: u32,
    datatype: Datatype,
    /// Levels from root (index 0, always one MBR) down to the leaves.
    levels: Vec<Level>,
}

impl RTree {
    /// Build the tree from leaf MBRs laid out flat as
    /// `lo_0, hi_0, ..., lo_{D-1}, hi_{D-1}` per MBR, already sorted in the
    /// global tile order.
    pub fn build<T: CoordValue>(dim_num: u32, fanout: u32, leaf_mbrs: &[T]) -> Result<Self> {
        if dim_num == 0 {
            return Err(CelldexError::invalid(
                "cannot build R-tree with zero dimensions",
            ));
        }
        if fanout < 2 {
            return Err(CelldexError::invalid(format!(
                "cannot build R-tree with fanout {}; minimum is 2",
                fanout
            )));
        }
        if leaf_mbrs.is_empty() {
            return Err(CelldexError::Empty);
        }
        let mbr_len = 2 * dim_num as usize;
        if leaf_mbrs.len() % mbr_len != 0 {
            return Err(CelldexError::invalid(format!(
                "leaf MBR buffer of {} values is not a multiple of {}",
                leaf_mbrs.len(),
                mbr_len
            )));
        }
        for m in leaf_mbrs.chunks_exact(2) {
            if m[0].is_nan() || m[1].is_nan() {
                return Err(CelldexError::invalid("leaf MBR contains NaN"));
            }
            if m[0] > m[1] {
                return Err(CelldexError::invalid(format!(
                    "leaf MBR interval [{}, {}] is inverted",
                    m[0], m[1]
                )));
            }
        }

        let leaf_num = (leaf_mbrs.len() / mbr_len) as u64;
        let mut levels = vec![Level {
            mbr_num: leaf_num,
            mbrs: T::data_vec(leaf_mbrs.to_vec()),
        }];
        while levels.last().expect("at least one level").mbr_num > 1 {
            let next = Self::build_level::<T>(levels.last().unwrap(), dim_num, fanout);
            levels.push(next);
        }
        levels.reverse();

        Ok(Self {
            dim_num,
            fanout,
            datatype: T::DATATYPE,
            levels,
        })
    }

    /// Group `fanout` consecutive children and emit their tight unions.
    fn build_level<T: CoordValue>(level: &Level, dim_num: u32, fanout: u32) -> Level {
        let mbr_len = 2 * dim_num as usize;
        let children = T::data_slice(&level.mbrs);
        let group_len = mbr_len * fanout as usize;

        let mut parents: Vec<T> = Vec::new();
        for group in children.chunks(group_len) {
            let mut acc: Vec<T> = group[..mbr_len].to_vec();
            for child in group[mbr_len..].chunks_exact(mbr_len) {
                mbr::union_into(&mut acc, child);
            }
            parents.extend_from_slice(&acc);
        }

        Level {
            mbr_num: (parents.len() / mbr_len) as u64,
            mbrs: T::data_vec(parents),
        }
    }

    pub fn dim_num(&self) -> u32 {
        self.dim_num
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Tree height `H`: the leaves live at level `H`, the root at level 0.
    /// A single-leaf tree has height 0.
    pub fn height(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    /// Number of leaf MBRs the tree was built from.
    pub fn leaf_num(&self) -> u64 {
        self.levels.last().map_or(0, |l| l.mbr_num)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Leaves under a full subtree rooted at `level`: `F^(H - level)`.
    ///
    /// The right-most subtree of the tree may hold fewer leaves; this is an
    /// estimate used only for sizing, never for exact bounds. Saturates at
    /// `u64::MAX`.
    pub fn subtree_leaf_num(&self, level: u32) -> u64 {
        if level > self.height() {
            return 0;
        }
        u64::from(self.fanout)
            .checked_pow(self.height() - level)
            .unwrap_or(u64::MAX)
    }

    /// Flat view of the leaf level, in build order.
    pub fn leaf_mbrs<T: CoordValue>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        Ok(T::data_slice(
            &self.levels.last().expect("tree has levels").mbrs,
        ))
    }

    /// One leaf MBR.
    pub fn leaf_mbr<T: CoordValue>(&self, leaf_idx: u64) -> Result<&[T]> {
        let leaves = self.leaf_mbrs::<T>()?;
        let w = 2 * self.dim_num as usize;
        let start = leaf_idx as usize * w;
        if start + w > leaves.len() {
            return Err(CelldexError::invalid(format!(
                "leaf index {} out of bounds ({} leaves)",
                leaf_idx,
                self.leaf_num()
            )));
        }
        Ok(&leaves[start..start + w])
    }

    fn mbr_slice<T: CoordValue>(&self, level: usize, mbr_idx: u64) -> &[T] {
        let w = 2 * self.dim_num as usize;
        let coords = T::data_slice(&self.levels[level].mbrs);
        let start = mbr_idx as usize * w;
        &coords[start..start + w]
    }

    fn check_type<T: CoordValue>(&self) -> Result<()> {
        if T::DATATYPE != self.datatype {
            return Err(CelldexError::invalid(format!(
                "tree datatype is {}, not {}",
                self.datatype,
                T::DATATYPE
            )));
        }
        Ok(())
    }

    /// Compute which leaf tiles a query hyper-rectangle covers.
    ///
    /// `range` uses the flat `lo, hi` pair layout. The result lists tiles in
    /// strictly ascending leaf order; partially covered tiles carry their
    /// overlap ratio in `(0, 1]`. For identical inputs the output is
    /// identical.
    pub fn get_tile_overlap<T: CoordValue>(&self, range: &[T]) -> Result<TileOverlap> {
        self.check_type::<T>()?;
        if range.len() != 2 * self.dim_num as usize {
            return Err(CelldexError::invalid(format!(
                "query range has {} values; expected {}",
                range.len(),
                2 * self.dim_num
            )));
        }

        let mut overlap = TileOverlap::default();
        let leaf_num = self.leaf_num();
        let height = self.height() as usize;

        // Children are pushed in reverse so the traversal pops, and thereby
        // emits, tiles in ascending leaf order.
        let mut stack: Vec<(usize, u64)> = vec![(0, 0)];
        while let Some((level, mbr_idx)) = stack.pop() {
            let node = self.mbr_slice::<T>(level, mbr_idx);
            if !mbr::intersects(range, node) {
                continue;
            }
            if mbr::contains(range, node) {
                let subtree = self.subtree_leaf_num(level as u32);
                let start = mbr_idx.saturating_mul(subtree);
                let end = start + subtree.min(leaf_num - start) - 1;
                overlap.tile_ranges.push((start, end));
            } else if level == height {
                let ratio = mbr::range_overlap_ratio(range, node);
                if ratio > 0.0 {
                    overlap.tiles.push((mbr_idx, ratio));
                }
            } else {
                let child_num = self.levels[level + 1].mbr_num;
                let first = mbr_idx * u64::from(self.fanout);
                let last = (first + u64::from(self.fanout) - 1).min(child_num - 1);
                for child in (first..=last).rev() {
                    stack.push((level + 1, child));
                }
            }
        }

        Ok(overlap)
    }

    /// Overlap ratio between a query range and one MBR; see
    /// [`mbr::range_overlap_ratio`].
    pub fn range_overlap_ratio<T: CoordValue>(&self, range: &[T], mbr: &[T]) -> Result<f64> {
        self.check_type::<T>()?;
        if range.len() != 2 * self.dim_num as usize || mbr.len() != range.len() {
            return Err(CelldexError::invalid(
                "range and MBR must both hold 2 * dim_num values",
            ));
        }
        Ok(mbr::range_overlap_ratio(range, mbr))
    }

    /// Serialize the tree levels.
    ///
    /// Format, all little-endian: `u64` level count, then per level a `u64`
    /// MBR count followed by `mbr_count * 2 * dim_num` raw coordinate values.
    pub fn serialize(&self) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.levels.len() as u64).to_le_bytes());
        for level in &self.levels {
            out.extend_from_slice(&level.mbr_num.to_le_bytes());
            level.mbrs.write_le(&mut out);
        }
        Bytes::from(out)
    }

    /// Rebuild a tree from [`RTree::serialize`] output.
    pub fn deserialize(
        bytes: &[u8],
        dim_num: u32,
        fanout: u32,
        datatype: Datatype,
    ) -> Result<Self> {
        if dim_num == 0 || fanout < 2 {
            return Err(CelldexError::invalid(
                "cannot deserialize R-tree with zero dimensions or fanout below 2",
            ));
        }

        let mut cursor = bytes;
        let level_count = read_u64(&mut cursor)?;
        if level_count == 0 {
            return Err(CelldexError::invalid(
                "serialized R-tree has no levels",
            ));
        }

        let mut levels = Vec::with_capacity(level_count as usize);
        for _ in 0..level_count {
            let mbr_num = read_u64(&mut cursor)?;
            if mbr_num == 0 {
                return Err(CelldexError::invalid(
                    "serialized R-tree level has no MBRs",
                ));
            }
            let value_count = mbr_num as usize * 2 * dim_num as usize;
            let byte_count = value_count * datatype.size() as usize;
            let mbrs = CoordData::read_le(datatype, cursor, value_count)?;
            cursor = &cursor[byte_count..];
            levels.push(Level { mbr_num, mbrs });
        }
        if !cursor.is_empty() {
            return Err(CelldexError::invalid(format!(
                "{} trailing bytes after serialized R-tree",
                cursor.len()
            )));
        }

        // Structural checks: single-MBR root and the fanout grouping law.
        if levels[0].mbr_num != 1 {
            return Err(CelldexError::invalid(
                "serialized R-tree root level must hold exactly one MBR",
            ));
        }
        for k in 0..levels.len() - 1 {
            let expected = levels[k + 1].mbr_num.div_ceil(u64::from(fanout));
            if levels[k].mbr_num != expected {
                return Err(CelldexError::invalid(format!(
                    "serialized R-tree level {} holds {} MBRs; expected {}",
                    k,
                    levels[k].mbr_num,
                    expected
                )));
            }
        }

        Ok(Self {
            dim_num,
            fanout,
            datatype,
            levels,
        })
    }
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.len() < 8 {
        return Err(CelldexError::invalid(
            "serialized R-tree truncated",
        ));
    }
    let (head, tail) = cursor.split_at(8);
    *cursor = tail;
    Ok(u64::from_le_bytes(head.try_into().expect("split at 8")))
}
