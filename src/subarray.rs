//! Subarray: a query region over an array domain.
//!
//! A subarray is an ordered list of 1D ranges per dimension; the query region
//! is the Cartesian product of those per-dimension range sets. Ranges on one
//! dimension may overlap, and overlapping ranges produce duplicate results;
//! the index never deduplicates. A dimension with no explicit range defaults
//! to the full domain extent until the first range is added.
//!
//! The subarray also owns the cached tile-overlap and estimated-result-size
//! computations that the partitioner and the planner consume.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::array::Array;
use crate::datatype::{CoordData, CoordValue, Datatype, dispatch_datatype};
use crate::error::{CelldexError, Result};
use crate::rtree::{TileCover, TileOverlap};
use crate::schema::{ArrayType, COORDS, Layout};

/// Estimated result size, in bytes, for one field.
///
/// `size_fixed` covers fixed-size cells, or the offsets of a var-sized
/// attribute; `size_var` covers var-sized values. Kept as doubles while
/// accumulating ratio-weighted tile sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResultSize {
    pub size_fixed: f64,
    pub size_var: f64,
}

/// Ordered 1D ranges of one dimension, stored as a flat `lo, hi` pair buffer.
#[derive(Debug, Clone)]
struct RangeSet {
    data: CoordData,
    /// Set while the buffer holds the implicit full-domain range, which is
    /// replaced by the first explicit range.
    has_default: bool,
}

impl RangeSet {
    fn add<T: CoordValue>(&mut self, lo: T, hi: T, is_default: bool) {
        if !is_default && self.has_default {
            self.data = CoordData::new(T::DATATYPE);
            self.has_default = false;
        }
        if is_default {
            self.has_default = true;
        }
        let mut values = T::data_slice(&self.data).to_vec();
        values.push(lo);
        values.push(hi);
        self.data = T::data_vec(values);
    }

    fn range_num(&self) -> u64 {
        (self.data.len() / 2) as u64
    }

    fn get<T: CoordValue>(&self, idx: u64) -> (T, T) {
        let slice = T::data_slice(&self.data);
        (slice[idx as usize * 2], slice[idx as usize * 2 + 1])
    }
}

/// A query region over an array: per-dimension range lists plus a layout
/// hint, with cached overlap and size estimates.
///
/// Mutable until submitted with a query; the query then owns it for its
/// lifetime.
#[derive(Debug, Clone)]
pub struct Subarray {
    array: Arc<Array>,
    layout: Layout,
    ranges: Vec<RangeSet>,
    /// Strides for flattening ND range coordinates, per effective layout.
    range_offsets: Vec<u64>,
    /// `tile_overlap[fragment][flat_range]`, filled by
    /// [`Subarray::compute_tile_overlap`].
    tile_overlap: Vec<Vec<TileOverlap>>,
    tile_overlap_computed: bool,
    est_result_size: FxHashMap<String, ResultSize>,
    est_result_size_computed: bool,
}

impl Subarray {
    /// A subarray covering the whole domain of `array`.
    pub fn new(array: Arc<Array>, layout: Layout) -> Self {
        let schema = array.schema().clone();
        let datatype = schema.datatype();
        let dim_num = schema.dim_num();

        let mut ranges: Vec<RangeSet> = (0..dim_num)
            .map(|_| RangeSet {
                data: CoordData::new(datatype),
                has_default: false,
            })
            .collect();
        dispatch_datatype!(datatype, T => {
            let bounds = schema.domain().bounds::<T>();
            for (dim, set) in ranges.iter_mut().enumerate() {
                set.add(bounds[dim * 2], bounds[dim * 2 + 1], true);
            }
        });

        let mut subarray = Self {
            array,
            layout,
            ranges,
            range_offsets: Vec::new(),
            tile_overlap: Vec::new(),
            tile_overlap_computed: false,
            est_result_size: FxHashMap::default(),
            est_result_size_computed: false,
        };
        subarray.compute_range_offsets();
        subarray
    }

    pub fn array(&self) -> &Arc<Array> {
        &self.array
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn dim_num(&self) -> u32 {
        self.array.schema().dim_num()
    }

    pub fn datatype(&self) -> Datatype {
        self.array.schema().datatype()
    }

    /// The layout used for flattening ranges: `GlobalOrder` and `Unordered`
    /// fall back to the array cell order, which yields the most favorable
    /// tile access pattern.
    pub fn effective_layout(&self) -> Layout {
        match self.layout {
            Layout::RowMajor | Layout::ColMajor => self.layout,
            Layout::GlobalOrder | Layout::Unordered => self.array.schema().cell_order(),
        }
    }

    /// Add `[lo, hi]` on dimension `dim`.
    ///
    /// Fails with `InvalidArgument` on an inverted or NaN range and with
    /// `OutOfDomain` when the range lies wholly outside the dimension
    /// domain. A range that overhangs the domain on one side is clamped to
    /// the domain bound; the clamped range is what callers later read back.
    /// Ranges are appended as-is; overlapping ranges are preserved and
    /// produce duplicate results.
    pub fn add_range<T: CoordValue>(&mut self, dim: u32, lo: T, hi: T) -> Result<()> {
        if T::DATATYPE != self.datatype() {
            return Err(CelldexError::invalid(format!(
                "subarray domain is {}, not {}",
                self.datatype(),
                T::DATATYPE
            )));
        }
        if dim >= self.dim_num() {
            return Err(CelldexError::invalid(format!(
                "invalid dimension index {} ({} dimensions)",
                dim,
                self.dim_num()
            )));
        }
        if lo.is_nan() || hi.is_nan() {
            return Err(CelldexError::invalid(
                "cannot add range; bounds contain NaN",
            ));
        }
        if lo > hi {
            return Err(CelldexError::invalid(format!(
                "cannot add range; lower bound {} exceeds upper bound {}",
                lo, hi
            )));
        }

        let (dom_lo, dom_hi) = self.array.schema().domain().dim_bounds::<T>(dim)?;
        if hi < dom_lo || lo > dom_hi {
            return Err(CelldexError::OutOfDomain(format!(
                "range [{}, {}] on dimension {} lies outside the domain [{}, {}]",
                lo, hi, dim, dom_lo, dom_hi
            )));
        }
        let clamped_lo = if lo < dom_lo { dom_lo } else { lo };
        let clamped_hi = if hi > dom_hi { dom_hi } else { hi };
        if clamped_lo > lo || clamped_hi < hi {
            log::debug!(
                "clamped range [{}, {}] to domain [{}, {}] on dimension {}",
                lo,
                hi,
                clamped_lo,
                clamped_hi,
                dim
            );
        }

        self.add_range_unchecked(dim, clamped_lo, clamped_hi);
        Ok(())
    }

    /// Append an already-validated in-domain range. Used by the partitioner
    /// when it splits ranges it obtained from this subarray.
    pub(crate) fn add_range_unchecked<T: CoordValue>(&mut self, dim: u32, lo: T, hi: T) {
        self.invalidate_caches();
        self.ranges[dim as usize].add(lo, hi, false);
        self.compute_range_offsets();
    }

    fn invalidate_caches(&mut self) {
        self.tile_overlap.clear();
        self.tile_overlap_computed = false;
        self.est_result_size.clear();
        self.est_result_size_computed = false;
    }

    /// Number of ranges on one dimension.
    pub fn range_num(&self, dim: u32) -> Result<u64> {
        self.ranges
            .get(dim as usize)
            .map(RangeSet::range_num)
            .ok_or_else(|| CelldexError::invalid(format!("invalid dimension index {}", dim)))
    }

    /// One 1D range.
    pub fn range<T: CoordValue>(&self, dim: u32, idx: u64) -> Result<(T, T)> {
        if T::DATATYPE != self.datatype() {
            return Err(CelldexError::invalid(format!(
                "subarray domain is {}, not {}",
                self.datatype(),
                T::DATATYPE
            )));
        }
        let set = self
            .ranges
            .get(dim as usize)
            .ok_or_else(|| CelldexError::invalid(format!("invalid dimension index {}", dim)))?;
        if idx >= set.range_num() {
            return Err(CelldexError::invalid(format!(
                "invalid range index {} on dimension {} ({} ranges)",
                idx,
                dim,
                set.range_num()
            )));
        }
        Ok(set.get(idx))
    }

    /// Total number of ND ranges: the product of per-dimension counts.
    pub fn nd_range_num(&self) -> u64 {
        self.ranges.iter().map(RangeSet::range_num).product()
    }

    /// `true` when the subarray is a single ND range whose every 1D range is
    /// a single point.
    pub fn is_unary(&self) -> bool {
        if self.nd_range_num() != 1 {
            return false;
        }
        dispatch_datatype!(self.datatype(), T => {
            self.ranges.iter().all(|set| {
                let (lo, hi) = set.get::<T>(0);
                lo == hi
            })
        })
    }

    /// Strides that map between flat range indices and per-dimension range
    /// coordinates, following the effective layout.
    fn compute_range_offsets(&mut self) {
        let dim_num = self.dim_num() as usize;
        let mut offsets = vec![1u64; dim_num];
        match self.effective_layout() {
            Layout::ColMajor => {
                for i in 1..dim_num {
                    offsets[i] = offsets[i - 1] * self.ranges[i - 1].range_num();
                }
            }
            _ => {
                for i in (0..dim_num.saturating_sub(1)).rev() {
                    offsets[i] = offsets[i + 1] * self.ranges[i + 1].range_num();
                }
            }
        }
        self.range_offsets = offsets;
    }

    /// Per-dimension range coordinates of a flat range index.
    pub fn range_coords(&self, flat_idx: u64) -> Vec<u64> {
        let dim_num = self.dim_num() as usize;
        let mut coords = vec![0u64; dim_num];
        let mut tmp = flat_idx;
        match self.effective_layout() {
            Layout::ColMajor => {
                for i in (0..dim_num).rev() {
                    coords[i] = tmp / self.range_offsets[i];
                    tmp %= self.range_offsets[i];
                }
            }
            _ => {
                for i in 0..dim_num {
                    coords[i] = tmp / self.range_offsets[i];
                    tmp %= self.range_offsets[i];
                }
            }
        }
        coords
    }

    /// Flat range index of per-dimension range coordinates.
    pub fn range_idx(&self, coords: &[u64]) -> u64 {
        coords
            .iter()
            .zip(&self.range_offsets)
            .map(|(c, off)| c * off)
            .sum()
    }

    /// The ND range at a flat index, as a flat `lo, hi` pair buffer suitable
    /// for [`crate::rtree::RTree::get_tile_overlap`].
    pub fn nd_range<T: CoordValue>(&self, flat_idx: u64) -> Result<Vec<T>> {
        if T::DATATYPE != self.datatype() {
            return Err(CelldexError::invalid(format!(
                "subarray domain is {}, not {}",
                self.datatype(),
                T::DATATYPE
            )));
        }
        if flat_idx >= self.nd_range_num() {
            return Err(CelldexError::invalid(format!(
                "flat range index {} out of bounds ({} ranges)",
                flat_idx,
                self.nd_range_num()
            )));
        }
        let coords = self.range_coords(flat_idx);
        let mut out = Vec::with_capacity(self.dim_num() as usize * 2);
        for (dim, c) in coords.iter().enumerate() {
            let (lo, hi) = self.ranges[dim].get::<T>(*c);
            out.push(lo);
            out.push(hi);
        }
        Ok(out)
    }

    /// A subarray holding the ND ranges in the flat interval
    /// `[start, end]`. The interval must describe a proper hyper-rectangle
    /// of range coordinates (the partitioner calibrates its intervals to
    /// guarantee this).
    pub fn slice(&self, start: u64, end: u64) -> Subarray {
        let mut out = Subarray::new(self.array.clone(), self.layout);
        let start_coords = self.range_coords(start);
        let end_coords = self.range_coords(end);
        dispatch_datatype!(self.datatype(), T => {
            for dim in 0..self.dim_num() {
                for r in start_coords[dim as usize]..=end_coords[dim as usize] {
                    let (lo, hi) = self.ranges[dim as usize].get::<T>(r);
                    out.add_range_unchecked(dim, lo, hi);
                }
            }
        });
        out
    }

    /// Compute (and cache) the tile overlap of every flat range against
    /// every fragment's R-tree.
    pub fn compute_tile_overlap(&mut self) -> Result<()> {
        if self.tile_overlap_computed {
            return Ok(());
        }
        let fragment_num = self.array.fragments().len();
        let range_num = self.nd_range_num();
        let mut tile_overlap = Vec::with_capacity(fragment_num);
        dispatch_datatype!(self.datatype(), T => {
            for fragment in self.array.fragments() {
                let mut per_range = Vec::with_capacity(range_num as usize);
                for j in 0..range_num {
                    let range = self.nd_range::<T>(j)?;
                    per_range.push(fragment.rtree().get_tile_overlap::<T>(&range)?);
                }
                tile_overlap.push(per_range);
            }
        });
        self.tile_overlap = tile_overlap;
        self.tile_overlap_computed = true;
        Ok(())
    }

    /// Cached overlap, indexed `[fragment][flat_range]`. Call
    /// [`Subarray::compute_tile_overlap`] first.
    pub fn tile_overlap(&self) -> &[Vec<TileOverlap>] {
        &self.tile_overlap
    }

    /// Estimated result size, in bytes, for a fixed-size field (an attribute
    /// or [`COORDS`]). A conservative ratio-weighted estimate, never an
    /// exactness guarantee.
    pub fn est_result_size(&mut self, field: &str) -> Result<u64> {
        self.check_estimable(field, false)?;
        self.compute_est_result_size()?;
        Ok(self
            .est_result_size
            .get(field)
            .map_or(0, |r| r.size_fixed.ceil() as u64))
    }

    /// Estimated result size for a var-sized attribute:
    /// `(offsets_bytes, values_bytes)`.
    pub fn est_result_size_var(&mut self, field: &str) -> Result<(u64, u64)> {
        self.check_estimable(field, true)?;
        self.compute_est_result_size()?;
        let r = self.est_result_size.get(field).copied().unwrap_or_default();
        Ok((r.size_fixed.ceil() as u64, r.size_var.ceil() as u64))
    }

    fn check_estimable(&self, field: &str, want_var: bool) -> Result<()> {
        if self.array.schema().array_type() == ArrayType::Dense {
            return Err(CelldexError::invalid(
                "cannot estimate result size; not supported for dense arrays yet",
            ));
        }
        if field == COORDS {
            if want_var {
                return Err(CelldexError::invalid(
                    "cannot estimate result size; coordinates are fixed-sized",
                ));
            }
            return Ok(());
        }
        let attr = self.array.schema().attribute(field).ok_or_else(|| {
            CelldexError::invalid(format!("cannot estimate result size; unknown attribute '{}'", field))
        })?;
        if attr.is_var() != want_var {
            return Err(CelldexError::invalid(format!(
                "cannot estimate result size; attribute '{}' is {}-sized",
                field,
                if attr.is_var() { "var" } else { "fixed" }
            )));
        }
        Ok(())
    }

    fn compute_est_result_size(&mut self) -> Result<()> {
        if self.est_result_size_computed {
            return Ok(());
        }
        self.compute_tile_overlap()?;

        let schema = self.array.schema().clone();
        let mut totals: FxHashMap<String, ResultSize> = FxHashMap::default();
        let fields: Vec<(String, bool)> = schema
            .attributes()
            .iter()
            .map(|a| (a.name().to_string(), a.is_var()))
            .chain(std::iter::once((COORDS.to_string(), false)))
            .collect();

        for fragment_idx in 0..self.array.fragments().len() {
            for j in 0..self.nd_range_num() {
                let overlap = &self.tile_overlap[fragment_idx][j as usize];
                for (name, var_size) in &fields {
                    let size = self.result_size_for(name, *var_size, fragment_idx, overlap)?;
                    let entry = totals.entry(name.clone()).or_default();
                    entry.size_fixed += size.size_fixed;
                    entry.size_var += size.size_var;
                }
            }
        }

        self.est_result_size = totals;
        self.est_result_size_computed = true;
        Ok(())
    }

    /// Size contribution of one tile-overlap entry for one field: full tiles
    /// count whole, partial tiles are weighted by their overlap ratio.
    pub(crate) fn result_size_for(
        &self,
        field: &str,
        var_size: bool,
        fragment_idx: usize,
        overlap: &TileOverlap,
    ) -> Result<ResultSize> {
        let fragment = &self.array.fragments()[fragment_idx];
        let mut out = ResultSize::default();
        for cover in overlap.iter() {
            match cover {
                TileCover::Full(tid) => {
                    out.size_fixed += fragment.tile_size(field, tid)? as f64;
                    if var_size {
                        out.size_var += fragment.tile_var_size(field, tid)? as f64;
                    }
                }
                TileCover::Partial(tid, ratio) => {
                    out.size_fixed += fragment.tile_size(field, tid)? as f64 * ratio;
                    if var_size {
                        out.size_var += fragment.tile_var_size(field, tid)? as f64 * ratio;
                    }
                }
            }
        }
        Ok(out)
    }
}
