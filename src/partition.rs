//! Budget-driven subarray partitioning.
//!
//! The partitioner walks the flattened ND ranges of a subarray and hands out
//! partitions (themselves subarrays) whose estimated result sizes fit caller
//! budgets. It first tries to take the longest prefix of whole ranges
//! that fits, calibrated so the prefix forms a proper hyper-rectangle of
//! ranges. A single range that does not fit is split spatially: the first
//! non-unary dimension in layout order is bisected, and the halves are
//! explored left to right through a LIFO list. A unary range that still
//! exceeds the budget is unsplittable; the caller decides what that means
//! (for queries: the buffers cannot hold one cell).
//!
//! When a query observes that a partition's actual results overflow the
//! buffers despite the estimate, it calls [`SubarrayPartitioner::split_current`]
//! and retries; the estimate is a guide, the observed overflow is the truth.

use std::collections::VecDeque;

use crate::datatype::{CoordValue, dispatch_datatype};
use crate::error::{CelldexError, Result};
use crate::schema::{COORDS, Layout};
use crate::subarray::{ResultSize, Subarray};

/// Result budget, in bytes, for one field.
///
/// `size_fixed` bounds fixed cell bytes (or the offsets of a var attribute);
/// `size_var` bounds var value bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResultBudget {
    pub size_fixed: u64,
    pub size_var: u64,
}

/// The current partition plus the flat-range interval it came from.
#[derive(Debug, Clone)]
struct PartitionInfo {
    partition: Option<Subarray>,
    /// Interval `[start, end]` of flattened ranges of the original subarray
    /// this partition was constructed from. For a partition produced by
    /// single-range splitting both bounds pin the flat index being split.
    start: u64,
    end: u64,
}

/// Progress through the original subarray.
#[derive(Debug, Clone)]
struct State {
    /// Next flat range not yet consumed.
    start: u64,
    /// Last flat range of the subarray.
    end: u64,
    /// Split halves of a single range still awaiting consumption, front
    /// first.
    single_range: VecDeque<Subarray>,
}

/// Iterator-style partitioner over one subarray.
pub struct SubarrayPartitioner {
    subarray: Subarray,
    /// `(field, is_var, budget)` for every budgeted field.
    budget: Vec<(String, bool, ResultBudget)>,
    current: PartitionInfo,
    state: State,
}

impl SubarrayPartitioner {
    /// Create a partitioner; computes the subarray's tile overlap up front.
    pub fn new(mut subarray: Subarray, budgets: &[(String, ResultBudget)]) -> Result<Self> {
        if budgets.is_empty() {
            return Err(CelldexError::invalid(
                "partitioner requires at least one result budget",
            ));
        }
        let schema = subarray.array().schema().clone();
        let mut budget = Vec::with_capacity(budgets.len());
        for (field, b) in budgets {
            let is_var = if field == COORDS {
                false
            } else {
                schema
                    .attribute(field)
                    .ok_or_else(|| {
                        CelldexError::invalid(format!(
                            "cannot set result budget; unknown attribute '{}'",
                            field
                        ))
                    })?
                    .is_var()
            };
            budget.push((field.clone(), is_var, *b));
        }

        subarray.compute_tile_overlap()?;
        let end = subarray.nd_range_num() - 1;
        Ok(Self {
            subarray,
            budget,
            current: PartitionInfo {
                partition: None,
                start: 0,
                end: 0,
            },
            state: State {
                start: 0,
                end,
                single_range: VecDeque::new(),
            },
        })
    }

    /// The subarray being partitioned.
    pub fn subarray(&self) -> &Subarray {
        &self.subarray
    }

    /// The partition produced by the last successful [`Self::next`] or
    /// [`Self::split_current`].
    pub fn current(&self) -> Option<&Subarray> {
        self.current.partition.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Subarray> {
        self.current.partition.as_mut()
    }

    /// `true` when every range has been handed out.
    pub fn done(&self) -> bool {
        self.state.start > self.state.end && self.state.single_range.is_empty()
    }

    /// Advance to the next partition. Returns `true` when the next range is
    /// unsplittable yet over budget.
    pub fn next(&mut self) -> Result<bool> {
        dispatch_datatype!(self.subarray.datatype(), T => { self.next_impl::<T>() })
    }

    /// Split the current partition after its actual results overflowed, and
    /// retry with the left half. Returns `true` when the partition is
    /// unsplittable.
    pub fn split_current(&mut self) -> Result<bool> {
        dispatch_datatype!(self.subarray.datatype(), T => { self.split_current_impl::<T>() })
    }

    fn next_impl<T: CoordValue>(&mut self) -> Result<bool> {
        if self.done() {
            self.current.partition = None;
            return Ok(false);
        }

        // Split halves left over from a previous range take priority.
        if !self.state.single_range.is_empty() {
            return self.next_from_single_range::<T>();
        }

        // Find the longest prefix of whole ranges that fits the budget.
        let interval_found = self.compute_current_start_end()?;
        if !interval_found {
            return self.next_from_single_range::<T>();
        }

        self.calibrate_current_start_end();
        log::debug!(
            "partition from ranges [{}, {}]",
            self.current.start,
            self.current.end
        );
        self.current.partition = Some(self.subarray.slice(self.current.start, self.current.end));
        self.state.start = self.current.end + 1;
        Ok(false)
    }

    fn split_current_impl<T: CoordValue>(&mut self) -> Result<bool> {
        if self.current.partition.is_none() {
            return Err(CelldexError::internal(
                "split_current called with no current partition",
            ));
        }

        if self.current.start < self.current.end {
            // Multi-range partition: halve the interval and recalibrate so
            // the shrunk partition is still a proper hyper-rectangle.
            self.current.end = self.current.start + (self.current.end - self.current.start) / 2;
            self.calibrate_current_start_end();
            self.current.partition =
                Some(self.subarray.slice(self.current.start, self.current.end));
            self.state.start = self.current.end + 1;
            return Ok(false);
        }

        // Single-range partition: push it back, split, retry the left half.
        let partition = self.current.partition.take().expect("checked above");
        self.state.single_range.push_front(partition);
        if self.split_top_single_range::<T>()? {
            return Ok(true);
        }
        self.current.partition = self.state.single_range.pop_front();
        Ok(false)
    }

    /// Accumulate estimated sizes range by range until a budget would be
    /// exceeded; sets `current.[start, end]`. Returns `false` when not even
    /// the first range fits.
    fn compute_current_start_end(&mut self) -> Result<bool> {
        let fragment_num = self.subarray.array().fragments().len();
        let mut sizes: Vec<ResultSize> = vec![ResultSize::default(); self.budget.len()];

        self.current.start = self.state.start;
        for end in self.state.start..=self.state.end {
            for fragment_idx in 0..fragment_num {
                let overlap = &self.subarray.tile_overlap()[fragment_idx][end as usize];
                for (b, (field, is_var, budget)) in self.budget.iter().enumerate() {
                    let size =
                        self.subarray
                            .result_size_for(field, *is_var, fragment_idx, overlap)?;
                    sizes[b].size_fixed += size.size_fixed;
                    sizes[b].size_var += size.size_var;
                    if sizes[b].size_fixed > budget.size_fixed as f64
                        || sizes[b].size_var > budget.size_var as f64
                    {
                        if end == self.current.start {
                            // A single range already overflows.
                            self.current.end = self.current.start;
                            return Ok(false);
                        }
                        self.current.end = end - 1;
                        return Ok(true);
                    }
                }
            }
        }

        self.current.end = self.state.end;
        Ok(true)
    }

    /// Shrink `current.end` so the interval covers either whole slabs of
    /// ranges (full rows or columns of the range grid, per the layout) or a
    /// partial run within a single slab: the shapes expressible as a proper
    /// subarray.
    fn calibrate_current_start_end(&mut self) {
        let dim_num = self.subarray.dim_num() as usize;
        if dim_num == 1 {
            return;
        }

        let start_coords = self.subarray.range_coords(self.current.start);
        let mut end_coords = self.subarray.range_coords(self.current.end);
        let range_num: Vec<u64> = (0..dim_num)
            .map(|d| self.subarray.range_num(d as u32).expect("dim validated"))
            .collect();
        let row_major = self.subarray.effective_layout() != Layout::ColMajor;

        for d in 0..dim_num - 1 {
            let major_dim = if row_major { d } else { dim_num - d - 1 };
            let minor_dims: Vec<usize> = if row_major {
                (major_dim + 1..dim_num).collect()
            } else {
                (0..major_dim).rev().collect()
            };

            let start_minor_at_beginning = minor_dims.iter().all(|&m| start_coords[m] == 0);
            let end_minor_at_end = minor_dims
                .iter()
                .all(|&m| end_coords[m] == range_num[m] - 1);

            if start_minor_at_beginning {
                if end_minor_at_end {
                    break;
                } else if start_coords[major_dim] < end_coords[major_dim] {
                    end_coords[major_dim] -= 1;
                    for &m in &minor_dims {
                        end_coords[m] = range_num[m] - 1;
                    }
                    break;
                }
                // Same major coordinate: look one dimension deeper.
            } else if end_coords[major_dim] > start_coords[major_dim] {
                end_coords[major_dim] = start_coords[major_dim];
                for &m in &minor_dims {
                    end_coords[m] = range_num[m] - 1;
                }
            }
        }

        self.current.end = self.subarray.range_idx(&end_coords);
    }

    /// Produce the next partition by splitting the single range at
    /// `current.start` (or continuing a split already in progress).
    fn next_from_single_range<T: CoordValue>(&mut self) -> Result<bool> {
        if self.state.single_range.is_empty() {
            let single = self.subarray.slice(self.current.start, self.current.end);
            self.state.single_range.push_front(single);
            if self.split_top_single_range::<T>()? {
                return Ok(true);
            }
        }

        // Keep splitting the front until its estimate fits.
        while self.must_split_top()? {
            if self.split_top_single_range::<T>()? {
                return Ok(true);
            }
        }

        self.current.partition = self.state.single_range.pop_front();
        if self.state.single_range.is_empty() {
            // The range being split is fully handed out; retire it.
            self.state.start = self.current.end + 1;
        }
        Ok(false)
    }

    /// Does the front of the split list exceed any budget?
    fn must_split_top(&mut self) -> Result<bool> {
        let budget = &self.budget;
        let range = self
            .state
            .single_range
            .front_mut()
            .expect("split list is non-empty");
        for (field, is_var, b) in budget {
            let (size_fixed, size_var) = if *is_var {
                range.est_result_size_var(field)?
            } else {
                (range.est_result_size(field)?, 0)
            };
            if size_fixed > b.size_fixed || size_var > b.size_var {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Split the front of the list into two halves, left half in front.
    /// Returns `true` when the front is unsplittable (unary).
    fn split_top_single_range<T: CoordValue>(&mut self) -> Result<bool> {
        let range = self
            .state
            .single_range
            .front()
            .expect("split list is non-empty");
        if range.is_unary() {
            return Ok(true);
        }

        let Some((splitting_dim, splitting_point)) = self.compute_splitting_point::<T>(range)?
        else {
            return Ok(true);
        };

        let array = self.subarray.array().clone();
        let layout = self.subarray.layout();
        let mut left = Subarray::new(array.clone(), layout);
        let mut right = Subarray::new(array, layout);
        for dim in 0..self.subarray.dim_num() {
            let (lo, hi) = range.range::<T>(dim, 0)?;
            if dim == splitting_dim {
                left.add_range_unchecked(dim, lo, splitting_point);
                right.add_range_unchecked(dim, T::split_successor(splitting_point), hi);
            } else {
                left.add_range_unchecked(dim, lo, hi);
                right.add_range_unchecked(dim, lo, hi);
            }
        }
        log::debug!(
            "split single range on dimension {} at {}",
            splitting_dim,
            splitting_point
        );

        self.state.single_range.pop_front();
        self.state.single_range.push_front(right);
        self.state.single_range.push_front(left);
        Ok(false)
    }

    /// Choose the splitting dimension (first non-unary in layout order) and
    /// the midpoint. `None` when no dimension can be split further.
    fn compute_splitting_point<T: CoordValue>(
        &self,
        range: &Subarray,
    ) -> Result<Option<(u32, T)>> {
        let dim_num = self.subarray.dim_num();
        let dims: Vec<u32> = if self.subarray.effective_layout() == Layout::ColMajor {
            (0..dim_num).rev().collect()
        } else {
            (0..dim_num).collect()
        };

        for dim in dims {
            let (lo, hi) = range.range::<T>(dim, 0)?;
            if lo != hi {
                let point = T::split_midpoint(lo, hi);
                if point == hi {
                    // Degenerate float interval: no representable midpoint.
                    return Ok(None);
                }
                return Ok(Some((dim, point)));
            }
        }
        Ok(None)
    }
}
