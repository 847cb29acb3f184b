//! Read queries and the incomplete-result protocol.
//!
//! A query streams the cells selected by a subarray into caller-sized
//! buffers. Each `submit` delivers the results of one partition of the
//! subarray (see [`crate::partition`]) and reports `Incomplete` until the
//! final partition, which reports `Complete`. Buffers too small for the next
//! partition cause the partition to be split and retried within the same
//! submit; buffers too small for even a single cell fail the query. The
//! concatenation of all bytes delivered across submits is identical
//! regardless of how the buffers were sized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rustc_hash::FxHashMap;

use crate::array::Array;
use crate::datatype::{CoordValue, dispatch_datatype};
use crate::error::{CelldexError, Result};
use crate::mbr;
use crate::partition::{ResultBudget, SubarrayPartitioner};
use crate::rtree::TileCover;
use crate::schema::{ArrayType, COORDS, CellSize, Layout};
use crate::storage::{DecodedTile, cell_cmp, decode_tile};
use crate::subarray::Subarray;

/// State of a query.
///
/// `Uninitialized` becomes `InProgress` on the first submit; every submit
/// ends in `Incomplete`, `Complete`, or `Failed`. Submitting again from
/// `Incomplete` continues the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Uninitialized,
    InProgress,
    Incomplete,
    Complete,
    Failed,
}

/// Shared cancellation handle for a query.
///
/// Cancelling takes effect at the next partition advance; cells already
/// being copied are delivered, then the query fails with `Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::Relaxed)
    }
}

/// One caller-sized result buffer.
#[derive(Debug)]
struct FieldBuffer {
    var: bool,
    /// Bytes per cell in the fixed buffer: the cell size for fixed fields,
    /// 8 (one offset) for var fields.
    fixed_cell_size: u64,
    fixed_capacity: u64,
    var_capacity: u64,
    fixed: Vec<u8>,
    var_values: Vec<u8>,
    result_cells: u64,
}

impl FieldBuffer {
    fn reset(&mut self) {
        self.fixed.clear();
        self.var_values.clear();
        self.result_cells = 0;
    }
}

/// A matched result cell, addressed by its physical position.
#[derive(Debug, Clone, Copy)]
struct MatchedCell {
    fragment: usize,
    tile: u64,
    pos: usize,
}

/// Decoded tiles fetched during one submit.
#[derive(Default)]
struct TileCache {
    tiles: FxHashMap<(usize, u64), DecodedTile>,
}

impl TileCache {
    fn load(&mut self, array: &Array, fragment: usize, tile: u64) -> Result<&DecodedTile> {
        let key = (fragment, tile);
        if !self.tiles.contains_key(&key) {
            let decoded = decode_tile(array.schema(), array.fragments()[fragment].as_ref(), tile)?;
            self.tiles.insert(key, decoded);
        }
        Ok(&self.tiles[&key])
    }

    fn get(&self, fragment: usize, tile: u64) -> &DecodedTile {
        &self.tiles[&(fragment, tile)]
    }
}

/// A read query against a sparse array.
pub struct Query {
    array: Arc<Array>,
    layout: Layout,
    subarray: Option<Subarray>,
    buffers: Vec<(String, FieldBuffer)>,
    status: QueryStatus,
    cancel: CancelToken,
    partitioner: Option<SubarrayPartitioner>,
    /// Advance the partitioner before reading again.
    need_next: bool,
}

impl Query {
    pub fn new(array: Arc<Array>) -> Self {
        Self {
            array,
            layout: Layout::Unordered,
            subarray: None,
            buffers: Vec::new(),
            status: QueryStatus::Uninitialized,
            cancel: CancelToken::new(),
            partitioner: None,
            need_next: true,
        }
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Handle for cancelling this query, usable from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation; the next submit (or the next partition advance
    /// of a running submit) fails with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn check_configurable(&self) -> Result<()> {
        if self.status != QueryStatus::Uninitialized {
            return Err(CelldexError::invalid(
                "cannot reconfigure a query after submission",
            ));
        }
        Ok(())
    }

    /// Restrict the query to a subarray. Defaults to the whole domain.
    pub fn set_subarray(&mut self, subarray: Subarray) -> Result<&mut Self> {
        self.check_configurable()?;
        if !Arc::ptr_eq(subarray.array(), &self.array) {
            return Err(CelldexError::invalid(
                "subarray belongs to a different array",
            ));
        }
        self.subarray = Some(subarray);
        Ok(self)
    }

    /// Result ordering; see [`Layout`].
    pub fn set_layout(&mut self, layout: Layout) -> Result<&mut Self> {
        self.check_configurable()?;
        self.layout = layout;
        Ok(self)
    }

    /// Attach a result buffer of `capacity` bytes for a fixed-size field (an
    /// attribute or [`COORDS`]).
    pub fn set_buffer(&mut self, field: &str, capacity: u64) -> Result<&mut Self> {
        self.check_configurable()?;
        let cell_size = match self.field_cell_size(field)? {
            CellSize::Fixed(s) => u64::from(s),
            CellSize::Var => {
                return Err(CelldexError::invalid(format!(
                    "attribute '{}' is var-sized; use set_buffer_var",
                    field
                )));
            }
        };
        self.insert_buffer(
            field,
            FieldBuffer {
                var: false,
                fixed_cell_size: cell_size,
                fixed_capacity: capacity,
                var_capacity: 0,
                fixed: Vec::new(),
                var_values: Vec::new(),
                result_cells: 0,
            },
        );
        Ok(self)
    }

    /// Attach offset and value buffers for a var-sized attribute.
    pub fn set_buffer_var(
        &mut self,
        field: &str,
        offsets_capacity: u64,
        values_capacity: u64,
    ) -> Result<&mut Self> {
        self.check_configurable()?;
        match self.field_cell_size(field)? {
            CellSize::Var => {}
            CellSize::Fixed(_) => {
                return Err(CelldexError::invalid(format!(
                    "attribute '{}' is fixed-size; use set_buffer",
                    field
                )));
            }
        }
        self.insert_buffer(
            field,
            FieldBuffer {
                var: true,
                fixed_cell_size: 8,
                fixed_capacity: offsets_capacity,
                var_capacity: values_capacity,
                fixed: Vec::new(),
                var_values: Vec::new(),
                result_cells: 0,
            },
        );
        Ok(self)
    }

    fn field_cell_size(&self, field: &str) -> Result<CellSize> {
        self.array.schema().cell_size(field).ok_or_else(|| {
            CelldexError::invalid(format!("unknown attribute '{}'", field))
        })
    }

    fn insert_buffer(&mut self, field: &str, buffer: FieldBuffer) {
        if let Some(slot) = self.buffers.iter_mut().find(|(name, _)| name == field) {
            slot.1 = buffer;
        } else {
            self.buffers.push((field.to_string(), buffer));
        }
    }

    /// Estimated result size, in bytes, for a fixed-size field.
    pub fn est_result_size(&mut self, field: &str) -> Result<u64> {
        self.ensure_subarray()?;
        self.subarray
            .as_mut()
            .expect("ensured above")
            .est_result_size(field)
    }

    /// Estimated `(offsets_bytes, values_bytes)` for a var-sized attribute.
    pub fn est_result_size_var(&mut self, field: &str) -> Result<(u64, u64)> {
        self.ensure_subarray()?;
        self.subarray
            .as_mut()
            .expect("ensured above")
            .est_result_size_var(field)
    }

    fn ensure_subarray(&mut self) -> Result<()> {
        if self.subarray.is_none() {
            if self.partitioner.is_some() {
                return Err(CelldexError::invalid(
                    "estimates are available before submission only",
                ));
            }
            self.subarray = Some(Subarray::new(self.array.clone(), self.layout));
        }
        Ok(())
    }

    /// Bytes delivered into a field's fixed buffer (cell bytes, or offsets
    /// for a var attribute) by the last submit.
    pub fn buffer(&self, field: &str) -> Option<&[u8]> {
        self.buffers
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, b)| b.fixed.as_slice())
    }

    /// Bytes delivered into a var attribute's value buffer by the last
    /// submit.
    pub fn var_buffer(&self, field: &str) -> Option<&[u8]> {
        self.buffers
            .iter()
            .find(|(name, _)| name == field)
            .filter(|(_, b)| b.var)
            .map(|(_, b)| b.var_values.as_slice())
    }

    /// Element counts delivered by the last submit, per field:
    /// `(offsets, values)`. Fixed attributes report `(0, cells)`, the coords
    /// field `(0, cells * dim_num)`, var attributes
    /// `(cells, value_bytes)`.
    pub fn result_buffer_elements(&self) -> FxHashMap<String, (u64, u64)> {
        let dim_num = u64::from(self.array.schema().dim_num());
        self.buffers
            .iter()
            .map(|(name, b)| {
                let elements = if b.var {
                    (b.result_cells, b.var_values.len() as u64)
                } else if name == COORDS {
                    (0, b.result_cells * dim_num)
                } else {
                    (0, b.result_cells)
                };
                (name.clone(), elements)
            })
            .collect()
    }

    /// Run the query until the buffers fill or the stream ends.
    ///
    /// Returns `Incomplete` when more results remain (resubmit to continue),
    /// `Complete` when the stream is exhausted. Every submit with remaining
    /// results delivers at least one cell, provided each buffer can hold one
    /// cell of its field; otherwise the query fails with `BufferTooSmall`.
    pub fn submit(&mut self) -> Result<QueryStatus> {
        match self.status {
            QueryStatus::Complete => return Ok(QueryStatus::Complete),
            QueryStatus::Failed => {
                return Err(CelldexError::invalid(
                    "cannot submit; query is in a failed state",
                ));
            }
            _ => {}
        }

        match self.submit_inner() {
            Ok(status) => {
                self.status = status;
                Ok(status)
            }
            Err(e) => {
                log::debug!("query failed: {}", e);
                self.status = QueryStatus::Failed;
                Err(e)
            }
        }
    }

    fn submit_inner(&mut self) -> Result<QueryStatus> {
        if self.status == QueryStatus::Uninitialized {
            self.initialize()?;
        }
        self.status = QueryStatus::InProgress;
        for (_, buffer) in &mut self.buffers {
            buffer.reset();
        }

        let mut cache = TileCache::default();
        loop {
            if self.cancel.is_cancelled() {
                return Err(CelldexError::Cancelled);
            }

            if self.need_next {
                let partitioner = self.partitioner.as_mut().expect("initialized");
                if partitioner.done() {
                    return Ok(QueryStatus::Complete);
                }
                if partitioner.next()? {
                    return Err(CelldexError::BufferTooSmall(
                        "a single cell exceeds the result budget; enlarge the buffers".into(),
                    ));
                }
                self.need_next = false;
            }

            let partitioner = self.partitioner.as_mut().expect("initialized");
            let partition = partitioner
                .current_mut()
                .ok_or_else(|| CelldexError::internal("partitioner lost its current partition"))?;
            let cells = gather_partition(&self.array, self.layout, partition, &mut cache)?;

            if self.fits(&cells, &cache) {
                self.copy_cells(&cells, &cache)?;
                self.need_next = true;
                if !cells.is_empty() {
                    let done = self.partitioner.as_ref().expect("initialized").done();
                    return Ok(if done {
                        QueryStatus::Complete
                    } else {
                        QueryStatus::Incomplete
                    });
                }
                // An empty partition: keep going so the submit makes
                // progress.
            } else {
                let partitioner = self.partitioner.as_mut().expect("initialized");
                if partitioner.split_current()? {
                    return Err(CelldexError::BufferTooSmall(
                        "results of a single cell exceed the buffer capacity; enlarge the buffers"
                            .into(),
                    ));
                }
            }
        }
    }

    fn initialize(&mut self) -> Result<()> {
        if self.array.schema().array_type() == ArrayType::Dense {
            return Err(CelldexError::invalid(
                "cannot submit; read queries are not supported for dense arrays yet",
            ));
        }
        if self.buffers.is_empty() {
            return Err(CelldexError::invalid(
                "cannot submit; no result buffers set",
            ));
        }
        for (name, buffer) in &self.buffers {
            let holds_one_cell = if buffer.var {
                buffer.fixed_capacity >= 8 && buffer.var_capacity >= 1
            } else {
                buffer.fixed_capacity >= buffer.fixed_cell_size
            };
            if !holds_one_cell {
                return Err(CelldexError::BufferTooSmall(format!(
                    "buffer for '{}' cannot hold a single cell",
                    name
                )));
            }
        }

        let subarray = self
            .subarray
            .take()
            .unwrap_or_else(|| Subarray::new(self.array.clone(), self.layout));
        let budgets: Vec<(String, ResultBudget)> = self
            .buffers
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    ResultBudget {
                        size_fixed: b.fixed_capacity,
                        size_var: b.var_capacity,
                    },
                )
            })
            .collect();
        self.partitioner = Some(SubarrayPartitioner::new(subarray, &budgets)?);
        self.need_next = true;
        Ok(())
    }

    /// Would this partition's cells fit every buffer?
    fn fits(&self, cells: &[MatchedCell], cache: &TileCache) -> bool {
        let n = cells.len() as u64;
        for (name, buffer) in &self.buffers {
            if n * buffer.fixed_cell_size > buffer.fixed_capacity {
                return false;
            }
            if buffer.var {
                let total: u64 = cells
                    .iter()
                    .map(|c| {
                        cache
                            .get(c.fragment, c.tile)
                            .attr(name)
                            .map_or(0, |a| a.cell_bytes(c.pos).len() as u64)
                    })
                    .sum();
                if total > buffer.var_capacity {
                    return false;
                }
            }
        }
        true
    }

    /// Copy the ordered cells into every buffer.
    fn copy_cells(&mut self, cells: &[MatchedCell], cache: &TileCache) -> Result<()> {
        let schema = self.array.schema().clone();
        let dim_num = schema.dim_num() as usize;
        for (name, buffer) in &mut self.buffers {
            for cell in cells {
                let tile = cache.get(cell.fragment, cell.tile);
                if name == COORDS {
                    dispatch_datatype!(schema.datatype(), T => {
                        for v in tile.cell_coords::<T>(cell.pos, dim_num) {
                            v.write_le(&mut buffer.fixed);
                        }
                    });
                } else {
                    let bytes = tile.attr(name)?.cell_bytes(cell.pos);
                    if buffer.var {
                        buffer
                            .fixed
                            .extend_from_slice(&(buffer.var_values.len() as u64).to_le_bytes());
                        buffer.var_values.extend_from_slice(bytes);
                    } else {
                        buffer.fixed.extend_from_slice(bytes);
                    }
                }
            }
            buffer.result_cells = cells.len() as u64;
        }
        Ok(())
    }
}

/// Collect the cells of one partition, ordered per the query layout.
///
/// Ranges are visited in their flattened order. Within each range,
/// row-/col-major layouts sort cells by coordinate; global-order and
/// unordered layouts keep the leaf-tile order. Cells matched by several
/// ranges are reported once per range; duplicates are the documented
/// Cartesian semantics.
fn gather_partition(
    array: &Array,
    layout: Layout,
    partition: &mut Subarray,
    cache: &mut TileCache,
) -> Result<Vec<MatchedCell>> {
    partition.compute_tile_overlap()?;
    let dim_num = array.schema().dim_num() as usize;
    let mut out = Vec::new();

    dispatch_datatype!(array.schema().datatype(), T => {
        for j in 0..partition.nd_range_num() {
            let range = partition.nd_range::<T>(j)?;
            let mut matched: Vec<MatchedCell> = Vec::new();
            for fragment in 0..array.fragments().len() {
                let overlap = partition.tile_overlap()[fragment][j as usize].clone();
                for cover in overlap.iter() {
                    let tile_idx = cover.tile_idx();
                    let tile = cache.load(array, fragment, tile_idx)?;
                    match cover {
                        TileCover::Full(_) => {
                            matched.extend((0..tile.cell_num as usize).map(|pos| MatchedCell {
                                fragment,
                                tile: tile_idx,
                                pos,
                            }));
                        }
                        TileCover::Partial(..) => {
                            for pos in 0..tile.cell_num as usize {
                                let coords = tile.cell_coords::<T>(pos, dim_num);
                                if mbr::contains_point(&range, coords) {
                                    matched.push(MatchedCell {
                                        fragment,
                                        tile: tile_idx,
                                        pos,
                                    });
                                }
                            }
                        }
                    }
                }
            }

            if matches!(layout, Layout::RowMajor | Layout::ColMajor) {
                matched.sort_by(|a, b| {
                    cell_cmp(
                        cache.get(a.fragment, a.tile).cell_coords::<T>(a.pos, dim_num),
                        cache.get(b.fragment, b.tile).cell_coords::<T>(b.pos, dim_num),
                        layout,
                    )
                });
            }
            out.extend(matched);
        }
    });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::rtree::RTree;
    use crate::schema::{ArraySchema, Attribute, Domain};
    use crate::storage::{AttributeData, TileStore};

    fn diagonal_array() -> Arc<Array> {
        let domain = Domain::new(&[("rows", 0i32, 3), ("cols", 0i32, 3)]).unwrap();
        let schema = ArraySchema::sparse(domain)
            .with_attribute(Attribute::fixed("a", 4).unwrap())
            .with_fanout(10);
        let mut array = Array::create(schema).unwrap();
        array
            .write(
                &[0i32, 0, 1, 1, 2, 2, 3, 3],
                &[("a", AttributeData::fixed(&[1i32, 2, 3, 4]))],
            )
            .unwrap();
        Arc::new(array)
    }

    fn read_i32s(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_submit_without_buffers_fails() {
        let mut query = Query::new(diagonal_array());
        assert!(query.submit().is_err());
        assert_eq!(query.status(), QueryStatus::Failed);
        // A failed query stays failed.
        assert!(query.submit().is_err());
    }

    #[test]
    fn test_buffer_below_one_cell_fails() {
        let mut query = Query::new(diagonal_array());
        query.set_buffer("a", 3).unwrap();
        let err = query.submit().unwrap_err();
        assert!(matches!(err, CelldexError::BufferTooSmall(_)));
        assert_eq!(query.status(), QueryStatus::Failed);
    }

    #[test]
    fn test_unknown_buffer_field_rejected() {
        let mut query = Query::new(diagonal_array());
        assert!(query.set_buffer("ghost", 64).is_err());
        assert!(query.set_buffer_var("a", 64, 64).is_err());
    }

    #[test]
    fn test_whole_domain_read() {
        let mut query = Query::new(diagonal_array());
        query.set_buffer("a", 64).unwrap();
        query.set_buffer(COORDS, 256).unwrap();
        assert_eq!(query.submit().unwrap(), QueryStatus::Complete);

        assert_eq!(read_i32s(query.buffer("a").unwrap()), vec![1, 2, 3, 4]);
        let elements = query.result_buffer_elements();
        assert_eq!(elements["a"], (0, 4));
        assert_eq!(elements[COORDS], (0, 8));
        assert_eq!(
            read_i32s(query.buffer(COORDS).unwrap()),
            vec![0, 0, 1, 1, 2, 2, 3, 3]
        );
    }

    #[test]
    fn test_submit_after_complete_is_a_noop() {
        let mut query = Query::new(diagonal_array());
        query.set_buffer("a", 64).unwrap();
        assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
        assert_eq!(query.submit().unwrap(), QueryStatus::Complete);
    }

    #[test]
    fn test_reconfigure_after_submit_rejected() {
        let mut query = Query::new(diagonal_array());
        query.set_buffer("a", 4).unwrap();
        let _ = query.submit();
        assert!(query.set_layout(Layout::RowMajor).is_err());
        assert!(query.set_buffer("a", 64).is_err());
    }

    #[test]
    fn test_incomplete_stream_one_cell_at_a_time() {
        let array = diagonal_array();
        let mut query = Query::new(array.clone());
        let mut subarray = Subarray::new(array, Layout::Unordered);
        subarray.add_range(0, 0i32, 3).unwrap();
        query.set_subarray(subarray).unwrap();
        query.set_buffer("a", 4).unwrap();

        let mut collected = Vec::new();
        loop {
            let status = query.submit().unwrap();
            collected.extend(read_i32s(query.buffer("a").unwrap()));
            match status {
                QueryStatus::Incomplete => continue,
                QueryStatus::Complete => break,
                other => panic!("unexpected status {:?}", other),
            }
        }
        assert_eq!(collected, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_before_submit() {
        let mut query = Query::new(diagonal_array());
        query.set_buffer("a", 64).unwrap();
        let token = query.cancel_token();
        token.cancel();
        assert_eq!(query.submit().unwrap_err(), CelldexError::Cancelled);
        assert_eq!(query.status(), QueryStatus::Failed);
    }

    #[test]
    fn test_dense_read_rejected() {
        let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
        let schema = ArraySchema::dense(domain).with_attribute(Attribute::fixed("a", 4).unwrap());
        let array = Arc::new(Array::create(schema).unwrap());
        let mut query = Query::new(array);
        query.set_buffer("a", 64).unwrap();
        assert!(query.submit().is_err());
    }

    /// A fragment whose tile fetches always fail.
    #[derive(Debug)]
    struct BrokenStore {
        rtree: RTree,
    }

    impl TileStore for BrokenStore {
        fn rtree(&self) -> &RTree {
            &self.rtree
        }

        fn tile_num(&self) -> u64 {
            1
        }

        fn cells_per_tile(&self, _leaf_idx: u64) -> u64 {
            1
        }

        fn tile_size(&self, _field: &str, _leaf_idx: u64) -> Result<u64> {
            Ok(4)
        }

        fn tile_var_size(&self, _field: &str, _leaf_idx: u64) -> Result<u64> {
            Ok(0)
        }

        fn fetch_leaf_tile(&self, _leaf_idx: u64) -> Result<Bytes> {
            Err(CelldexError::Io("disk unplugged".into()))
        }
    }

    #[test]
    fn test_fetch_failure_surfaces_as_io() {
        let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
        let schema =
            ArraySchema::sparse(domain).with_attribute(Attribute::fixed("a", 4).unwrap());
        let mut array = Array::create(schema).unwrap();
        let rtree = RTree::build::<i32>(1, 2, &[0, 9]).unwrap();
        array.attach_fragment(Arc::new(BrokenStore { rtree }));
        let array = Arc::new(array);

        let mut query = Query::new(array);
        query.set_buffer("a", 64).unwrap();
        let err = query.submit().unwrap_err();
        assert!(matches!(err, CelldexError::Io(_)));
        assert_eq!(query.status(), QueryStatus::Failed);
    }

    #[test]
    fn test_est_result_size_through_query() {
        let array = diagonal_array();
        let mut query = Query::new(array.clone());
        let mut subarray = Subarray::new(array, Layout::Unordered);
        subarray.add_range(0, 0i32, 0).unwrap();
        subarray.add_range(1, 0i32, 0).unwrap();
        query.set_subarray(subarray).unwrap();
        assert_eq!(query.est_result_size("a").unwrap(), 1);
    }
}
