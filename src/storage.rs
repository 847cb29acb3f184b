//! Storage collaborators: the tile store interface and an in-memory
//! fragment implementation.
//!
//! The index never performs I/O; everything it needs from the storage layer
//! goes through [`TileStore`]. A [`Fragment`] is one immutable write of
//! sparse cells: sorted into the array cell order, chunked into leaf tiles of
//! `capacity` cells, each tile encoded into a standalone byte payload, with
//! an R-tree built over the tile MBRs.
//!
//! Tile payload layout, all little-endian:
//! coordinates (`cell_num * dim_num` values), then per attribute in schema
//! order either `cell_num * cell_size` raw bytes (fixed) or a `u64` values
//! length, `cell_num` start offsets, and the value bytes (var).

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::datatype::{CoordData, CoordValue};
use crate::error::{CelldexError, Result};
use crate::rtree::RTree;
use crate::schema::{ArraySchema, Attribute, COORDS, CellSize, Layout};

/// Inbound interface to the storage layer, per fragment.
///
/// `tile_size` reports the fixed bytes of a field in one tile (cell bytes for
/// fixed fields, offset bytes for var fields); `tile_var_size` reports the
/// var value bytes. Both feed result-size estimation. `fetch_leaf_tile` is
/// synchronous; its errors surface as query `Io` failures.
pub trait TileStore {
    /// The spatial index over this fragment's leaf tiles.
    fn rtree(&self) -> &RTree;

    /// Number of leaf tiles.
    fn tile_num(&self) -> u64;

    /// Cells stored in one leaf tile.
    fn cells_per_tile(&self, leaf_idx: u64) -> u64;

    /// Fixed bytes of `field` in one tile.
    fn tile_size(&self, field: &str, leaf_idx: u64) -> Result<u64>;

    /// Var value bytes of `field` in one tile; zero for fixed fields.
    fn tile_var_size(&self, field: &str, leaf_idx: u64) -> Result<u64>;

    /// The encoded tile payload.
    fn fetch_leaf_tile(&self, leaf_idx: u64) -> Result<Bytes>;
}

/// Attribute values supplied to a write, one entry per cell.
#[derive(Debug, Clone)]
pub enum AttributeData {
    /// Raw fixed-size cells, `cell_num * cell_size` bytes.
    Fixed(Vec<u8>),
    /// One variable-length value per cell.
    Var(Vec<Vec<u8>>),
}

impl AttributeData {
    /// Encode a slice of fixed-size values.
    pub fn fixed<V: CoordValue>(values: &[V]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<V>());
        for v in values {
            v.write_le(&mut bytes);
        }
        AttributeData::Fixed(bytes)
    }

    /// One var-sized value per cell.
    pub fn var<S: AsRef<[u8]>>(values: &[S]) -> Self {
        AttributeData::Var(values.iter().map(|v| v.as_ref().to_vec()).collect())
    }
}

/// One decoded attribute block of a tile.
#[derive(Debug, Clone)]
pub(crate) enum DecodedAttr {
    Fixed { cell_size: u32, bytes: Bytes },
    Var { offsets: Vec<u64>, values: Bytes },
}

impl DecodedAttr {
    /// Byte slice of one cell's value.
    pub(crate) fn cell_bytes(&self, cell: usize) -> &[u8] {
        match self {
            DecodedAttr::Fixed { cell_size, bytes } => {
                let s = *cell_size as usize;
                &bytes[cell * s..(cell + 1) * s]
            }
            DecodedAttr::Var { offsets, values } => {
                let start = offsets[cell] as usize;
                let end = offsets.get(cell + 1).map_or(values.len(), |o| *o as usize);
                &values[start..end]
            }
        }
    }
}

/// A tile payload parsed back into typed blocks.
#[derive(Debug, Clone)]
pub(crate) struct DecodedTile {
    pub(crate) cell_num: u64,
    pub(crate) coords: CoordData,
    attrs: FxHashMap<String, DecodedAttr>,
}

impl DecodedTile {
    pub(crate) fn decode(schema: &ArraySchema, cell_num: u64, payload: &Bytes) -> Result<Self> {
        let dim_num = schema.dim_num() as usize;
        let value_size = schema.datatype().size() as usize;
        let mut pos = 0usize;

        let coord_values = cell_num as usize * dim_num;
        let coords_bytes = coord_values * value_size;
        if payload.len() < pos + coords_bytes {
            return Err(CelldexError::internal(
                "tile payload truncated in coordinates",
            ));
        }
        let coords = CoordData::read_le(schema.datatype(), &payload[pos..], coord_values)?;
        pos += coords_bytes;

        let mut attrs = FxHashMap::default();
        for attr in schema.attributes() {
            let decoded = match attr.cell_size() {
                CellSize::Fixed(s) => {
                    let len = cell_num as usize * s as usize;
                    if payload.len() < pos + len {
                        return Err(CelldexError::internal(format!(
                            "tile payload truncated in attribute '{}'",
                            attr.name()
                        )));
                    }
                    let bytes = payload.slice(pos..pos + len);
                    pos += len;
                    DecodedAttr::Fixed { cell_size: s, bytes }
                }
                CellSize::Var => {
                    if payload.len() < pos + 8 {
                        return Err(CelldexError::internal(format!(
                            "tile payload truncated in attribute '{}'",
                            attr.name()
                        )));
                    }
                    let values_len =
                        u64::from_le_bytes(payload[pos..pos + 8].try_into().expect("length checked"))
                            as usize;
                    pos += 8;

                    let offsets_len = cell_num as usize * 8;
                    if payload.len() < pos + offsets_len + values_len {
                        return Err(CelldexError::internal(format!(
                            "tile payload truncated in attribute '{}'",
                            attr.name()
                        )));
                    }
                    let mut offsets = Vec::with_capacity(cell_num as usize);
                    for chunk in payload[pos..pos + offsets_len].chunks_exact(8) {
                        offsets.push(u64::from_le_bytes(chunk.try_into().expect("chunked by 8")));
                    }
                    pos += offsets_len;
                    let values = payload.slice(pos..pos + values_len);
                    pos += values_len;
                    DecodedAttr::Var { offsets, values }
                }
            };
            attrs.insert(attr.name().to_string(), decoded);
        }

        if pos != payload.len() {
            return Err(CelldexError::internal(format!(
                "{} trailing bytes in tile payload",
                payload.len() - pos
            )));
        }

        Ok(Self {
            cell_num,
            coords,
            attrs,
        })
    }

    /// Coordinates of one cell as a typed slice of `dim_num` values.
    pub(crate) fn cell_coords<T: CoordValue>(&self, cell: usize, dim_num: usize) -> &[T] {
        let coords = T::data_slice(&self.coords);
        &coords[cell * dim_num..(cell + 1) * dim_num]
    }

    pub(crate) fn attr(&self, name: &str) -> Result<&DecodedAttr> {
        self.attrs
            .get(name)
            .ok_or_else(|| CelldexError::internal(format!("tile has no attribute '{}'", name)))
    }
}

/// Compare two coordinate tuples in the given cell order.
pub(crate) fn cell_cmp<T: CoordValue>(a: &[T], b: &[T], cell_order: Layout) -> Ordering {
    let dims: Box<dyn Iterator<Item = usize>> = match cell_order {
        Layout::ColMajor => Box::new((0..a.len()).rev()),
        _ => Box::new(0..a.len()),
    };
    for d in dims {
        match a[d].partial_cmp(&b[d]) {
            Some(Ordering::Equal) | None => continue,
            Some(ord) => return ord,
        }
    }
    Ordering::Equal
}

/// One immutable sparse write: encoded leaf tiles plus their spatial index.
#[derive(Debug, Clone)]
pub struct Fragment {
    schema: Arc<ArraySchema>,
    rtree: RTree,
    tile_cell_num: Vec<u64>,
    tiles: Vec<Bytes>,
    /// Per var attribute, the value bytes of each tile.
    var_sizes: FxHashMap<String, Vec<u64>>,
}

impl Fragment {
    /// Build a fragment from unordered cells.
    ///
    /// Coordinates are `cell_num * dim_num` values, cell-major; every schema
    /// attribute must be supplied with exactly one value per cell, and every
    /// coordinate must lie inside the domain.
    pub fn from_cells<T: CoordValue>(
        schema: Arc<ArraySchema>,
        coords: &[T],
        attrs: &[(&str, AttributeData)],
    ) -> Result<Self> {
        if T::DATATYPE != schema.datatype() {
            return Err(CelldexError::invalid(format!(
                "array domain is {}, not {}",
                schema.datatype(),
                T::DATATYPE
            )));
        }
        let dim_num = schema.dim_num() as usize;
        if coords.is_empty() || coords.len() % dim_num != 0 {
            return Err(CelldexError::invalid(format!(
                "coordinate buffer of {} values is not a positive multiple of {}",
                coords.len(),
                dim_num
            )));
        }
        let cell_num = coords.len() / dim_num;

        let domain = schema.domain().bounds::<T>();
        for cell in coords.chunks_exact(dim_num) {
            for (d, v) in cell.iter().enumerate() {
                if v.is_nan() {
                    return Err(CelldexError::invalid("cell coordinate is NaN"));
                }
                if *v < domain[d * 2] || *v > domain[d * 2 + 1] {
                    return Err(CelldexError::OutOfDomain(format!(
                        "cell coordinate {} outside dimension {} domain [{}, {}]",
                        v,
                        d,
                        domain[d * 2],
                        domain[d * 2 + 1]
                    )));
                }
            }
        }

        // Every attribute present, sized to the cell count, none unknown.
        for attr in schema.attributes() {
            let supplied = attrs
                .iter()
                .find(|(name, _)| *name == attr.name())
                .map(|(_, data)| data)
                .ok_or_else(|| {
                    CelldexError::invalid(format!("missing data for attribute '{}'", attr.name()))
                })?;
            let supplied_cells = match (attr.cell_size(), supplied) {
                (CellSize::Fixed(s), AttributeData::Fixed(bytes)) => {
                    if bytes.len() % s as usize != 0 {
                        return Err(CelldexError::invalid(format!(
                            "attribute '{}' data is not a multiple of its cell size",
                            attr.name()
                        )));
                    }
                    bytes.len() / s as usize
                }
                (CellSize::Var, AttributeData::Var(values)) => values.len(),
                _ => {
                    return Err(CelldexError::invalid(format!(
                        "attribute '{}' data does not match its declared cell size",
                        attr.name()
                    )));
                }
            };
            if supplied_cells != cell_num {
                return Err(CelldexError::invalid(format!(
                    "attribute '{}' holds {} cells; coordinates hold {}",
                    attr.name(),
                    supplied_cells,
                    cell_num
                )));
            }
        }
        for (name, _) in attrs {
            if schema.attribute(name).is_none() {
                return Err(CelldexError::invalid(format!(
                    "unknown attribute '{}'",
                    name
                )));
            }
        }

        // Sort into the global cell order.
        let mut order: Vec<usize> = (0..cell_num).collect();
        let cell_order = schema.cell_order();
        order.sort_by(|&a, &b| {
            cell_cmp(
                &coords[a * dim_num..(a + 1) * dim_num],
                &coords[b * dim_num..(b + 1) * dim_num],
                cell_order,
            )
        });

        // Chunk into capacity-sized tiles, encode, and collect MBRs.
        let capacity = schema.capacity() as usize;
        let mut tile_cell_num = Vec::new();
        let mut tiles = Vec::new();
        let mut leaf_mbrs: Vec<T> = Vec::new();
        let mut var_sizes: FxHashMap<String, Vec<u64>> = schema
            .attributes()
            .iter()
            .filter(|a| a.is_var())
            .map(|a| (a.name().to_string(), Vec::new()))
            .collect();

        for tile_cells in order.chunks(capacity) {
            let mut mbr: Vec<T> = Vec::with_capacity(dim_num * 2);
            let first = &coords[tile_cells[0] * dim_num..(tile_cells[0] + 1) * dim_num];
            for v in first {
                mbr.push(*v);
                mbr.push(*v);
            }
            for &cell in &tile_cells[1..] {
                let c = &coords[cell * dim_num..(cell + 1) * dim_num];
                for d in 0..dim_num {
                    if c[d] < mbr[d * 2] {
                        mbr[d * 2] = c[d];
                    }
                    if c[d] > mbr[d * 2 + 1] {
                        mbr[d * 2 + 1] = c[d];
                    }
                }
            }
            leaf_mbrs.extend_from_slice(&mbr);

            let payload = encode_tile(&schema, coords, tile_cells, attrs, &mut var_sizes);
            tile_cell_num.push(tile_cells.len() as u64);
            tiles.push(payload);
        }

        let rtree = RTree::build(schema.dim_num(), schema.fanout(), &leaf_mbrs)?;
        log::debug!(
            "built fragment: {} cells in {} tiles, R-tree height {}",
            cell_num,
            tiles.len(),
            rtree.height()
        );

        Ok(Self {
            schema,
            rtree,
            tile_cell_num,
            tiles,
            var_sizes,
        })
    }

    fn check_tile(&self, leaf_idx: u64) -> Result<usize> {
        if leaf_idx >= self.tiles.len() as u64 {
            return Err(CelldexError::internal(format!(
                "leaf tile {} out of bounds ({} tiles)",
                leaf_idx,
                self.tiles.len()
            )));
        }
        Ok(leaf_idx as usize)
    }

    fn field_attr(&self, field: &str) -> Result<Option<&Attribute>> {
        if field == COORDS {
            return Ok(None);
        }
        self.schema
            .attribute(field)
            .map(Some)
            .ok_or_else(|| CelldexError::invalid(format!("unknown attribute '{}'", field)))
    }
}

/// Encode one tile's cells into its payload.
fn encode_tile<T: CoordValue>(
    schema: &ArraySchema,
    coords: &[T],
    tile_cells: &[usize],
    attrs: &[(&str, AttributeData)],
    var_sizes: &mut FxHashMap<String, Vec<u64>>,
) -> Bytes {
    let dim_num = schema.dim_num() as usize;
    let mut out = Vec::new();

    for &cell in tile_cells {
        for v in &coords[cell * dim_num..(cell + 1) * dim_num] {
            v.write_le(&mut out);
        }
    }

    for attr in schema.attributes() {
        let data = attrs
            .iter()
            .find(|(name, _)| *name == attr.name())
            .map(|(_, data)| data)
            .expect("attribute presence validated");
        match (attr.cell_size(), data) {
            (CellSize::Fixed(s), AttributeData::Fixed(bytes)) => {
                let s = s as usize;
                for &cell in tile_cells {
                    out.extend_from_slice(&bytes[cell * s..(cell + 1) * s]);
                }
            }
            (CellSize::Var, AttributeData::Var(values)) => {
                let values_len: u64 = tile_cells.iter().map(|&c| values[c].len() as u64).sum();
                out.extend_from_slice(&values_len.to_le_bytes());
                let mut offset = 0u64;
                for &cell in tile_cells {
                    out.extend_from_slice(&offset.to_le_bytes());
                    offset += values[cell].len() as u64;
                }
                for &cell in tile_cells {
                    out.extend_from_slice(&values[cell]);
                }
                var_sizes
                    .get_mut(attr.name())
                    .expect("var attribute registered")
                    .push(values_len);
            }
            _ => unreachable!("attribute shape validated"),
        }
    }

    Bytes::from(out)
}

impl TileStore for Fragment {
    fn rtree(&self) -> &RTree {
        &self.rtree
    }

    fn tile_num(&self) -> u64 {
        self.tiles.len() as u64
    }

    fn cells_per_tile(&self, leaf_idx: u64) -> u64 {
        self.tile_cell_num
            .get(leaf_idx as usize)
            .copied()
            .unwrap_or(0)
    }

    fn tile_size(&self, field: &str, leaf_idx: u64) -> Result<u64> {
        let tile = self.check_tile(leaf_idx)?;
        let cells = self.tile_cell_num[tile];
        match self.field_attr(field)? {
            None => Ok(cells * self.schema.coords_cell_size()),
            Some(attr) => match attr.cell_size() {
                CellSize::Fixed(s) => Ok(cells * u64::from(s)),
                // Var fields report their offsets footprint here.
                CellSize::Var => Ok(cells * 8),
            },
        }
    }

    fn tile_var_size(&self, field: &str, leaf_idx: u64) -> Result<u64> {
        let tile = self.check_tile(leaf_idx)?;
        match self.field_attr(field)? {
            Some(attr) if attr.is_var() => Ok(self.var_sizes[attr.name()][tile]),
            _ => Ok(0),
        }
    }

    fn fetch_leaf_tile(&self, leaf_idx: u64) -> Result<Bytes> {
        let tile = self.check_tile(leaf_idx)?;
        Ok(self.tiles[tile].clone())
    }
}

/// Fetch and decode a fragment's tile; fetch failures surface as `Io`.
pub(crate) fn decode_tile(
    schema: &ArraySchema,
    store: &dyn TileStore,
    leaf_idx: u64,
) -> Result<DecodedTile> {
    let payload = store.fetch_leaf_tile(leaf_idx).map_err(|e| match e {
        CelldexError::Io(_) => e,
        other => CelldexError::Io(other.to_string()),
    })?;
    DecodedTile::decode(schema, store.cells_per_tile(leaf_idx), &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Domain;

    fn schema_2d(capacity: u64, cell_order: Layout) -> Arc<ArraySchema> {
        let domain = Domain::new(&[("rows", 0i32, 99), ("cols", 0i32, 99)]).unwrap();
        Arc::new(
            ArraySchema::sparse(domain)
                .with_attribute(Attribute::fixed("a", 4).unwrap())
                .with_cell_order(cell_order)
                .with_capacity(capacity)
                .with_fanout(2),
        )
    }

    #[test]
    fn test_cell_cmp_orders() {
        let a = [0i32, 5];
        let b = [1i32, 2];
        assert_eq!(cell_cmp(&a, &b, Layout::RowMajor), Ordering::Less);
        assert_eq!(cell_cmp(&a, &b, Layout::ColMajor), Ordering::Greater);
        assert_eq!(cell_cmp(&a, &a, Layout::RowMajor), Ordering::Equal);
    }

    #[test]
    fn test_fragment_sorts_and_tiles() {
        let schema = schema_2d(2, Layout::RowMajor);
        // Written unordered; row-major order is (0,1) (1,0) (2,5) (3,3).
        let coords = [2i32, 5, 0, 1, 3, 3, 1, 0];
        let values = AttributeData::fixed(&[30i32, 10, 40, 20]);
        let fragment = Fragment::from_cells(schema.clone(), &coords, &[("a", values)]).unwrap();

        assert_eq!(fragment.tile_num(), 2);
        assert_eq!(fragment.cells_per_tile(0), 2);
        assert_eq!(fragment.cells_per_tile(1), 2);
        assert_eq!(fragment.rtree().leaf_num(), 2);
        // First tile holds (0,1) and (1,0); its MBR is [0,1]x[0,1].
        assert_eq!(fragment.rtree().leaf_mbr::<i32>(0).unwrap(), &[0, 1, 0, 1]);
        assert_eq!(fragment.rtree().leaf_mbr::<i32>(1).unwrap(), &[2, 3, 3, 5]);

        let tile = decode_tile(&schema, &fragment, 0).unwrap();
        assert_eq!(tile.cell_num, 2);
        assert_eq!(tile.cell_coords::<i32>(0, 2), &[0, 1]);
        assert_eq!(tile.cell_coords::<i32>(1, 2), &[1, 0]);
        assert_eq!(
            tile.attr("a").unwrap().cell_bytes(0),
            10i32.to_le_bytes().as_slice()
        );
        assert_eq!(
            tile.attr("a").unwrap().cell_bytes(1),
            20i32.to_le_bytes().as_slice()
        );
    }

    #[test]
    fn test_fragment_col_major_order() {
        let schema = schema_2d(10, Layout::ColMajor);
        let coords = [0i32, 2, 1, 0, 0, 0];
        let values = AttributeData::fixed(&[3i32, 2, 1]);
        let fragment = Fragment::from_cells(schema.clone(), &coords, &[("a", values)]).unwrap();

        // Col-major: sorted by (col, row): (0,0) (1,0) (0,2).
        let tile = decode_tile(&schema, &fragment, 0).unwrap();
        assert_eq!(tile.cell_coords::<i32>(0, 2), &[0, 0]);
        assert_eq!(tile.cell_coords::<i32>(1, 2), &[1, 0]);
        assert_eq!(tile.cell_coords::<i32>(2, 2), &[0, 2]);
    }

    #[test]
    fn test_fragment_validation() {
        let schema = schema_2d(10, Layout::RowMajor);
        let a = AttributeData::fixed(&[1i32]);

        // Datatype mismatch.
        assert!(Fragment::from_cells::<i64>(schema.clone(), &[0, 0], &[("a", a.clone())]).is_err());
        // Out-of-domain coordinate.
        assert!(matches!(
            Fragment::from_cells(schema.clone(), &[500i32, 0], &[("a", a.clone())]),
            Err(CelldexError::OutOfDomain(_))
        ));
        // Missing attribute data.
        assert!(Fragment::from_cells(schema.clone(), &[0i32, 0], &[]).is_err());
        // Cell count mismatch.
        assert!(
            Fragment::from_cells(
                schema.clone(),
                &[0i32, 0, 1, 1],
                &[("a", AttributeData::fixed(&[7i32]))]
            )
            .is_err()
        );
        // Unknown attribute.
        assert!(
            Fragment::from_cells(
                schema.clone(),
                &[0i32, 0],
                &[("a", a.clone()), ("ghost", a.clone())]
            )
            .is_err()
        );
        // Empty write.
        assert!(Fragment::from_cells::<i32>(schema, &[], &[("a", a)]).is_err());
    }

    #[test]
    fn test_tile_sizes() {
        let schema = Arc::new(
            ArraySchema::sparse(Domain::new(&[("x", 0i64, 1000)]).unwrap())
                .with_attribute(Attribute::fixed("a", 4).unwrap())
                .with_attribute(Attribute::var("s"))
                .with_capacity(3),
        );
        let coords = [0i64, 1, 2, 3];
        let fragment = Fragment::from_cells(
            schema,
            &coords,
            &[
                ("a", AttributeData::fixed(&[1i32, 2, 3, 4])),
                (
                    "s",
                    AttributeData::var(&[b"x".as_slice(), b"yy", b"", b"zzzz"]),
                ),
            ],
        )
        .unwrap();

        assert_eq!(fragment.tile_num(), 2);
        // Tile 0: 3 cells.
        assert_eq!(fragment.tile_size("a", 0).unwrap(), 12);
        assert_eq!(fragment.tile_size("s", 0).unwrap(), 24);
        assert_eq!(fragment.tile_var_size("s", 0).unwrap(), 3);
        assert_eq!(fragment.tile_size(COORDS, 0).unwrap(), 24);
        // Tile 1: 1 cell.
        assert_eq!(fragment.tile_size("a", 1).unwrap(), 4);
        assert_eq!(fragment.tile_var_size("s", 1).unwrap(), 4);
        assert_eq!(fragment.tile_var_size("a", 1).unwrap(), 0);
        assert!(fragment.tile_size("ghost", 0).is_err());
    }

    #[test]
    fn test_var_tile_roundtrip() {
        let schema = Arc::new(
            ArraySchema::sparse(Domain::new(&[("x", 0i32, 10)]).unwrap())
                .with_attribute(Attribute::var("s")),
        );
        let fragment = Fragment::from_cells(
            schema.clone(),
            &[2i32, 0, 1],
            &[("s", AttributeData::var(&[b"ccc".as_slice(), b"a", b"bb"]))],
        )
        .unwrap();

        let tile = decode_tile(&schema, &fragment, 0).unwrap();
        // Sorted by coordinate: values come back as a, bb, ccc.
        assert_eq!(tile.attr("s").unwrap().cell_bytes(0), b"a");
        assert_eq!(tile.attr("s").unwrap().cell_bytes(1), b"bb");
        assert_eq!(tile.attr("s").unwrap().cell_bytes(2), b"ccc");
    }

    #[test]
    fn test_fetch_out_of_bounds() {
        let schema = schema_2d(10, Layout::RowMajor);
        let fragment =
            Fragment::from_cells(schema, &[0i32, 0], &[("a", AttributeData::fixed(&[1i32]))])
                .unwrap();
        assert!(fragment.fetch_leaf_tile(1).is_err());
        assert_eq!(fragment.cells_per_tile(1), 0);
    }
}
