//! Array schema: domain, attributes, and layout configuration.
//!
//! The schema carries exactly what the index and the query planner need: the
//! dimension count and datatype, the global domain hyper-rectangle, attribute
//! cell sizes, the cell order that defines the global tile order, the sparse
//! tile capacity, and the R-tree fanout. Schemas are plain serializable
//! values validated once at construction.

use serde::{Deserialize, Serialize};

use crate::datatype::{CoordData, CoordValue, Datatype};
use crate::error::{CelldexError, Result};

/// Reserved name addressing the coordinates tuple of each result cell.
pub const COORDS: &str = "__coords";

/// Default number of cells per sparse leaf tile.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Default R-tree fanout.
pub const DEFAULT_FANOUT: u32 = 10;

/// Ordering convention for result streaming and range enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Lexicographic over dimension index; the last dimension varies fastest.
    RowMajor,
    /// Reverse lexicographic; the first dimension varies fastest.
    ColMajor,
    /// Exactly the order the index stores its leaf tiles in.
    GlobalOrder,
    /// Implementation-chosen but fixed for the run.
    #[default]
    Unordered,
}

/// Dense or sparse array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayType {
    Dense,
    Sparse,
}

/// Size class of one attribute cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellSize {
    /// Every cell occupies exactly this many bytes.
    Fixed(u32),
    /// Cells carry variable-length values addressed through offsets.
    Var,
}

/// A named attribute of the array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    cell_size: CellSize,
}

impl Attribute {
    /// A fixed-size attribute; `size` is the bytes per cell.
    pub fn fixed(name: impl Into<String>, size: u32) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(CelldexError::invalid(format!(
                "attribute '{}' must have a non-zero cell size",
                name
            )));
        }
        Ok(Self {
            name,
            cell_size: CellSize::Fixed(size),
        })
    }

    /// A variable-size attribute.
    pub fn var(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cell_size: CellSize::Var,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell_size(&self) -> CellSize {
        self.cell_size
    }

    pub fn is_var(&self) -> bool {
        self.cell_size == CellSize::Var
    }
}

/// The global domain: named dimensions sharing one datatype, each with a
/// closed `[lo, hi]` extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    names: Vec<String>,
    datatype: Datatype,
    /// Flat bounds, `lo_0, hi_0, ..., lo_{D-1}, hi_{D-1}`.
    bounds: CoordData,
}

impl Domain {
    /// Build a domain from `(name, lo, hi)` triples.
    pub fn new<T: CoordValue>(dims: &[(&str, T, T)]) -> Result<Self> {
        if dims.is_empty() {
            return Err(CelldexError::invalid(
                "domain must have at least one dimension",
            ));
        }
        let mut names = Vec::with_capacity(dims.len());
        let mut bounds = Vec::with_capacity(dims.len() * 2);
        for (name, lo, hi) in dims {
            if lo.is_nan() || hi.is_nan() {
                return Err(CelldexError::invalid(format!(
                    "dimension '{}' bounds contain NaN",
                    name
                )));
            }
            if lo > hi {
                return Err(CelldexError::invalid(format!(
                    "dimension '{}' has inverted bounds [{}, {}]",
                    name, lo, hi
                )));
            }
            names.push((*name).to_string());
            bounds.push(*lo);
            bounds.push(*hi);
        }
        Ok(Self {
            names,
            datatype: T::DATATYPE,
            bounds: T::data_vec(bounds),
        })
    }

    pub fn dim_num(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn dim_name(&self, dim: u32) -> Option<&str> {
        self.names.get(dim as usize).map(String::as_str)
    }

    /// Typed view of the flat bounds. The caller must have matched the
    /// datatype already.
    pub(crate) fn bounds<T: CoordValue>(&self) -> &[T] {
        T::data_slice(&self.bounds)
    }

    /// `[lo, hi]` of one dimension.
    pub fn dim_bounds<T: CoordValue>(&self, dim: u32) -> Result<(T, T)> {
        if T::DATATYPE != self.datatype {
            return Err(CelldexError::invalid(format!(
                "domain datatype is {}, not {}",
                self.datatype,
                T::DATATYPE
            )));
        }
        let bounds = self.bounds::<T>();
        let i = dim as usize * 2;
        if i + 1 >= bounds.len() {
            return Err(CelldexError::invalid(format!(
                "invalid dimension index {}",
                dim
            )));
        }
        Ok((bounds[i], bounds[i + 1]))
    }
}

/// Complete array schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    array_type: ArrayType,
    domain: Domain,
    attributes: Vec<Attribute>,
    cell_order: Layout,
    capacity: u64,
    fanout: u32,
}

impl ArraySchema {
    /// A sparse array schema with default capacity, fanout, and row-major
    /// cell order.
    pub fn sparse(domain: Domain) -> Self {
        Self {
            array_type: ArrayType::Sparse,
            domain,
            attributes: Vec::new(),
            cell_order: Layout::RowMajor,
            capacity: DEFAULT_CAPACITY,
            fanout: DEFAULT_FANOUT,
        }
    }

    /// A dense array schema. Dense arrays can be described but not yet
    /// queried; see [`crate::array::Array`].
    pub fn dense(domain: Domain) -> Self {
        Self {
            array_type: ArrayType::Dense,
            ..Self::sparse(domain)
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_cell_order(mut self, cell_order: Layout) -> Self {
        self.cell_order = cell_order;
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_fanout(mut self, fanout: u32) -> Self {
        self.fanout = fanout;
        self
    }

    /// Validate the assembled schema.
    pub fn validate(&self) -> Result<()> {
        if self.attributes.is_empty() {
            return Err(CelldexError::invalid(
                "schema must declare at least one attribute",
            ));
        }
        for (i, attr) in self.attributes.iter().enumerate() {
            if attr.name() == COORDS {
                return Err(CelldexError::invalid(format!(
                    "attribute name '{}' is reserved",
                    COORDS
                )));
            }
            if self.attributes[..i].iter().any(|a| a.name() == attr.name()) {
                return Err(CelldexError::invalid(format!(
                    "duplicate attribute name '{}'",
                    attr.name()
                )));
            }
        }
        if !matches!(self.cell_order, Layout::RowMajor | Layout::ColMajor) {
            return Err(CelldexError::invalid(
                "cell order must be row-major or col-major",
            ));
        }
        if self.capacity == 0 {
            return Err(CelldexError::invalid("tile capacity must be positive"));
        }
        if self.fanout < 2 {
            return Err(CelldexError::invalid("R-tree fanout must be at least 2"));
        }
        Ok(())
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn dim_num(&self) -> u32 {
        self.domain.dim_num()
    }

    pub fn datatype(&self) -> Datatype {
        self.domain.datatype()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    /// Cell size of an attribute or of the reserved coords tuple.
    pub fn cell_size(&self, name: &str) -> Option<CellSize> {
        if name == COORDS {
            return Some(CellSize::Fixed(self.coords_cell_size() as u32));
        }
        self.attribute(name).map(Attribute::cell_size)
    }

    /// Bytes per coordinates tuple: `D * sizeof(datatype)`.
    pub fn coords_cell_size(&self) -> u64 {
        u64::from(self.dim_num()) * self.datatype().size()
    }

    /// `true` when `name` is a declared attribute or the coords tuple.
    pub fn is_field(&self, name: &str) -> bool {
        name == COORDS || self.attribute(name).is_some()
    }

    /// Load a schema from JSON, validating it.
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: ArraySchema = serde_json::from_str(json)
            .map_err(|e| CelldexError::invalid(format!("cannot parse schema: {}", e)))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Serialize the schema as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CelldexError::internal(format!("cannot serialize schema: {}", e)))
    }
}
