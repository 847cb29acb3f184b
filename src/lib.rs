//! Embedded spatial tile index and bounded-memory subarray query engine for
//! sparse multi-dimensional arrays.
//!
//! Cells are written into immutable fragments, sorted into the array cell
//! order and chunked into leaf tiles; a bulk-loaded R-tree over the tile
//! MBRs answers which tiles a query region overlaps and by how much. Queries
//! stream results into caller-sized buffers, returning `Incomplete` until
//! the stream is exhausted.
//!
//! ```rust
//! use std::sync::Arc;
//! use celldex::{
//!     Array, ArraySchema, Attribute, AttributeData, Domain, Layout, Query, QueryStatus, Subarray,
//! };
//!
//! # fn main() -> celldex::Result<()> {
//! let domain = Domain::new(&[("rows", 0i32, 3), ("cols", 0i32, 3)])?;
//! let schema = ArraySchema::sparse(domain).with_attribute(Attribute::fixed("a", 4)?);
//! let mut array = Array::create(schema)?;
//! array.write(
//!     &[0i32, 0, 1, 1, 2, 2, 3, 3],
//!     &[("a", AttributeData::fixed(&[1i32, 2, 3, 4]))],
//! )?;
//! let array = Arc::new(array);
//!
//! let mut subarray = Subarray::new(array.clone(), Layout::Unordered);
//! subarray.add_range(0, 1i32, 2)?;
//! subarray.add_range(1, 1i32, 2)?;
//!
//! let mut query = Query::new(array);
//! query.set_subarray(subarray)?;
//! query.set_buffer("a", 64)?;
//! assert_eq!(query.submit()?, QueryStatus::Complete);
//! assert_eq!(query.buffer("a").unwrap().len(), 8);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod datatype;
pub mod error;
pub mod mbr;
pub mod partition;
pub mod query;
pub mod rtree;
pub mod schema;
pub mod storage;
pub mod subarray;

pub use array::Array;
pub use datatype::{CoordData, CoordValue, Datatype};
pub use error::{CelldexError, Result};
pub use partition::{ResultBudget, SubarrayPartitioner};
pub use query::{CancelToken, Query, QueryStatus};
pub use rtree::{RTree, TileCover, TileOverlap};
pub use schema::{ArraySchema, ArrayType, Attribute, COORDS, CellSize, Domain, Layout};
pub use storage::{AttributeData, Fragment, TileStore};
pub use subarray::{ResultSize, Subarray};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{
        Array, ArraySchema, Attribute, AttributeData, CelldexError, Datatype, Domain, Layout,
        Query, QueryStatus, RTree, Result, Subarray, TileStore,
    };

    pub use std::sync::Arc;
}
