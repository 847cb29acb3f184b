//! An array: a validated schema plus the fragments written against it.

use std::sync::Arc;

use crate::datatype::CoordValue;
use crate::error::{CelldexError, Result};
use crate::schema::{ArraySchema, ArrayType};
use crate::storage::{AttributeData, Fragment, TileStore};

/// A multi-dimensional array holding zero or more immutable fragments.
///
/// Each write produces one [`Fragment`] with its own tile layout and R-tree;
/// queries see fragments in write order. Fragments are held behind the
/// [`TileStore`] interface, so externally stored fragments can be attached
/// alongside in-memory ones.
pub struct Array {
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<dyn TileStore + Send + Sync>>,
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("schema", &self.schema)
            .field("fragment_num", &self.fragments.len())
            .finish()
    }
}

impl Array {
    /// Create an array from a schema, validating it.
    pub fn create(schema: ArraySchema) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            schema: Arc::new(schema),
            fragments: Vec::new(),
        })
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub fn fragments(&self) -> &[Arc<dyn TileStore + Send + Sync>] {
        &self.fragments
    }

    /// Write one batch of sparse cells as a new fragment.
    ///
    /// `coords` holds `cell_num * dim_num` values, cell-major; `attrs` must
    /// supply one value per cell for every schema attribute. Cells may arrive
    /// in any order; the fragment sorts them into the array cell order.
    pub fn write<T: CoordValue>(
        &mut self,
        coords: &[T],
        attrs: &[(&str, AttributeData)],
    ) -> Result<()> {
        if self.schema.array_type() == ArrayType::Dense {
            return Err(CelldexError::invalid(
                "cannot write; only sparse arrays accept cell writes",
            ));
        }
        let fragment = Fragment::from_cells(self.schema.clone(), coords, attrs)?;
        self.fragments.push(Arc::new(fragment));
        Ok(())
    }

    /// Attach an externally built fragment store.
    pub fn attach_fragment(&mut self, fragment: Arc<dyn TileStore + Send + Sync>) {
        self.fragments.push(fragment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Domain};

    #[test]
    fn test_create_validates_schema() {
        let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
        // No attributes.
        assert!(Array::create(ArraySchema::sparse(domain.clone())).is_err());

        let schema =
            ArraySchema::sparse(domain).with_attribute(Attribute::fixed("a", 4).unwrap());
        assert!(Array::create(schema).is_ok());
    }

    #[test]
    fn test_write_appends_fragments() {
        let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
        let schema =
            ArraySchema::sparse(domain).with_attribute(Attribute::fixed("a", 4).unwrap());
        let mut array = Array::create(schema).unwrap();

        array
            .write(&[1i32, 3], &[("a", AttributeData::fixed(&[10i32, 30]))])
            .unwrap();
        array
            .write(&[5i32], &[("a", AttributeData::fixed(&[50i32]))])
            .unwrap();

        assert_eq!(array.fragments().len(), 2);
        assert_eq!(array.fragments()[0].tile_num(), 1);
        assert_eq!(array.fragments()[1].cells_per_tile(0), 1);
    }

    #[test]
    fn test_dense_write_rejected() {
        let domain = Domain::new(&[("x", 0i32, 9)]).unwrap();
        let schema = ArraySchema::dense(domain).with_attribute(Attribute::fixed("a", 4).unwrap());
        let mut array = Array::create(schema).unwrap();
        assert!(
            array
                .write(&[1i32], &[("a", AttributeData::fixed(&[10i32]))])
                .is_err()
        );
    }
}
