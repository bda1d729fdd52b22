//! Per-piece transforms.
//!
//! Every built-in transform is a plain value that can be serialized and
//! replayed on any piece; see [`Mapper`]. Arbitrary code runs through
//! [`Map`] wrapped in [`Mapper::Custom`], which stays process-local.

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, RecordBatch},
    datatypes::{Field, Schema},
};

use crate::error::{Error, Result};

mod encode;
mod fill;
mod mapper;
mod numeric;
mod scale;
mod selection;

pub use encode::{category_index, EncodeCategory, CAT_IDX_PREFIX};
pub use fill::{
    ColumnNullFill, FillMethod, FillWindow, NullFillSpec, NULL_FILL_PREFIX, PREP_SUFFIX,
};
pub use mapper::{Mapper, Pipeline};
pub use numeric::{Cast, CastType};
pub use scale::{Scale, ScalerParams, MAX_ABS_SCL_PREFIX, MIN_MAX_SCL_PREFIX, STD_SCL_PREFIX};
pub use selection::{Drop, Rename, Select};

/// A transform over one decoded piece (or chunk of a piece).
///
/// Transforms must not depend on which rows they see, so that the same
/// transform gives the same values at training and at inference time.
pub trait Transform: Send + Sync {
    /// Applies the transform to a RecordBatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform cannot be applied to the batch.
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch>;
}

/// A transform that applies a function to each RecordBatch.
///
/// # Example
///
/// ```ignore
/// use parcela::Map;
///
/// let transform = Map::new(|batch| {
///     // Process batch
///     Ok(batch)
/// });
/// ```
pub struct Map<F>
where
    F: Fn(RecordBatch) -> Result<RecordBatch> + Send + Sync,
{
    func: F,
}

impl<F> Map<F>
where
    F: Fn(RecordBatch) -> Result<RecordBatch> + Send + Sync,
{
    /// Creates a new Map transform with the given function.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Transform for Map<F>
where
    F: Fn(RecordBatch) -> Result<RecordBatch> + Send + Sync,
{
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        (self.func)(batch)
    }
}

impl Transform for Box<dyn Transform> {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        (**self).apply(batch)
    }
}

impl Transform for Arc<dyn Transform> {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        (**self).apply(batch)
    }
}

/// Adds or replaces a column, keeping the position of a replaced one.
pub(crate) fn set_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns = batch.columns().to_vec();
    let field = Field::new(name, array.data_type().clone(), true);

    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = field;
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(field);
            columns.push(array);
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Error::Arrow)
}

/// Looks up a column by name.
pub(crate) fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::column_not_found(name))
}
