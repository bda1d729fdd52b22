//! Categorical index encoding.

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, Float64Array, RecordBatch},
    datatypes::DataType,
};
use serde::{Deserialize, Serialize};

use super::{column, set_column, Transform};
use crate::{
    error::Result,
    stats::values::{category_values, is_string_type, numeric_values, CategoryValue},
};

/// Prefix of categorical index columns.
pub const CAT_IDX_PREFIX: &str = "__CatIdx__";

const FLOAT_ABS_TOL: f64 = 1e-6;

/// Maps each value of a column to its 0-based position in `categories`.
///
/// Strings match exactly; numbers and booleans match within `1e-6`. Nulls
/// and unseen values map to `categories.len()`.
///
/// # Errors
///
/// Returns an error if the column type has no category representation.
#[allow(clippy::cast_precision_loss)]
pub fn category_index(name: &str, array: &ArrayRef, categories: &[CategoryValue]) -> Result<Vec<f64>> {
    let other = categories.len() as f64;

    if is_string_type(array.data_type()) {
        return Ok(category_values(name, array)?
            .iter()
            .map(|v| match v {
                CategoryValue::Str(_) => categories
                    .iter()
                    .position(|c| c == v)
                    .map_or(other, |i| i as f64),
                _ => other,
            })
            .collect());
    }

    let numeric_cats: Vec<Option<f64>> = categories.iter().map(CategoryValue::as_f64).collect();
    let values = if *array.data_type() == DataType::Null {
        vec![f64::NAN; array.len()]
    } else {
        numeric_values(name, array)?
    };
    Ok(values
        .iter()
        .map(|v| {
            numeric_cats
                .iter()
                .position(|c| c.is_some_and(|c| (v - c).abs() < FLOAT_ABS_TOL))
                .map_or(other, |i| i as f64)
        })
        .collect())
}

/// Rescales a category index from `[0, n_cats]` into `[-1, 1]`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn min_max_scale_index(idx: f64, n_cats: usize) -> f64 {
    if n_cats == 0 {
        return 0.0;
    }
    2.0 * idx / n_cats as f64 - 1.0
}

/// Encodes one column as category indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeCategory {
    /// Source column.
    pub column: String,
    /// Known categories, in index order.
    pub categories: Vec<CategoryValue>,
    /// Output column; the source is replaced when absent.
    #[serde(default)]
    pub output: Option<String>,
    /// Rescale the index into `[-1, 1]`.
    #[serde(default)]
    pub scale: bool,
}

impl EncodeCategory {
    /// Encodes `column` in place with the given categories.
    pub fn new(column: impl Into<String>, categories: Vec<CategoryValue>) -> Self {
        Self {
            column: column.into(),
            categories,
            output: None,
            scale: false,
        }
    }

    /// Writes the index to `output` instead of replacing the source.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Rescales the index into `[-1, 1]`.
    #[must_use]
    pub fn scaled(mut self) -> Self {
        self.scale = true;
        self
    }
}

impl Transform for EncodeCategory {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let array = column(&batch, &self.column)?;
        let mut idx = category_index(&self.column, array, &self.categories)?;
        if self.scale {
            let n = self.categories.len();
            idx.iter_mut().for_each(|v| *v = min_max_scale_index(*v, n));
        }
        let out = self.output.as_deref().unwrap_or(&self.column);
        set_column(&batch, out, Arc::new(Float64Array::from(idx)))
    }
}
