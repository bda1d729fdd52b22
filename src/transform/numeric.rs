//! Type casts.

use std::{collections::HashMap, sync::Arc};

use arrow::{
    array::RecordBatch,
    compute::cast,
    datatypes::{DataType, Field, Schema, TimeUnit},
};
use serde::{Deserialize, Serialize};

use super::Transform;
use crate::error::{Error, Result};

/// Serializable target type of a [`Cast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    /// Boolean.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    Utf8,
    /// Days since the epoch.
    Date32,
    /// Microseconds since the epoch, no time zone.
    TimestampMicros,
}

impl CastType {
    /// The Arrow type this stands for.
    pub fn to_arrow(self) -> DataType {
        match self {
            Self::Bool => DataType::Boolean,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
            Self::Utf8 => DataType::Utf8,
            Self::Date32 => DataType::Date32,
            Self::TimestampMicros => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }
}

/// Casts columns to new types.
///
/// # Example
///
/// ```ignore
/// use parcela::{Cast, CastType};
///
/// let cast = Cast::new(vec![("id", CastType::Int64), ("x", CastType::Float64)]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cast {
    mappings: Vec<(String, CastType)>,
}

impl Cast {
    /// Creates a new Cast transform with column-to-type mappings.
    pub fn new<S: Into<String>>(mappings: impl IntoIterator<Item = (S, CastType)>) -> Self {
        Self {
            mappings: mappings
                .into_iter()
                .map(|(name, dtype)| (name.into(), dtype))
                .collect(),
        }
    }

    /// Returns the cast mappings.
    pub fn mappings(&self) -> &[(String, CastType)] {
        &self.mappings
    }
}

impl Transform for Cast {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let schema = batch.schema();
        let cast_map: HashMap<&str, DataType> = self
            .mappings
            .iter()
            .map(|(n, t)| (n.as_str(), t.to_arrow()))
            .collect();

        let mut fields = Vec::with_capacity(schema.fields().len());
        let mut arrays = Vec::with_capacity(schema.fields().len());

        for (idx, field) in schema.fields().iter().enumerate() {
            let col = batch.column(idx);
            match cast_map.get(field.name().as_str()) {
                Some(target_type) => {
                    let casted = cast(col.as_ref(), target_type).map_err(|e| {
                        Error::transform(format!(
                            "Failed to cast column '{}' to {target_type}: {e}",
                            field.name()
                        ))
                    })?;
                    fields.push(Field::new(field.name(), target_type.clone(), true));
                    arrays.push(casted);
                }
                None => {
                    fields.push(field.as_ref().clone());
                    arrays.push(Arc::clone(col));
                }
            }
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(Error::Arrow)
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, Float64Array, Int32Array, StringArray};

    use super::*;

    fn create_test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec!["1.5", "x", "3"])),
            ],
        )
        .ok()
        .unwrap_or_else(|| panic!("Should create batch"))
    }

    #[test]
    fn test_cast_int_to_float() {
        let result = Cast::new([("id", CastType::Float64)])
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should cast"));
        let ids = result
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap_or_else(|| panic!("Should be Float64"));
        assert_eq!(ids.value(2), 3.0);
    }

    #[test]
    fn test_unparseable_strings_become_null() {
        let result = Cast::new([("label", CastType::Float64)])
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should cast"));
        assert_eq!(result.column(1).null_count(), 1);
    }

    #[test]
    fn test_cast_type_serde() {
        let json = serde_json::to_string(&CastType::TimestampMicros)
            .ok()
            .unwrap_or_else(|| panic!("Should serialize"));
        assert_eq!(json, "\"timestamp_micros\"");
    }
}
