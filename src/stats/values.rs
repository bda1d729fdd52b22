//! Column value extraction for statistics and encoders.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array},
    compute::cast,
    datatypes::DataType,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A distinct value of a column, with nulls kept as their own bucket.
///
/// Serialized untagged, so category lists read as plain JSON arrays such as
/// `["A", "B"]`, `[0, 1]` or `[false, true]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryValue {
    /// Null or NaN.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
}

impl CategoryValue {
    /// Returns true for the null bucket.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value, if it has one.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Null | Self::Str(_) => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Str(_) => 3,
        }
    }
}

impl PartialEq for CategoryValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CategoryValue {}

impl PartialOrd for CategoryValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CategoryValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Float(_) | Self::Int(_), Self::Float(_) | Self::Int(_)) => {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for CategoryValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Str(s) => s.hash(state),
            // Int and Float compare numerically, so they hash through f64
            Self::Int(_) | Self::Float(_) => {
                self.as_f64().unwrap_or(f64::NAN).to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for CategoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Returns true for integer and floating point types.
pub fn is_numeric_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float16
            | DataType::Float32
            | DataType::Float64
    )
}

/// Returns true for integer types.
pub fn is_integer_type(data_type: &DataType) -> bool {
    is_numeric_type(data_type)
        && !matches!(
            data_type,
            DataType::Float16 | DataType::Float32 | DataType::Float64
        )
}

/// Returns true for string types.
pub fn is_string_type(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Utf8 | DataType::LargeUtf8)
}

/// Types whose columns may be treated as categorical: bool, string, integer.
pub fn is_possible_cat_type(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Boolean) || is_string_type(data_type) || is_integer_type(data_type)
}

/// Types usable as model features: bool, string, numeric.
pub fn is_possible_feature_type(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Boolean) || is_string_type(data_type) || is_numeric_type(data_type)
}

/// Converts a numeric or boolean column to `f64`, with null mapped to NaN.
///
/// # Errors
///
/// Returns [`Error::NotNumeric`] for any other type.
pub fn numeric_values(column: &str, array: &ArrayRef) -> Result<Vec<f64>> {
    let floats = to_f64_array(column, array)?;
    Ok(floats
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

/// Casts a numeric or boolean column to a `Float64Array`, nulls preserved.
///
/// # Errors
///
/// Returns [`Error::NotNumeric`] for any other type.
pub fn to_f64_array(column: &str, array: &ArrayRef) -> Result<Float64Array> {
    let data_type = array.data_type();
    if !is_numeric_type(data_type) && *data_type != DataType::Boolean {
        return Err(Error::not_numeric(column, data_type));
    }
    let floats = cast(array.as_ref(), &DataType::Float64)?;
    Ok(floats.as_primitive::<arrow::datatypes::Float64Type>().clone())
}

/// Finite (non-null, non-NaN) values of a numeric column.
///
/// # Errors
///
/// Returns [`Error::NotNumeric`] for non-numeric columns.
pub fn finite_values(column: &str, array: &ArrayRef) -> Result<Vec<f64>> {
    Ok(numeric_values(column, array)?
        .into_iter()
        .filter(|v| !v.is_nan())
        .collect())
}

/// Counts values that are neither null nor NaN.
pub fn non_null_count(array: &ArrayRef) -> usize {
    match array.data_type() {
        DataType::Float64 => array
            .as_primitive::<arrow::datatypes::Float64Type>()
            .iter()
            .filter(|v| v.is_some_and(|x| !x.is_nan()))
            .count(),
        DataType::Float32 => array
            .as_primitive::<arrow::datatypes::Float32Type>()
            .iter()
            .filter(|v| v.is_some_and(|x| !x.is_nan()))
            .count(),
        _ => array.len() - array.null_count(),
    }
}

/// Reads every value of a column as a [`CategoryValue`].
///
/// # Errors
///
/// Returns an error if the column type has no category representation.
pub fn category_values(column: &str, array: &ArrayRef) -> Result<Vec<CategoryValue>> {
    let data_type = array.data_type();
    if *data_type == DataType::Boolean {
        let bools = array.as_boolean();
        return Ok(bools
            .iter()
            .map(|v| v.map_or(CategoryValue::Null, CategoryValue::Bool))
            .collect());
    }
    if is_string_type(data_type) {
        let strings = cast(array.as_ref(), &DataType::Utf8)?;
        return Ok(strings
            .as_string::<i32>()
            .iter()
            .map(|v| v.map_or(CategoryValue::Null, |s| CategoryValue::Str(s.to_string())))
            .collect());
    }
    if is_integer_type(data_type) {
        let ints = cast(array.as_ref(), &DataType::Int64)?;
        return Ok(ints
            .as_primitive::<arrow::datatypes::Int64Type>()
            .iter()
            .map(|v| v.map_or(CategoryValue::Null, CategoryValue::Int))
            .collect());
    }
    if is_numeric_type(data_type) {
        return Ok(numeric_values(column, array)?
            .into_iter()
            .map(|v| {
                if v.is_nan() {
                    CategoryValue::Null
                } else {
                    CategoryValue::Float(v)
                }
            })
            .collect());
    }
    if matches!(data_type, DataType::Date32 | DataType::Timestamp(_, _)) {
        let strings = cast(array.as_ref(), &DataType::Utf8)?;
        return Ok(strings
            .as_string::<i32>()
            .iter()
            .map(|v| v.map_or(CategoryValue::Null, |s| CategoryValue::Str(s.to_string())))
            .collect());
    }
    Err(Error::data(format!(
        "Column '{column}' of type {data_type} has no category representation"
    )))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use arrow::array::{BooleanArray, Int32Array, StringArray};

    use super::*;

    #[test]
    fn test_numeric_values_nulls_become_nan() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(3)]));
        let values = numeric_values("x", &array)
            .ok()
            .unwrap_or_else(|| panic!("Should convert"));
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 3.0);
    }

    #[test]
    fn test_numeric_values_rejects_strings() {
        let array: ArrayRef = Arc::new(StringArray::from(vec!["a"]));
        let result = numeric_values("name", &array);
        assert!(matches!(result, Err(Error::NotNumeric { .. })));
    }

    #[test]
    fn test_non_null_count_treats_nan_as_null() {
        let array: ArrayRef = Arc::new(Float64Array::from(vec![
            Some(1.0),
            Some(f64::NAN),
            None,
            Some(2.0),
        ]));
        assert_eq!(non_null_count(&array), 2);
    }

    #[test]
    fn test_category_values_of_bools() {
        let array: ArrayRef = Arc::new(BooleanArray::from(vec![Some(true), None]));
        let values = category_values("b", &array)
            .ok()
            .unwrap_or_else(|| panic!("Should convert"));
        assert_eq!(values, vec![CategoryValue::Bool(true), CategoryValue::Null]);
    }

    #[test]
    fn test_int_and_float_compare_numerically() {
        assert_eq!(CategoryValue::Int(2), CategoryValue::Float(2.0));
        let set: HashSet<CategoryValue> = [CategoryValue::Int(2), CategoryValue::Float(2.0)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 1);
        assert!(CategoryValue::Null < CategoryValue::Str("a".to_string()));
    }

    #[test]
    fn test_category_value_json_is_plain() {
        let cats = vec![
            CategoryValue::Str("A".to_string()),
            CategoryValue::Int(3),
            CategoryValue::Bool(false),
        ];
        let json = serde_json::to_string(&cats)
            .ok()
            .unwrap_or_else(|| panic!("Should serialize"));
        assert_eq!(json, r#"["A",3,false]"#);
        let back: Vec<CategoryValue> = serde_json::from_str(&json)
            .ok()
            .unwrap_or_else(|| panic!("Should deserialize"));
        assert_eq!(back, cats);
    }
}
