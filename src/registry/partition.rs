//! Partition keys encoded in piece paths as `key=value/` segments.

use std::{collections::BTreeMap, fmt, sync::Arc};

use arrow::{
    array::{ArrayRef, Date32Array, RecordBatch, StringArray},
    datatypes::{DataType, Field, Schema},
};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Partition key whose values are parsed as calendar dates.
pub const DATE_PARTITION_KEY: &str = "date";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[allow(clippy::unwrap_used)]
static PARTITION_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^/=]+)=([^/]+)/").unwrap());

/// A partition value parsed from a path segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionValue {
    /// Value of the reserved `date` key.
    Date(NaiveDate),
    /// Any other value, verbatim.
    Str(String),
}

impl PartitionValue {
    /// The Arrow type of the constant column this value becomes.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Date(_) => DataType::Date32,
            Self::Str(_) => DataType::Utf8,
        }
    }

    fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            Self::Date(d) => {
                let days = days_since_epoch(*d);
                Arc::new(Date32Array::from(vec![days; len]))
            }
            Self::Str(s) => Arc::new(StringArray::from(vec![s.as_str(); len])),
        }
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Partition key/value pairs of one piece, ordered by key.
pub type PartitionKvs = BTreeMap<String, PartitionValue>;

#[allow(clippy::cast_possible_truncation)]
fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

/// Extracts partition key/value pairs from a piece path.
///
/// Only segments followed by `/` count, so a file name such as
/// `x=1.parquet` is never a partition. A `date` value that is not
/// `YYYY-MM-DD` is kept as a string.
pub fn parse_partition_kvs(path: &str) -> PartitionKvs {
    let mut kvs = PartitionKvs::new();
    for caps in PARTITION_SEGMENT.captures_iter(path) {
        let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let key = key.as_str();
        let value = value.as_str();
        let parsed = if key == DATE_PARTITION_KEY {
            match NaiveDate::parse_from_str(value, DATE_FORMAT) {
                Ok(date) => PartitionValue::Date(date),
                Err(_) => {
                    tracing::warn!(path, value, "unparseable date partition kept as string");
                    PartitionValue::Str(value.to_string())
                }
            }
        } else {
            PartitionValue::Str(value.to_string())
        };
        kvs.insert(key.to_string(), parsed);
    }
    kvs
}

/// Appends one constant column per partition key.
///
/// Keys already present as columns in `batch` are left untouched.
///
/// # Errors
///
/// Returns an error if the resulting batch cannot be assembled.
pub fn attach_partition_columns(batch: RecordBatch, kvs: &PartitionKvs) -> Result<RecordBatch> {
    let schema = batch.schema();
    let missing: Vec<(&String, &PartitionValue)> = kvs
        .iter()
        .filter(|(k, _)| schema.column_with_name(k).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(batch);
    }

    let num_rows = batch.num_rows();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns = batch.columns().to_vec();
    for (key, value) in missing {
        fields.push(Field::new(key, value.data_type(), false));
        columns.push(value.to_array(num_rows));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(Error::Arrow)
}
