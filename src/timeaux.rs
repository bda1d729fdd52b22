//! Time-auxiliary columns derived from the time column.
//!
//! Rows are ordered by (entity, time) first, so `__tOrd__` and `__tDelta__`
//! are per-entity positions and gaps.

use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, TimestampMicrosecondArray},
    compute::{cast, lexsort_to_indices, take_record_batch, SortColumn, SortOptions},
    datatypes::{DataType, Field, TimeUnit},
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::{
    error::{Error, Result},
    stats::values::{category_values, CategoryValue},
    transform::set_column,
};

/// 0-based position of a row within its entity.
pub const T_ORD_COL: &str = "__tOrd__";
/// Seconds since the previous row of the same entity.
pub const T_DELTA_COL: &str = "__tDelta__";

/// Calendar parts, as (name, is_fraction).
pub const T_CALENDAR_COLS: [(&str, bool); 16] = [
    ("__HoY__", false),
    ("__QoY__", false),
    ("__MoY__", false),
    ("__PoY__", true),
    ("__QoH__", false),
    ("__MoH__", false),
    ("__PoH__", true),
    ("__MoQ__", false),
    ("__PoQ__", true),
    ("__WoM__", false),
    ("__DoM__", false),
    ("__PoM__", true),
    ("__DoW__", false),
    ("__PoW__", true),
    ("__HoD__", false),
    ("__PoD__", true),
];

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Every generated column name, `__tOrd__` first.
pub fn t_aux_cols() -> Vec<String> {
    let mut cols = vec![T_ORD_COL.to_string(), T_DELTA_COL.to_string()];
    cols.extend(T_CALENDAR_COLS.iter().map(|(c, _)| (*c).to_string()));
    cols
}

/// Generated columns usable as features: all but `__tOrd__`.
pub fn possible_feature_t_aux_cols() -> Vec<String> {
    t_aux_cols().into_iter().skip(1).collect()
}

/// Schema fields of the generated columns, in [`t_aux_cols`] order.
pub fn t_aux_fields() -> Vec<Field> {
    let mut fields = vec![
        Field::new(T_ORD_COL, DataType::Int64, true),
        Field::new(T_DELTA_COL, DataType::Float64, true),
    ];
    fields.extend(T_CALENDAR_COLS.iter().map(|(name, fraction)| {
        let dtype = if *fraction { DataType::Float64 } else { DataType::Int64 };
        Field::new(*name, dtype, true)
    }));
    fields
}

/// Sorts `batch` by (index, time) and adds the time-auxiliary columns.
///
/// Without an index column present, all rows form one entity. Existing
/// auxiliary columns are overwritten.
///
/// # Errors
///
/// Returns an error if the time column is missing or cannot be read as a
/// timestamp.
pub fn generate(batch: RecordBatch, index_col: Option<&str>, time_col: &str) -> Result<RecordBatch> {
    let index = index_col.and_then(|c| batch.column_by_name(c).cloned());
    let time = batch
        .column_by_name(time_col)
        .cloned()
        .ok_or_else(|| Error::column_not_found(time_col))?;

    let micros = to_micros(time_col, &time)?;
    let mut sort_columns = Vec::with_capacity(2);
    if let Some(index) = &index {
        sort_columns.push(SortColumn {
            values: Arc::clone(index),
            options: None,
        });
    }
    sort_columns.push(SortColumn {
        values: Arc::new(micros.clone()) as ArrayRef,
        options: Some(SortOptions {
            descending: false,
            nulls_first: false,
        }),
    });
    let order = lexsort_to_indices(&sort_columns, None)?;
    let batch = take_record_batch(&batch, &order)?;

    let micros = arrow::compute::take(&micros, &order, None)?;
    let micros = micros
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| Error::transform("time column did not cast to microseconds"))?;
    let entities = match index_col.and_then(|c| batch.column_by_name(c).map(|ids| (c, ids))) {
        Some((col, ids)) => category_values(col, ids)?,
        None => vec![CategoryValue::Null; batch.num_rows()],
    };

    let (t_ord, t_delta) = ordinals_and_deltas(&entities, micros);
    let mut batch = set_column(&batch, T_ORD_COL, Arc::new(t_ord))?;
    batch = set_column(&batch, T_DELTA_COL, Arc::new(t_delta))?;

    let datetimes: Vec<Option<NaiveDateTime>> = (0..micros.len())
        .map(|i| {
            micros
                .is_valid(i)
                .then(|| DateTime::from_timestamp_micros(micros.value(i)))
                .flatten()
                .map(|d| d.naive_utc())
        })
        .collect();
    for (name, fraction) in T_CALENDAR_COLS {
        let array: ArrayRef = if fraction {
            Arc::new(
                datetimes
                    .iter()
                    .map(|d| d.and_then(|d| fraction_part(name, &d)))
                    .collect::<Float64Array>(),
            )
        } else {
            Arc::new(
                datetimes
                    .iter()
                    .map(|d| d.and_then(|d| integer_part(name, &d)))
                    .collect::<Int64Array>(),
            )
        };
        batch = set_column(&batch, name, array)?;
    }
    Ok(batch)
}

fn to_micros(time_col: &str, time: &ArrayRef) -> Result<TimestampMicrosecondArray> {
    let target = DataType::Timestamp(TimeUnit::Microsecond, None);
    let source = match time.data_type() {
        DataType::Timestamp(unit, Some(_)) => cast(time, &DataType::Timestamp(*unit, None))?,
        _ => Arc::clone(time),
    };
    let cast_array = cast(&source, &target).map_err(|e| {
        Error::transform(format!("Time column '{time_col}' is not a timestamp: {e}"))
    })?;
    cast_array
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .cloned()
        .ok_or_else(|| Error::transform(format!("Time column '{time_col}' is not a timestamp")))
}

#[allow(clippy::cast_precision_loss)]
fn ordinals_and_deltas(
    entities: &[CategoryValue],
    micros: &TimestampMicrosecondArray,
) -> (Int64Array, Float64Array) {
    let mut t_ord = Vec::with_capacity(entities.len());
    let mut t_delta = Vec::with_capacity(entities.len());
    let mut ord = 0i64;
    for i in 0..entities.len() {
        let same = i > 0 && entities[i] == entities[i - 1];
        ord = if same { ord + 1 } else { 0 };
        t_ord.push(ord);
        let delta = (same && micros.is_valid(i) && micros.is_valid(i - 1))
            .then(|| (micros.value(i) - micros.value(i - 1)) as f64 / 1e6);
        t_delta.push(delta);
    }
    (Int64Array::from(t_ord), Float64Array::from(t_delta))
}

fn integer_part(name: &str, d: &NaiveDateTime) -> Option<i64> {
    let month = i64::from(d.month());
    let value = match name {
        "__HoY__" => (month - 1) / 6 + 1,
        "__QoY__" => (month - 1) / 3 + 1,
        "__MoY__" => month,
        "__QoH__" => ((month - 1) % 6) / 3 + 1,
        "__MoH__" => (month - 1) % 6 + 1,
        "__MoQ__" => (month - 1) % 3 + 1,
        "__WoM__" => (i64::from(d.day()) - 1) / 7 + 1,
        "__DoM__" => i64::from(d.day()),
        "__DoW__" => i64::from(d.weekday().num_days_from_monday()),
        "__HoD__" => i64::from(d.hour()),
        _ => return None,
    };
    Some(value)
}

fn fraction_part(name: &str, d: &NaiveDateTime) -> Option<f64> {
    let day_fraction = f64::from(d.num_seconds_from_midnight()) / SECONDS_PER_DAY;
    let date = d.date();
    let month = d.month();
    let period = |start_month: u32, months: u32| -> Option<f64> {
        let start = NaiveDate::from_ymd_opt(date.year(), start_month, 1)?;
        let end = start.checked_add_months(chrono::Months::new(months))?;
        #[allow(clippy::cast_precision_loss)]
        let elapsed = (date - start).num_days() as f64 + day_fraction;
        #[allow(clippy::cast_precision_loss)]
        let length = (end - start).num_days() as f64;
        Some(elapsed / length)
    };
    match name {
        "__PoY__" => period(1, 12),
        "__PoH__" => period(if month <= 6 { 1 } else { 7 }, 6),
        "__PoQ__" => period((month - 1) / 3 * 3 + 1, 3),
        "__PoM__" => period(month, 1),
        "__PoW__" => Some((f64::from(d.weekday().num_days_from_monday()) + day_fraction) / 7.0),
        "__PoD__" => Some(day_fraction),
        _ => None,
    }
}
