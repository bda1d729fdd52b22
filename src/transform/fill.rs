//! Fitted null-fills and their executor.
//!
//! A [`NullFillSpec`] is a fitted snapshot: per column, the sentinel null
//! bounds, optional outlier bounds, the fallback scalar and, for time
//! series, the window used to look for a nearby valid value. Applying it
//! writes `__NullFill__<col>__` and never reads statistics again.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use arrow::array::{Float64Array, RecordBatch};
use serde::{Deserialize, Serialize};

use super::{column, set_column, Transform};
use crate::{
    error::{Error, Result},
    prep::sql,
    stats::values::{category_values, numeric_values, CategoryValue},
    timeaux::T_ORD_COL,
};

/// Prefix of null-filled columns.
pub const NULL_FILL_PREFIX: &str = "__NullFill__";
/// Suffix shared by all generated prep columns.
pub const PREP_SUFFIX: &str = "__";

/// Aggregate used to compute a fill value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMethod {
    /// Arithmetic mean.
    #[default]
    #[serde(alias = "avg")]
    Mean,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl FillMethod {
    /// Method used on the opposite window: min and max swap.
    pub fn opposite(self) -> Self {
        match self {
            Self::Mean => Self::Mean,
            Self::Min => Self::Max,
            Self::Max => Self::Min,
        }
    }

    /// Parses `mean`, `avg`, `min`, `max`, optionally suffixed with
    /// `_partition`, `_before` or `_after`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for anything else.
    pub fn parse(s: &str) -> Result<(Self, Option<FillWindow>)> {
        let lower = s.to_ascii_lowercase();
        let (method, window) = match lower.split_once('_') {
            Some((m, w)) => (m, Some(w)),
            None => (lower.as_str(), None),
        };
        let method = match method {
            "mean" | "avg" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return Err(Error::invalid_config(format!("Unknown fill method '{s}'"))),
        };
        let window = match window {
            None => None,
            Some("partition") => Some(FillWindow::Partition),
            Some("before") => Some(FillWindow::Before),
            Some("after") => Some(FillWindow::After),
            Some(_) => return Err(Error::invalid_config(format!("Unknown fill window in '{s}'"))),
        };
        Ok((method, window))
    }

    /// SQL aggregate function name.
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// Rows of the same entity a windowed fill looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillWindow {
    /// All rows of the entity.
    Partition,
    /// Rows strictly before, by time order.
    Before,
    /// Rows strictly after, by time order.
    After,
}

impl FillWindow {
    /// The window searched second; `Partition` has none.
    pub fn opposite(self) -> Option<Self> {
        match self {
            Self::Partition => None,
            Self::Before => Some(Self::After),
            Self::After => Some(Self::Before),
        }
    }

    /// Name of the window in emitted SQL.
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Partition => "partitionByI",
            Self::Before => "partitionByI_orderByT_before",
            Self::After => "partitionByI_orderByT_after",
        }
    }
}

impl fmt::Display for FillWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// Fitted null-fill rule of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnNullFill {
    /// Equivalent SQL expression.
    #[serde(rename = "SQL")]
    pub sql: String,
    /// Sentinel bounds: values `<= lower` or `>= upper` are null.
    pub nulls: (Option<f64>, Option<f64>),
    /// Fallback scalar.
    pub null_fill_value: f64,
    /// Window aggregate tried before the scalar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<FillMethod>,
    /// Window of the aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<FillWindow>,
    /// Outlier-resistant lower bound when the lower tail is excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_min: Option<f64>,
    /// Outlier-resistant upper bound when the upper tail is excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_max: Option<f64>,
    /// Treat values outside the outlier bounds as null.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fill_outliers: bool,
}

impl ColumnNullFill {
    /// A global-scalar rule with sentinel bounds only.
    pub fn scalar(column: &str, nulls: (Option<f64>, Option<f64>), null_fill_value: f64) -> Self {
        let mut fill = Self {
            sql: String::new(),
            nulls,
            null_fill_value,
            method: None,
            window: None,
            outlier_min: None,
            outlier_max: None,
            fill_outliers: false,
        };
        fill.sql = fill.to_sql(column, None);
        fill
    }

    /// Returns true if `v` counts as null for this rule.
    pub fn is_null(&self, v: f64) -> bool {
        self.is_sentinel(v) || (self.fill_outliers && self.is_outlier(v))
    }

    fn is_sentinel(&self, v: f64) -> bool {
        v.is_nan()
            || self.nulls.0.is_some_and(|l| v <= l)
            || self.nulls.1.is_some_and(|u| v >= u)
    }

    fn is_outlier(&self, v: f64) -> bool {
        self.outlier_min.is_some_and(|m| v < m) || self.outlier_max.is_some_and(|m| v > m)
    }

    /// Rebuilds the SQL expression from the rule. Window aggregates are
    /// emitted only when `index_col` is given.
    pub fn to_sql(&self, column: &str, index_col: Option<&str>) -> String {
        let (lower, upper) = self.nulls;
        let main_outliers = if self.fill_outliers {
            (self.outlier_min, self.outlier_max)
        } else {
            (None, None)
        };
        let mut fallbacks = Vec::new();
        if let (Some(method), Some(window), Some(_)) = (self.method, self.window, index_col) {
            let window_cond =
                sql::null_condition(column, lower, upper, self.outlier_min, self.outlier_max);
            fallbacks.push(sql::window_aggregate(method.sql_name(), column, &window_cond, window.sql_name()));
            if let Some(opposite) = window.opposite() {
                fallbacks.push(sql::window_aggregate(
                    method.opposite().sql_name(),
                    column,
                    &window_cond,
                    opposite.sql_name(),
                ));
            }
        }
        fallbacks.push(sql::float_literal(self.null_fill_value));
        let cond = sql::null_condition(column, lower, upper, main_outliers.0, main_outliers.1);
        sql::coalesce(column, &cond, &fallbacks)
    }
}

/// Fitted null-fill rules, keyed by source column.
///
/// Serializes as the flat details map `column -> [output, {SQL, Nulls,
/// NullFillValue, ...}]`, plus `__TS_WINDOW_CLAUSE__` and `__I_COL__` when
/// windowed rules are present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NullFillSpec {
    /// Entity column windows partition by.
    #[serde(rename = "__I_COL__", default, skip_serializing_if = "Option::is_none")]
    pub index_col: Option<String>,
    /// SQL `WINDOW` clause for windowed rules.
    #[serde(
        rename = "__TS_WINDOW_CLAUSE__",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub window_clause: Option<String>,
    /// Source column to (output column, rule).
    #[serde(flatten)]
    pub columns: BTreeMap<String, (String, ColumnNullFill)>,
}

impl NullFillSpec {
    /// Output column name for `column`.
    pub fn output_name(column: &str) -> String {
        format!("{NULL_FILL_PREFIX}{column}{PREP_SUFFIX}")
    }

    /// Returns true if no column is filled.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Output column names, in source column order.
    pub fn output_columns(&self) -> Vec<String> {
        self.columns.values().map(|(out, _)| out.clone()).collect()
    }

    /// The equivalent `SELECT *, ... FROM __THIS__` statement.
    pub fn sql_statement(&self) -> String {
        let items: Vec<(String, String)> = self
            .columns
            .values()
            .map(|(out, fill)| (fill.sql.clone(), out.clone()))
            .collect();
        sql::select_statement(&items, self.window_clause.as_deref())
    }
}

impl Transform for NullFillSpec {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let mut batch = batch;
        let groups = if self.columns.values().any(|(_, f)| f.window.is_some()) {
            Some(entity_groups(&batch, self.index_col.as_deref())?)
        } else {
            None
        };

        for (col, (out, fill)) in &self.columns {
            let values = numeric_values(col, column(&batch, col)?)?;
            let filled = fill_values(&values, fill, groups.as_deref());
            batch = set_column(&batch, out, Arc::new(Float64Array::from(filled)))?;
        }
        Ok(batch)
    }
}

/// Applies one rule to a column.
pub(crate) fn fill_values(values: &[f64], fill: &ColumnNullFill, groups: Option<&[Vec<usize>]>) -> Vec<f64> {
    let (primary, secondary) = match (fill.method, fill.window, groups) {
        (Some(method), Some(window), Some(groups)) => {
            let valid: Vec<bool> = values
                .iter()
                .map(|v| !(fill.is_sentinel(*v) || fill.is_outlier(*v)))
                .collect();
            let primary = window_aggregate(values, &valid, groups, method, window);
            let secondary = window
                .opposite()
                .map(|w| window_aggregate(values, &valid, groups, method.opposite(), w));
            (Some(primary), secondary)
        }
        _ => (None, None),
    };

    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if !fill.is_null(*v) {
                return *v;
            }
            [
                primary.as_ref().map(|p| p[i]),
                secondary.as_ref().map(|s| s[i]),
            ]
            .into_iter()
            .flatten()
            .find(|x| !x.is_nan())
            .unwrap_or(fill.null_fill_value)
        })
        .collect()
}

/// Row indices per entity, each ordered by `__tOrd__` when present.
fn entity_groups(batch: &RecordBatch, index_col: Option<&str>) -> Result<Vec<Vec<usize>>> {
    let index_col = index_col
        .ok_or_else(|| Error::invalid_config("Windowed null-fill needs an index column"))?;
    let ids = category_values(index_col, column(batch, index_col)?)?;
    let order = match batch.column_by_name(T_ORD_COL) {
        Some(t) => numeric_values(T_ORD_COL, t)?,
        None => (0..batch.num_rows()).map(|i| i as f64).collect(),
    };

    let mut groups: HashMap<CategoryValue, Vec<usize>> = HashMap::new();
    for (row, id) in ids.into_iter().enumerate() {
        groups.entry(id).or_default().push(row);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    for rows in &mut groups {
        rows.sort_by(|a, b| order[*a].total_cmp(&order[*b]));
    }
    Ok(groups)
}

#[derive(Debug, Clone, Copy)]
struct Acc {
    sum: f64,
    count: usize,
    min: f64,
    max: f64,
}

impl Acc {
    fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self, method: FillMethod) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        match method {
            FillMethod::Mean => self.sum / self.count as f64,
            FillMethod::Min => self.min,
            FillMethod::Max => self.max,
        }
    }
}

fn window_aggregate(
    values: &[f64],
    valid: &[bool],
    groups: &[Vec<usize>],
    method: FillMethod,
    window: FillWindow,
) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for rows in groups {
        match window {
            FillWindow::Partition => {
                let mut acc = Acc::new();
                rows.iter().filter(|r| valid[**r]).for_each(|r| acc.push(values[*r]));
                let v = acc.value(method);
                rows.iter().for_each(|r| out[*r] = v);
            }
            FillWindow::Before => {
                let mut acc = Acc::new();
                for r in rows {
                    out[*r] = acc.value(method);
                    if valid[*r] {
                        acc.push(values[*r]);
                    }
                }
            }
            FillWindow::After => {
                let mut acc = Acc::new();
                for r in rows.iter().rev() {
                    out[*r] = acc.value(method);
                    if valid[*r] {
                        acc.push(values[*r]);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::{Array, Int64Array},
        datatypes::{DataType, Field, Schema},
    };

    use super::*;

    fn create_test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new(T_ORD_COL, DataType::Int64, false),
            Field::new("x", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 1, 1, 2, 2])),
                Arc::new(Int64Array::from(vec![0, 1, 2, 0, 1])),
                Arc::new(Float64Array::from(vec![
                    Some(1.0),
                    None,
                    Some(5.0),
                    Some(-999.0),
                    Some(4.0),
                ])),
            ],
        )
        .ok()
        .unwrap_or_else(|| panic!("Should create batch"))
    }

    fn filled(batch: &RecordBatch) -> Vec<f64> {
        batch
            .column_by_name("__NullFill__x__")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>().cloned())
            .unwrap_or_else(|| panic!("Should have filled column"))
            .values()
            .to_vec()
    }

    fn spec(fill: ColumnNullFill) -> NullFillSpec {
        let mut spec = NullFillSpec {
            index_col: Some("id".to_string()),
            ..NullFillSpec::default()
        };
        spec.columns
            .insert("x".to_string(), (NullFillSpec::output_name("x"), fill));
        spec
    }

    #[test]
    fn test_parse_methods() {
        assert_eq!(
            FillMethod::parse("avg_before").ok(),
            Some((FillMethod::Mean, Some(FillWindow::Before)))
        );
        assert_eq!(FillMethod::parse("MAX").ok(), Some((FillMethod::Max, None)));
        assert!(FillMethod::parse("median").is_err());
        assert!(FillMethod::parse("mean_sideways").is_err());
    }

    #[test]
    fn test_scalar_fill_with_sentinel() {
        let fill = ColumnNullFill::scalar("x", (Some(-100.0), None), 3.0);
        let out = spec(fill)
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should fill"));
        assert_eq!(filled(&out), vec![1.0, 3.0, 5.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fill_is_idempotent() {
        let fill = ColumnNullFill::scalar("x", (Some(-100.0), None), 3.0);
        let spec = spec(fill);
        let once = spec
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should fill"));
        let twice = spec
            .apply(once.clone())
            .ok()
            .unwrap_or_else(|| panic!("Should fill again"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_before_window_falls_back_to_after() {
        let mut fill = ColumnNullFill::scalar("x", (Some(-100.0), None), 0.0);
        fill.method = Some(FillMethod::Max);
        fill.window = Some(FillWindow::Before);
        let out = spec(fill)
            .apply(create_test_batch())
            .ok()
            .unwrap_or_else(|| panic!("Should fill"));
        // Entity 1 row 1: max of earlier valid values is 1.0.
        // Entity 2 row 0: nothing before, min of later valid values is 4.0.
        assert_eq!(filled(&out), vec![1.0, 1.0, 5.0, 4.0, 4.0]);
    }

    #[test]
    fn test_outliers_filled_only_when_requested() {
        let mut fill = ColumnNullFill::scalar("x", (None, None), 2.0);
        fill.outlier_max = Some(4.5);
        assert!(!fill.is_null(5.0));
        fill.fill_outliers = true;
        assert!(fill.is_null(5.0));
        assert!(fill.is_null(f64::NAN));
        assert!(!fill.is_null(4.5));
    }

    #[test]
    fn test_sql_and_json_shape() {
        let mut fill = ColumnNullFill::scalar("x", (Some(-100.0), None), 3.0);
        assert_eq!(
            fill.sql,
            "COALESCE(CASE WHEN (STRING(x) = 'NaN') OR (x <= -100.0) THEN NULL ELSE x END, 3.0)"
        );

        fill.method = Some(FillMethod::Mean);
        fill.window = Some(FillWindow::Partition);
        fill.sql = fill.to_sql("x", Some("id"));
        assert!(fill.sql.contains("mean(CASE"));
        assert!(fill.sql.contains("OVER partitionByI"));

        let mut s = spec(fill);
        s.window_clause = Some("WINDOW partitionByI AS (PARTITION BY id)".to_string());
        let json = serde_json::to_value(&s)
            .ok()
            .unwrap_or_else(|| panic!("Should serialize"));
        assert_eq!(json["x"][0], "__NullFill__x__");
        assert_eq!(json["x"][1]["NullFillValue"], 3.0);
        assert_eq!(json["__I_COL__"], "id");
        let back: NullFillSpec = serde_json::from_value(json)
            .ok()
            .unwrap_or_else(|| panic!("Should deserialize"));
        assert_eq!(back, s);
        assert!(back.sql_statement().starts_with("SELECT *, COALESCE("));
        assert!(back.sql_statement().ends_with("FROM __THIS__ WINDOW partitionByI AS (PARTITION BY id)"));
    }

    #[test]
    fn test_missing_column_errors() {
        let mut s = NullFillSpec::default();
        s.columns.insert(
            "y".to_string(),
            (NullFillSpec::output_name("y"), ColumnNullFill::scalar("y", (None, None), 0.0)),
        );
        assert!(matches!(
            s.apply(create_test_batch()),
            Err(Error::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_window_without_index_is_invalid() {
        let mut fill = ColumnNullFill::scalar("x", (None, None), 0.0);
        fill.method = Some(FillMethod::Mean);
        fill.window = Some(FillWindow::Partition);
        let mut s = spec(fill);
        s.index_col = None;
        assert!(matches!(
            s.apply(create_test_batch()),
            Err(Error::InvalidConfig { .. })
        ));
        assert_eq!(create_test_batch().column(2).null_count(), 1);
    }
}
