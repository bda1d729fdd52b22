//! Fitting null-fill rules from sample statistics.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::sql;
use crate::{
    config::PerColumn,
    dataset::FileDataset,
    error::{Error, Result},
    stats::{values::is_numeric_type, SampleStat, Tail},
    timeaux::T_ORD_COL,
    transform::{ColumnNullFill, FillMethod, FillWindow, NullFillSpec},
};

/// File holding the fill statement as a JSON string.
pub const NULL_FILL_SQL_STATEMENT_FILE: &str = "nullFillSQLStatement.json";
/// File holding the fill details map.
pub const NULL_FILL_DETAILS_FILE: &str = "nullFillDetails.json";

/// A fill method and, for time series, its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillRule {
    /// Aggregate.
    pub method: FillMethod,
    /// Window; `None` fills with the global scalar only.
    #[serde(default)]
    pub window: Option<FillWindow>,
}

impl FillRule {
    /// Parses `mean`, `max_before`, `avg_partition`, ...
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unknown methods or windows.
    pub fn parse(s: &str) -> Result<Self> {
        let (method, window) = FillMethod::parse(s)?;
        Ok(Self { method, window })
    }

    /// Statistic the fallback scalar is computed with. Before/after windows
    /// use the mean.
    fn fallback_stat(self) -> SampleStat {
        match (self.window, self.method) {
            (Some(FillWindow::Before | FillWindow::After), _) | (_, FillMethod::Mean) => {
                SampleStat::Mean
            }
            (_, FillMethod::Min) => SampleStat::Min,
            (_, FillMethod::Max) => SampleStat::Max,
        }
    }
}

/// How nulls are filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillOptions {
    /// Rule for columns without an explicit value; `None` when a scalar
    /// value is given instead.
    pub method: Option<FillRule>,
    /// Per-column rules, taking precedence over everything else.
    pub methods: BTreeMap<String, FillRule>,
    /// Scalar used when no rule applies.
    pub value: Option<f64>,
    /// Per-column scalars, used when no rule applies.
    pub values: BTreeMap<String, f64>,
    /// Per-column sentinel bounds `(lower, upper)`.
    pub nulls: BTreeMap<String, (Option<f64>, Option<f64>)>,
    /// Tails excluded when computing fallback statistics.
    pub outlier_tails: PerColumn<Tail>,
    /// Also fill values outside the outlier-resistant bounds.
    pub fill_outliers: PerColumn<bool>,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            method: Some(FillRule::default()),
            methods: BTreeMap::new(),
            value: None,
            values: BTreeMap::new(),
            nulls: BTreeMap::new(),
            outlier_tails: PerColumn::new(Tail::Both),
            fill_outliers: PerColumn::new(false),
        }
    }
}

impl FillOptions {
    /// Uses `rule` for every column.
    #[must_use]
    pub fn with_rule(mut self, rule: FillRule) -> Self {
        self.method = Some(rule);
        self
    }

    /// Uses `rule` for `column`.
    #[must_use]
    pub fn with_column_rule(mut self, column: impl Into<String>, rule: FillRule) -> Self {
        self.methods.insert(column.into(), rule);
        self
    }

    /// Fills every column with `value` instead of a fitted statistic.
    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.method = None;
        self.value = Some(value);
        self
    }

    /// Fills `column` with `value` when no rule applies to it.
    #[must_use]
    pub fn with_column_value(mut self, column: impl Into<String>, value: f64) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    /// Treats values `<= lower` or `>= upper` of `column` as null.
    #[must_use]
    pub fn with_nulls(mut self, column: impl Into<String>, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.nulls.insert(column.into(), (lower, upper));
        self
    }

    /// Excludes `tails` for every column.
    #[must_use]
    pub fn with_outlier_tails(mut self, tails: Tail) -> Self {
        self.outlier_tails = PerColumn::new(tails);
        self
    }

    /// Fills outliers of every column.
    #[must_use]
    pub fn with_fill_outliers(mut self, fill: bool) -> Self {
        self.fill_outliers = PerColumn::new(fill);
        self
    }

    fn rule_for(&self, column: &str) -> Option<FillRule> {
        if let Some(rule) = self.methods.get(column) {
            return Some(*rule);
        }
        if self.values.contains_key(column) {
            return None;
        }
        self.method
    }

    fn value_for(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied().or(self.value)
    }
}

impl NullFillSpec {
    /// Writes the statement and the details map into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io(e, dir))?;
        write_json(&dir.join(NULL_FILL_SQL_STATEMENT_FILE), &self.sql_statement())?;
        write_json(&dir.join(NULL_FILL_DETAILS_FILE), self)
    }

    /// Reads a spec written by [`NullFillSpec::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the details file is missing or malformed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        read_json(&dir.as_ref().join(NULL_FILL_DETAILS_FILE))
    }
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| Error::io(e, path))
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
    Ok(serde_json::from_str(&text)?)
}

impl FileDataset {
    /// Fits null-fill rules for `cols`.
    ///
    /// With no columns given, the columns named in the per-column options
    /// are used, else every content column. Index columns and `__tOrd__`
    /// are never filled. Non-numeric columns and columns without a usable
    /// fallback are skipped.
    ///
    /// # Errors
    ///
    /// Windowed rules need both an index and a time column
    /// ([`Error::InvalidConfig`]); statistics errors propagate.
    pub fn fit_null_fill(&self, cols: &[String], options: &FillOptions) -> Result<NullFillSpec> {
        let mut cols: BTreeSet<String> = cols.iter().cloned().collect();
        if cols.is_empty() {
            cols.extend(options.methods.keys().cloned());
            cols.extend(options.values.keys().cloned());
        }
        if cols.is_empty() {
            cols.extend(self.content_cols());
        }
        for excluded in self.index_cols() {
            cols.remove(&excluded);
        }
        cols.remove(T_ORD_COL);

        let mut spec = NullFillSpec {
            index_col: self.index_col().map(str::to_string),
            ..NullFillSpec::default()
        };
        let mut windows = BTreeSet::new();

        for col in cols {
            let data_type = self.column_type(&col)?;
            if !is_numeric_type(&data_type) {
                debug!(column = %col, %data_type, "skipping non-numeric column");
                continue;
            }
            let tails = options.outlier_tails.value(&col);
            let rule = options.rule_for(&col);
            if rule.is_some_and(|r| r.window.is_some()) && !self.has_time_series() {
                return Err(Error::invalid_config(format!(
                    "Windowed null-fill of '{col}' needs index and time columns"
                )));
            }

            let fallback = match rule {
                Some(rule) => Some(self.outlier_rst_stat(&col, rule.fallback_stat(), tails)?),
                None => options.value_for(&col),
            };
            let Some(fallback) = fallback.filter(|v| !v.is_nan()) else {
                debug!(column = %col, "no fallback value; column left unfilled");
                continue;
            };

            let window = rule.and_then(|r| r.window);
            let fill_outliers = options.fill_outliers.value(&col);
            let track_outliers = window.is_some() || fill_outliers;
            let mut fill = ColumnNullFill::scalar(
                &col,
                options.nulls.get(&col).copied().unwrap_or((None, None)),
                fallback,
            );
            if track_outliers && tails.excludes_lower() {
                fill.outlier_min = Some(self.outlier_rst_min(&col)?);
            }
            if track_outliers && tails.excludes_upper() {
                fill.outlier_max = Some(self.outlier_rst_max(&col)?);
            }
            fill.fill_outliers = fill_outliers;
            if let (Some(rule), Some(window)) = (rule, window) {
                fill.method = Some(rule.method);
                fill.window = Some(window);
                windows.insert(window);
                windows.extend(window.opposite());
            }
            fill.sql = fill.to_sql(&col, spec.index_col.as_deref());
            spec.columns
                .insert(col.clone(), (NullFillSpec::output_name(&col), fill));
        }

        if let Some(index_col) = &spec.index_col {
            spec.window_clause = sql::window_clause(&windows, index_col);
        }
        info!(columns = spec.columns.len(), "fitted null-fill");
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parse_and_fallback_stat() {
        let rule = FillRule::parse("max_before")
            .ok()
            .unwrap_or_else(|| panic!("Should parse"));
        assert_eq!(rule.method, FillMethod::Max);
        assert_eq!(rule.fallback_stat(), SampleStat::Mean);

        let rule = FillRule::parse("min_partition")
            .ok()
            .unwrap_or_else(|| panic!("Should parse"));
        assert_eq!(rule.fallback_stat(), SampleStat::Min);
        assert_eq!(FillRule::default().fallback_stat(), SampleStat::Mean);
    }

    #[test]
    fn test_rule_resolution_order() {
        let options = FillOptions::default()
            .with_column_value("a", 1.0)
            .with_column_rule("b", FillRule::parse("max").ok().unwrap_or_default());
        assert!(options.rule_for("a").is_none());
        assert_eq!(options.value_for("a"), Some(1.0));
        assert_eq!(options.rule_for("b").map(|r| r.method), Some(FillMethod::Max));
        assert_eq!(options.rule_for("c"), Some(FillRule::default()));

        let scalar = FillOptions::default().with_value(7.0);
        assert!(scalar.rule_for("c").is_none());
        assert_eq!(scalar.value_for("c"), Some(7.0));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir()
            .ok()
            .unwrap_or_else(|| panic!("Should create temp dir"));
        let mut spec = NullFillSpec::default();
        spec.columns.insert(
            "x".to_string(),
            (
                NullFillSpec::output_name("x"),
                ColumnNullFill::scalar("x", (Some(-1.0), None), 0.25),
            ),
        );
        spec.save(dir.path())
            .ok()
            .unwrap_or_else(|| panic!("Should save"));
        let statement: String = read_json(&dir.path().join(NULL_FILL_SQL_STATEMENT_FILE))
            .ok()
            .unwrap_or_else(|| panic!("Should read statement"));
        assert_eq!(statement, spec.sql_statement());
        let loaded = NullFillSpec::load(dir.path())
            .ok()
            .unwrap_or_else(|| panic!("Should load"));
        assert_eq!(loaded, spec);
    }
}
