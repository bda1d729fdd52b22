//! Fitting a [`PrepSpec`] from the repr sample.

use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CatDetails, FillOptions, NumDetails, PrepSpec, Scaler};
use crate::{
    dataset::FileDataset,
    error::{Error, Result},
    stats::{
        numeric,
        values::{is_numeric_type, CategoryValue},
        SampleStat, Tail,
    },
    transform::{
        ScalerParams, CAT_IDX_PREFIX, MAX_ABS_SCL_PREFIX, MIN_MAX_SCL_PREFIX, NULL_FILL_PREFIX,
        PREP_SUFFIX, STD_SCL_PREFIX,
    },
};

/// How a prep is fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepOptions {
    /// Null-fill of numeric columns. Required.
    pub fill: Option<FillOptions>,
    /// Numeric scaler; `None` keeps filled values unscaled.
    pub scaler: Option<Scaler>,
    /// Rescale categorical indices into `[-1, 1]`.
    pub scale_cat: bool,
    /// Columns always treated as categorical, with every category kept.
    pub force_cat: BTreeSet<String>,
    /// Columns never treated as categorical.
    pub force_num: BTreeSet<String>,
    /// Directory the fitted prep is saved to.
    pub save_path: Option<PathBuf>,
    /// Directory a saved prep is loaded from instead of fitting.
    pub load_path: Option<PathBuf>,
}

impl Default for PrepOptions {
    fn default() -> Self {
        Self {
            fill: Some(FillOptions::default()),
            scaler: Some(Scaler::Standard),
            scale_cat: true,
            force_cat: BTreeSet::new(),
            force_num: BTreeSet::new(),
            save_path: None,
            load_path: None,
        }
    }
}

impl PrepOptions {
    /// Uses `fill` for numeric columns.
    #[must_use]
    pub fn with_fill(mut self, fill: FillOptions) -> Self {
        self.fill = Some(fill);
        self
    }

    /// Uses `scaler` for numeric columns.
    #[must_use]
    pub fn with_scaler(mut self, scaler: Option<Scaler>) -> Self {
        self.scaler = scaler;
        self
    }

    /// Sets whether categorical indices are rescaled.
    #[must_use]
    pub fn with_scale_cat(mut self, scale: bool) -> Self {
        self.scale_cat = scale;
        self
    }

    /// Forces `col` to be categorical.
    #[must_use]
    pub fn force_cat(mut self, col: impl Into<String>) -> Self {
        self.force_cat.insert(col.into());
        self
    }

    /// Forces `col` to be numeric.
    #[must_use]
    pub fn force_num(mut self, col: impl Into<String>) -> Self {
        self.force_num.insert(col.into());
        self
    }

    /// Saves the fitted prep into `dir`.
    #[must_use]
    pub fn save_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_path = Some(dir.into());
        self
    }

    /// Loads a saved prep from `dir` instead of fitting.
    #[must_use]
    pub fn load_from(mut self, dir: impl Into<PathBuf>) -> Self {
        self.load_path = Some(dir.into());
        self
    }
}

fn prep_name(prefix: &str, col: &str) -> String {
    format!("{prefix}{col}{PREP_SUFFIX}")
}

impl FileDataset {
    /// Fits a prep over `cols`, or over every sufficiently non-null feature
    /// column when `cols` is empty.
    ///
    /// Columns with at most one distinct non-null value are skipped.
    /// Possibly categorical columns whose top categories cover enough of
    /// the sample become category indices; the remaining numeric columns
    /// are filled and scaled. Numeric columns whose outlier-resistant range
    /// is empty are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fitting`] when no fill is configured; statistics
    /// and persistence errors propagate.
    pub fn fit_prep(&self, cols: &[String], options: &PrepOptions) -> Result<PrepSpec> {
        if let Some(dir) = &options.load_path {
            return Ok(PrepSpec::load(dir)?.as_ref().clone());
        }
        let fill = options
            .fill
            .as_ref()
            .ok_or_else(|| Error::fitting("prep needs a null-fill configuration"))?;

        let requested: BTreeSet<&String> = cols.iter().collect();
        let mut candidates = Vec::new();
        for col in self
            .possible_feature_t_aux_cols()
            .into_iter()
            .chain(self.possible_feature_content_cols())
        {
            if (requested.is_empty() || requested.contains(&col)) && self.suff_non_null(&col)? {
                candidates.push(col);
            }
        }

        let mut kept = BTreeSet::new();
        for col in candidates {
            let non_null_distinct = self.distinct(&col)?.iter().filter(|(v, _)| !v.is_null()).count();
            if non_null_distinct > 1 {
                kept.insert(col);
            } else {
                debug!(column = %col, "skipping constant column");
            }
        }

        let mut spec = PrepSpec::default();
        spec.cat.scale = options.scale_cat;
        spec.num.scaler = options.scaler;
        if kept.is_empty() {
            return Ok(spec);
        }

        let possible_cat: BTreeSet<String> = self.possible_cat_cols().into_iter().collect();
        let mut cat_cols = Vec::new();
        let mut num_cols = Vec::new();
        for col in kept {
            if possible_cat.contains(&col) && !options.force_num.contains(&col) && self.is_cat(&col, options)? {
                cat_cols.push(col);
            } else if is_numeric_type(&self.column_type(&col)?) {
                num_cols.push(col);
            }
        }
        info!(cat = ?cat_cols, num = ?num_cols, "prepping columns");

        for col in &cat_cols {
            let details = self.fit_categories(col, options.force_cat.contains(col))?;
            let idx_col = prep_name(CAT_IDX_PREFIX, col);
            let out = if options.scale_cat {
                format!("{MIN_MAX_SCL_PREFIX}{idx_col}")
            } else {
                idx_col
            };
            spec.cat.columns.insert(col.clone(), (out, details));
        }

        if !num_cols.is_empty() {
            let fill_spec = self.fit_null_fill(&num_cols, fill)?;
            for col in &num_cols {
                let Some((_, col_fill)) = fill_spec.columns.get(col) else {
                    continue;
                };
                let tails = fill.outlier_tails.value(col);
                let (col_min, col_max) = self.outlier_range(col, tails)?;
                if col_min >= col_max {
                    debug!(column = %col, col_min, col_max, "skipping column with empty range");
                    continue;
                }
                let details = NumDetails::fill_only(col_fill.nulls, col_fill.null_fill_value);
                let (prefix, details) = match options.scaler {
                    Some(Scaler::Standard) => {
                        let in_range: Vec<f64> = self
                            .sorted_sample(col)?
                            .into_iter()
                            .filter(|&v| match tails {
                                Tail::Both => v >= col_min && v <= col_max,
                                Tail::Lower => v > col_min,
                                Tail::Upper => v < col_max,
                            })
                            .collect();
                        let std_dev = numeric::std_dev(&in_range);
                        if !std_dev.is_finite() || std_dev <= 0.0 {
                            warn!(column = %col, std_dev, "skipping column without usable spread");
                            continue;
                        }
                        let params = ScalerParams::Standard {
                            mean: col_fill.null_fill_value,
                            std_dev,
                        };
                        (STD_SCL_PREFIX, details.with_params(params))
                    }
                    Some(Scaler::MaxAbs) => {
                        let params = ScalerParams::MaxAbs {
                            max_abs: col_min.abs().max(col_max.abs()),
                        };
                        (MAX_ABS_SCL_PREFIX, details.with_params(params))
                    }
                    Some(Scaler::MinMax) => {
                        let params = ScalerParams::MinMax {
                            orig_min: col_min,
                            orig_max: col_max,
                            target_min: -1.0,
                            target_max: 1.0,
                        };
                        (MIN_MAX_SCL_PREFIX, details.with_params(params))
                    }
                    None => (NULL_FILL_PREFIX, details),
                };
                spec.num.columns.insert(col.clone(), (prep_name(prefix, col), details));
            }
        }

        if let Some(dir) = &options.save_path {
            if options.load_path.as_ref() != Some(dir) {
                spec.save(dir)?;
                info!(path = %dir.display(), "saved prep");
            }
        }
        Ok(spec)
    }

    fn is_cat(&self, col: &str, options: &PrepOptions) -> Result<bool> {
        if options.force_cat.contains(col) {
            return Ok(true);
        }
        let max_n_cats = self.options().max_n_cats.value(col);
        let covered: f64 = self.distinct(col)?.iter().take(max_n_cats).map(|(_, p)| p).sum();
        Ok(covered >= self.options().min_proportion_by_max_n_cats.value(col))
    }

    fn fit_categories(&self, col: &str, keep_all: bool) -> Result<CatDetails> {
        if self.column_type(col)? == arrow::datatypes::DataType::Boolean {
            return Ok(CatDetails {
                cats: vec![CategoryValue::Bool(false), CategoryValue::Bool(true)],
                n_cats: 2,
            });
        }
        let distinct = self.distinct(col)?;
        let limit = if keep_all {
            distinct.len()
        } else {
            self.options().max_n_cats.value(col)
        };
        let cats: Vec<CategoryValue> = distinct
            .iter()
            .take(limit)
            .map(|(v, _)| v.clone())
            .filter(|v| !v.is_null() && *v != CategoryValue::Str(String::new()))
            .collect();
        Ok(CatDetails {
            n_cats: cats.len(),
            cats,
        })
    }

    /// `(min, max)` with the excluded tails at their outlier-resistant
    /// bounds and the others at the sample extremes.
    fn outlier_range(&self, col: &str, tails: Tail) -> Result<(f64, f64)> {
        let min = if tails.excludes_lower() {
            self.outlier_rst_min(col)?
        } else {
            self.sample_stat(col, SampleStat::Min)?
        };
        let max = if tails.excludes_upper() {
            self.outlier_rst_max(col)?
        } else {
            self.sample_stat(col, SampleStat::Max)?
        };
        Ok((min, max))
    }
}
