//! Column statistics over the repr sample.
//!
//! Every approximate statistic is computed on one bounded random sample of
//! rows (the *repr sample*), materialized once per handle and shared with
//! handles derived by fill and prep. Exact counts scan all pieces. Results
//! are memoized in the handle's [`StatsCache`].

mod cache;
pub mod numeric;
pub mod values;

use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef},
    datatypes::DataType,
};
use rand::seq::index;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use cache::{ColumnStatsEntry, Distinct, StatsCache};
use values::{
    category_values, finite_values, is_numeric_type, is_possible_cat_type,
    is_possible_feature_type, non_null_count, CategoryValue,
};

use crate::{
    dataset::FileDataset,
    error::{Error, Result},
    sampling::{sample_piece_count, sample_rows, RowSampler},
    timeaux,
};

/// Statistic of a numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStat {
    /// Arithmetic mean.
    Mean,
    /// Median.
    Median,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

/// Which tails are excluded as outliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// Both tails.
    #[default]
    Both,
    /// Only the lower tail.
    Lower,
    /// Only the upper tail.
    Upper,
}

impl Tail {
    /// Returns true if values below the lower bound are outliers.
    pub fn excludes_lower(self) -> bool {
        matches!(self, Self::Both | Self::Lower)
    }

    /// Returns true if values above the upper bound are outliers.
    pub fn excludes_upper(self) -> bool {
        matches!(self, Self::Both | Self::Upper)
    }
}

/// Summary of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    /// Arrow type, rendered.
    pub data_type: String,
    /// Non-null proportion in the repr sample.
    pub non_null_proportion: f64,
    /// Distinct value proportions, for possibly categorical columns.
    pub distinct: Option<Vec<(CategoryValue, f64)>>,
    /// Sample `(min, max)`, numeric only.
    pub sample_range: Option<(f64, f64)>,
    /// Outlier-resistant `(min, max)`, numeric only.
    pub outlier_rst_range: Option<(f64, f64)>,
    /// Sample mean, numeric only.
    pub sample_mean: Option<f64>,
    /// Outlier-resistant mean, numeric only.
    pub outlier_rst_mean: Option<f64>,
    /// Outlier-resistant median, numeric only.
    pub outlier_rst_median: Option<f64>,
}

impl FileDataset {
    /// The repr sample, materialized on first use.
    ///
    /// # Errors
    ///
    /// Propagates read and transform errors; a failed build is retried on
    /// the next call.
    pub fn repr_sample(&self) -> Result<Arc<arrow::array::RecordBatch>> {
        self.stats_cache().repr_sample_or_build(|| {
            let n = self.options().repr_sample_size;
            let pieces = self.piece_paths();
            let k = sample_piece_count(
                n,
                self.approx_n_rows()?,
                pieces.len(),
                self.options().repr_sample_min_pieces,
            );
            let mut rng = self.rng();
            let chosen: Vec<String> = index::sample(&mut rng, pieces.len(), k)
                .into_iter()
                .map(|i| pieces[i].clone())
                .collect();
            let per_piece = n.div_ceil(k.max(1));
            let batch = self.reduce(Some(&chosen), None, RowSampler::TwoStage(per_piece))?;
            let batch = sample_rows(batch, n, &mut rng)?;
            info!(
                pieces = k,
                rows = batch.num_rows(),
                "materialized repr sample"
            );
            Ok(batch)
        })
    }

    /// Exact row count after the mapper chain.
    ///
    /// Uses piece metadata only while every mapper preserves rows.
    ///
    /// # Errors
    ///
    /// Propagates metadata, read and transform errors.
    pub fn n_rows(&self) -> Result<usize> {
        self.stats_cache().n_rows_or(|| {
            if self.pipeline().preserves_rows() {
                self.piece_paths()
                    .iter()
                    .map(|p| self.registry().schema_and_row_count(p).map(|m| m.num_rows()))
                    .sum()
            } else {
                self.piece_paths()
                    .iter()
                    .map(|p| self.read_transformed(p, None).map(|b| b.num_rows()))
                    .sum()
            }
        })
    }

    /// Row count extrapolated from the metadata of a few random pieces.
    ///
    /// # Errors
    ///
    /// Propagates metadata errors.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn approx_n_rows(&self) -> Result<usize> {
        self.stats_cache().approx_n_rows_or(|| {
            let pieces = self.piece_paths();
            let k = self.options().repr_sample_min_pieces.clamp(1, pieces.len().max(1));
            if k >= pieces.len() {
                return pieces
                    .iter()
                    .map(|p| self.registry().schema_and_row_count(p).map(|m| m.num_rows()))
                    .sum();
            }
            let mut rng = self.rng();
            let mut total = 0usize;
            for i in index::sample(&mut rng, pieces.len(), k) {
                total += self.registry().schema_and_row_count(&pieces[i])?.num_rows();
            }
            Ok((pieces.len() as f64 * total as f64 / k as f64).round() as usize)
        })
    }

    /// Exact non-null count of `col` over every piece. NaN counts as null.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns.
    pub fn count(&self, col: &str) -> Result<usize> {
        self.check_column(col)?;
        self.stats_cache().memo(
            col,
            |e| e.count,
            |e, v| e.count = Some(v),
            || {
                let columns = [col.to_string()];
                let mut total = 0;
                for piece in self.piece_paths() {
                    let batch = self.read_transformed(&piece, Some(&columns))?;
                    total += non_null_count(batch.column(0));
                }
                Ok(total)
            },
        )
    }

    /// Non-null proportion of `col` in the repr sample.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns.
    #[allow(clippy::cast_precision_loss)]
    pub fn non_null_proportion(&self, col: &str) -> Result<f64> {
        self.stats_cache().memo(
            col,
            |e| e.non_null_proportion,
            |e, v| e.non_null_proportion = Some(v),
            || {
                let array = self.sample_column(col)?;
                if array.is_empty() {
                    return Ok(0.0);
                }
                Ok(non_null_count(&array) as f64 / array.len() as f64)
            },
        )
    }

    /// Returns true if `col` is non-null often enough to be used.
    ///
    /// # Errors
    ///
    /// As [`FileDataset::non_null_proportion`].
    pub fn suff_non_null(&self, col: &str) -> Result<bool> {
        let threshold = self.options().min_non_null_proportion.value(col);
        Ok(self.non_null_proportion(col)? >= threshold)
    }

    /// Normalized value counts of `col` in the repr sample, most frequent
    /// first, ties by value. Nulls form their own bucket.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown columns or types without a category
    /// representation.
    #[allow(clippy::cast_precision_loss)]
    pub fn distinct(&self, col: &str) -> Result<Distinct> {
        self.stats_cache().memo(
            col,
            |e| e.distinct.clone(),
            |e, v| e.distinct = Some(v),
            || {
                let array = self.sample_column(col)?;
                let mut counts: std::collections::HashMap<CategoryValue, usize> =
                    std::collections::HashMap::new();
                for value in category_values(col, &array)? {
                    *counts.entry(value).or_default() += 1;
                }
                let total = array.len().max(1) as f64;
                let mut distinct: Vec<(CategoryValue, f64)> = counts
                    .into_iter()
                    .map(|(v, c)| (v, c as f64 / total))
                    .collect();
                distinct.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                Ok(Arc::new(distinct))
            },
        )
    }

    /// Distinct raw values of `col` in the repr sample, most frequent first.
    ///
    /// # Errors
    ///
    /// As [`FileDataset::distinct`].
    pub fn distinct_values(&self, col: &str) -> Result<Vec<CategoryValue>> {
        Ok(self.distinct(col)?.iter().map(|(v, _)| v.clone()).collect())
    }

    /// Mean, median, min or max of `col` in the repr sample.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotNumeric`] for non-numeric columns.
    pub fn sample_stat(&self, col: &str, stat: SampleStat) -> Result<f64> {
        self.stats_cache().memo(
            col,
            |e| e.sample.get(&stat).copied(),
            |e, v| {
                e.sample.insert(stat, v);
            },
            || {
                let sorted = self.sorted_sample(col)?;
                Ok(match stat {
                    SampleStat::Mean => numeric::mean(&sorted),
                    SampleStat::Median => numeric::median(&sorted),
                    SampleStat::Min => sorted.first().copied().unwrap_or(f64::NAN),
                    SampleStat::Max => sorted.last().copied().unwrap_or(f64::NAN),
                })
            },
        )
    }

    /// Lower outlier-resistant bound of `col`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotNumeric`] for non-numeric columns.
    pub fn outlier_rst_min(&self, col: &str) -> Result<f64> {
        let tail = self.options().outlier_tail_proportion.value(col);
        self.stats_cache().memo(
            col,
            |e| e.outlier_rst_min,
            |e, v| e.outlier_rst_min = Some(v),
            || Ok(numeric::outlier_rst_min(&self.sorted_sample(col)?, tail)),
        )
    }

    /// Upper outlier-resistant bound of `col`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotNumeric`] for non-numeric columns.
    pub fn outlier_rst_max(&self, col: &str) -> Result<f64> {
        let tail = self.options().outlier_tail_proportion.value(col);
        self.stats_cache().memo(
            col,
            |e| e.outlier_rst_max,
            |e, v| e.outlier_rst_max = Some(v),
            || Ok(numeric::outlier_rst_max(&self.sorted_sample(col)?, tail)),
        )
    }

    /// Outlier-resistant statistic of `col`.
    ///
    /// `Min` and `Max` are the outlier-resistant bounds themselves. `Mean`
    /// and `Median` are taken over sample values within the bounds of the
    /// excluded `tails`, bounds included. With no value in range the lower
    /// bound is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotNumeric`] for non-numeric columns.
    pub fn outlier_rst_stat(&self, col: &str, stat: SampleStat, tails: Tail) -> Result<f64> {
        match stat {
            SampleStat::Min => return self.outlier_rst_min(col),
            SampleStat::Max => return self.outlier_rst_max(col),
            SampleStat::Mean | SampleStat::Median => {}
        }
        self.stats_cache().memo(
            col,
            |e| e.outlier_rst.get(&(stat, tails)).copied(),
            |e, v| {
                e.outlier_rst.insert((stat, tails), v);
            },
            || {
                let sorted = self.sorted_sample(col)?;
                let lower = self.outlier_rst_min(col)?;
                let upper = self.outlier_rst_max(col)?;
                let in_range: Vec<f64> = sorted
                    .into_iter()
                    .filter(|v| !tails.excludes_lower() || *v >= lower)
                    .filter(|v| !tails.excludes_upper() || *v <= upper)
                    .collect();
                if in_range.is_empty() {
                    warn!(column = col, ?stat, ?tails, "no sample value within outlier bounds");
                    return Ok(lower);
                }
                Ok(match stat {
                    SampleStat::Median => numeric::median(&in_range),
                    _ => numeric::mean(&in_range),
                })
            },
        )
    }

    /// Summary of `col`; `None` when `skip_if_insuff_non_null` holds and
    /// the column is too sparse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ColumnNotFound`] for unknown columns.
    pub fn profile(&self, col: &str, skip_if_insuff_non_null: bool) -> Result<Option<ColumnProfile>> {
        let data_type = self.column_type(col)?;
        let non_null_proportion = self.non_null_proportion(col)?;
        if skip_if_insuff_non_null && !self.suff_non_null(col)? {
            return Ok(None);
        }
        let distinct = if is_possible_cat_type(&data_type) {
            Some(self.distinct(col)?.as_ref().clone())
        } else {
            None
        };
        let numeric = is_numeric_type(&data_type) && non_null_proportion > 0.0;
        let range = |a: Result<f64>, b: Result<f64>| -> Result<Option<(f64, f64)>> {
            Ok(Some((a?, b?)))
        };
        Ok(Some(ColumnProfile {
            data_type: data_type.to_string(),
            non_null_proportion,
            distinct,
            sample_range: if numeric {
                range(
                    self.sample_stat(col, SampleStat::Min),
                    self.sample_stat(col, SampleStat::Max),
                )?
            } else {
                None
            },
            outlier_rst_range: if numeric {
                range(self.outlier_rst_min(col), self.outlier_rst_max(col))?
            } else {
                None
            },
            sample_mean: numeric
                .then(|| self.sample_stat(col, SampleStat::Mean))
                .transpose()?,
            outlier_rst_mean: numeric
                .then(|| self.outlier_rst_stat(col, SampleStat::Mean, Tail::Both))
                .transpose()?,
            outlier_rst_median: numeric
                .then(|| self.outlier_rst_stat(col, SampleStat::Median, Tail::Both))
                .transpose()?,
        }))
    }

    /// Bool, string and numeric columns other than index and time-aux
    /// columns.
    pub fn possible_feature_content_cols(&self) -> Vec<String> {
        let excluded = self.non_content_cols();
        self.schema()
            .fields()
            .iter()
            .filter(|f| !excluded.contains(f.name()) && is_possible_feature_type(f.data_type()))
            .map(|f| f.name().clone())
            .collect()
    }

    /// Feature content columns that may be categorical: bool, string,
    /// integer.
    pub fn possible_cat_cols(&self) -> Vec<String> {
        self.typed_content_cols(is_possible_cat_type)
    }

    /// Feature content columns that are numeric.
    pub fn possible_num_cols(&self) -> Vec<String> {
        self.typed_content_cols(is_numeric_type)
    }

    /// Time-aux columns present in the output schema, except `__tOrd__`.
    pub fn possible_feature_t_aux_cols(&self) -> Vec<String> {
        timeaux::possible_feature_t_aux_cols()
            .into_iter()
            .filter(|c| self.schema().column_with_name(c).is_some())
            .collect()
    }

    fn typed_content_cols(&self, keep: fn(&DataType) -> bool) -> Vec<String> {
        self.possible_feature_content_cols()
            .into_iter()
            .filter(|c| {
                self.schema()
                    .field_with_name(c)
                    .map(|f| keep(f.data_type()))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn non_content_cols(&self) -> Vec<String> {
        let mut cols = self.index_cols();
        cols.extend(timeaux::t_aux_cols());
        cols
    }

    pub(crate) fn column_type(&self, col: &str) -> Result<DataType> {
        self.schema()
            .field_with_name(col)
            .map(|f| f.data_type().clone())
            .map_err(|_| Error::column_not_found(col))
    }

    fn check_column(&self, col: &str) -> Result<()> {
        self.column_type(col).map(|_| ())
    }

    /// `col` of the repr sample.
    pub(crate) fn sample_column(&self, col: &str) -> Result<ArrayRef> {
        self.check_column(col)?;
        self.repr_sample()?
            .column_by_name(col)
            .cloned()
            .ok_or_else(|| Error::column_not_found(col))
    }

    /// Finite sample values of `col`, ascending.
    pub(crate) fn sorted_sample(&self, col: &str) -> Result<Vec<f64>> {
        let array = self.sample_column(col)?;
        Ok(numeric::sorted(&finite_values(col, &array)?))
    }
}
