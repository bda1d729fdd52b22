//! Per-handle memo of column statistics.

use std::{collections::HashMap, sync::Arc};

use arrow::array::RecordBatch;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use super::{values::CategoryValue, SampleStat, Tail};
use crate::error::Result;

/// Normalized value counts, most frequent first.
pub type Distinct = Arc<Vec<(CategoryValue, f64)>>;

/// Memoized statistics of one column.
#[derive(Debug, Clone, Default)]
pub struct ColumnStatsEntry {
    /// Exact non-null count over all pieces.
    pub count: Option<usize>,
    /// Non-null proportion in the repr sample.
    pub non_null_proportion: Option<f64>,
    /// Distinct value proportions in the repr sample.
    pub distinct: Option<Distinct>,
    /// Sample statistics by kind.
    pub sample: HashMap<SampleStat, f64>,
    /// Outlier-resistant lower bound.
    pub outlier_rst_min: Option<f64>,
    /// Outlier-resistant upper bound.
    pub outlier_rst_max: Option<f64>,
    /// Outlier-resistant mean/median by excluded tails.
    pub outlier_rst: HashMap<(SampleStat, Tail), f64>,
}

/// Statistics cache of one dataset handle.
///
/// Entries are computed lazily and never change once set. A derived handle
/// starts from [`StatsCache::inherit`], which copies only the columns the
/// deriving transform provably leaves unchanged.
#[derive(Debug, Default)]
pub struct StatsCache {
    entries: RwLock<HashMap<String, ColumnStatsEntry>>,
    n_rows: RwLock<Option<usize>>,
    approx_n_rows: RwLock<Option<usize>>,
    repr: OnceCell<Arc<RecordBatch>>,
}

impl StatsCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache for a derived handle.
    ///
    /// Entries of `same_cols` are copied as is, entries of the keys of
    /// `renamed` are copied under their new name, and row counts are
    /// carried over when `keep_n_rows` holds. The repr sample is never
    /// inherited here; see [`StatsCache::with_repr_sample`].
    pub fn inherit(
        &self,
        same_cols: &[String],
        renamed: &HashMap<String, String>,
        keep_n_rows: bool,
    ) -> Self {
        let entries = self.entries.read();
        let mut copied = HashMap::new();
        for col in same_cols {
            if let Some(entry) = entries.get(col) {
                copied.insert(col.clone(), entry.clone());
            }
        }
        for (old, new) in renamed {
            if let Some(entry) = entries.get(old) {
                copied.insert(new.clone(), entry.clone());
            }
        }
        drop(entries);

        let cache = Self {
            entries: RwLock::new(copied),
            ..Self::default()
        };
        if keep_n_rows {
            *cache.n_rows.write() = *self.n_rows.read();
            *cache.approx_n_rows.write() = *self.approx_n_rows.read();
        }
        cache
    }

    /// Seeds the repr sample of a fresh cache.
    #[must_use]
    pub fn with_repr_sample(self, sample: Arc<RecordBatch>) -> Self {
        let _ = self.repr.set(sample);
        self
    }

    /// Returns the repr sample if it has been materialized.
    pub fn repr_sample(&self) -> Option<Arc<RecordBatch>> {
        self.repr.get().cloned()
    }

    /// Returns the repr sample, materializing it with `build` on first use.
    ///
    /// # Errors
    ///
    /// Propagates the error from `build`; a failed build is not cached.
    pub fn repr_sample_or_build(
        &self,
        build: impl FnOnce() -> Result<RecordBatch>,
    ) -> Result<Arc<RecordBatch>> {
        self.repr.get_or_try_init(|| build().map(Arc::new)).cloned()
    }

    /// Returns the cached exact row count, computing it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the error from `compute`.
    pub fn n_rows_or(&self, compute: impl FnOnce() -> Result<usize>) -> Result<usize> {
        memo_scalar(&self.n_rows, compute)
    }

    /// Returns the cached approximate row count, computing it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the error from `compute`.
    pub fn approx_n_rows_or(&self, compute: impl FnOnce() -> Result<usize>) -> Result<usize> {
        memo_scalar(&self.approx_n_rows, compute)
    }

    /// Returns a clone of the entry for `col`, if any.
    pub fn entry(&self, col: &str) -> Option<ColumnStatsEntry> {
        self.entries.read().get(col).cloned()
    }

    /// Columns with at least one memoized statistic.
    pub fn cached_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.entries.read().keys().cloned().collect();
        cols.sort();
        cols
    }

    /// Reads one statistic of `col` with `read`, computing and storing it
    /// with `compute`/`write` on a miss. `compute` runs without the lock.
    ///
    /// # Errors
    ///
    /// Propagates the error from `compute`.
    pub fn memo<T: Clone>(
        &self,
        col: &str,
        read: impl Fn(&ColumnStatsEntry) -> Option<T>,
        write: impl FnOnce(&mut ColumnStatsEntry, T),
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        if let Some(value) = self.entries.read().get(col).and_then(&read) {
            return Ok(value);
        }
        let value = compute()?;
        let mut entries = self.entries.write();
        write(entries.entry(col.to_string()).or_default(), value.clone());
        Ok(value)
    }
}

fn memo_scalar(slot: &RwLock<Option<usize>>, compute: impl FnOnce() -> Result<usize>) -> Result<usize> {
    if let Some(n) = *slot.read() {
        return Ok(n);
    }
    let n = compute()?;
    *slot.write() = Some(n);
    Ok(n)
}
