//! Dataset load options.
//!
//! Options are plain serde values so they can be read from a JSON file and
//! shipped to generator workers unchanged. Statistical thresholds are
//! [`PerColumn`] values: one default plus optional per-column overrides.

use std::{collections::HashMap, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
};

/// Default entity (index) column name.
pub const DEFAULT_INDEX_COL: &str = "id";
/// Default minimum number of pieces in a representative sample.
pub const DEFAULT_REPR_SAMPLE_MIN_PIECES: usize = 100;
/// Default representative sample size, in rows.
pub const DEFAULT_REPR_SAMPLE_SIZE: usize = 1_000_000;
/// Default minimum non-null proportion for a column to be usable.
pub const DEFAULT_MIN_NON_NULL_PROPORTION: f64 = 0.32;
/// Default proportion excluded per tail by outlier-resistant statistics.
pub const DEFAULT_OUTLIER_TAIL_PROPORTION: f64 = 1e-3;
/// Default maximum number of categories for a categorical column.
pub const DEFAULT_MAX_N_CATS: usize = 12;
/// Default minimum coverage of the top categories.
pub const DEFAULT_MIN_PROPORTION_BY_MAX_N_CATS: f64 = 0.9;

/// A value with a default and optional per-column overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerColumn<T> {
    default: T,
    #[serde(default)]
    overrides: HashMap<String, T>,
}

impl<T> PerColumn<T> {
    /// Creates a value with no overrides.
    pub fn new(default: T) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Returns the value for `column`.
    pub fn get(&self, column: &str) -> &T {
        self.overrides.get(column).unwrap_or(&self.default)
    }

    /// Returns the default value.
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Adds an override for `column`.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: T) -> Self {
        self.overrides.insert(column.into(), value);
        self
    }

    /// Sets an override for `column` in place.
    pub fn set(&mut self, column: impl Into<String>, value: T) {
        self.overrides.insert(column.into(), value);
    }
}

impl<T: Copy> PerColumn<T> {
    /// Returns the value for `column` by copy.
    pub fn value(&self, column: &str) -> T {
        *self.get(column)
    }
}

/// Options governing how a dataset is loaded and profiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Entity identifier column.
    pub index_col: Option<String>,
    /// Timestamp or date column ordering rows within an entity.
    pub time_col: Option<String>,
    /// Minimum number of pieces in a representative sample.
    pub repr_sample_min_pieces: usize,
    /// Target representative sample size in rows.
    pub repr_sample_size: usize,
    /// Minimum non-null proportion for a column to count as sufficiently non-null.
    pub min_non_null_proportion: PerColumn<f64>,
    /// Proportion of values excluded from each tail.
    pub outlier_tail_proportion: PerColumn<f64>,
    /// Maximum categories kept for a categorical column.
    pub max_n_cats: PerColumn<usize>,
    /// Minimum proportion the top `max_n_cats` categories must cover.
    pub min_proportion_by_max_n_cats: PerColumn<f64>,
    /// Local directory receiving downloaded object-store pieces.
    pub cache_dir: PathBuf,
    /// Retry policy for piece download and decode.
    pub retry: RetryPolicy,
    /// Seed for piece and row sampling; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            index_col: Some(DEFAULT_INDEX_COL.to_string()),
            time_col: None,
            repr_sample_min_pieces: DEFAULT_REPR_SAMPLE_MIN_PIECES,
            repr_sample_size: DEFAULT_REPR_SAMPLE_SIZE,
            min_non_null_proportion: PerColumn::new(DEFAULT_MIN_NON_NULL_PROPORTION),
            outlier_tail_proportion: PerColumn::new(DEFAULT_OUTLIER_TAIL_PROPORTION),
            max_n_cats: PerColumn::new(DEFAULT_MAX_N_CATS),
            min_proportion_by_max_n_cats: PerColumn::new(DEFAULT_MIN_PROPORTION_BY_MAX_N_CATS),
            cache_dir: std::env::temp_dir().join("parcela"),
            retry: RetryPolicy::default(),
            seed: None,
        }
    }
}

impl LoadOptions {
    /// Reads options from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.repr_sample_min_pieces == 0 {
            return Err(Error::invalid_config("repr_sample_min_pieces must be positive"));
        }
        if self.repr_sample_size == 0 {
            return Err(Error::invalid_config("repr_sample_size must be positive"));
        }
        let tail = *self.outlier_tail_proportion.default_value();
        if !(0.0..0.5).contains(&tail) {
            return Err(Error::invalid_config(format!(
                "outlier_tail_proportion must be in [0, 0.5), got {tail}"
            )));
        }
        Ok(())
    }

    /// Sets the index column.
    #[must_use]
    pub fn with_index_col(mut self, col: Option<&str>) -> Self {
        self.index_col = col.map(str::to_string);
        self
    }

    /// Sets the time column.
    #[must_use]
    pub fn with_time_col(mut self, col: Option<&str>) -> Self {
        self.time_col = col.map(str::to_string);
        self
    }

    /// Sets the minimum number of sampled pieces.
    #[must_use]
    pub fn with_repr_sample_min_pieces(mut self, n: usize) -> Self {
        self.repr_sample_min_pieces = n.max(1);
        self
    }

    /// Sets the representative sample size.
    #[must_use]
    pub fn with_repr_sample_size(mut self, n: usize) -> Self {
        self.repr_sample_size = n.max(1);
        self
    }

    /// Sets the maximum category count (default for all columns).
    #[must_use]
    pub fn with_max_n_cats(mut self, n: usize) -> Self {
        self.max_n_cats = PerColumn::new(n);
        self
    }

    /// Sets the minimum coverage of the top categories (default for all columns).
    #[must_use]
    pub fn with_min_proportion_by_max_n_cats(mut self, p: f64) -> Self {
        self.min_proportion_by_max_n_cats = PerColumn::new(p);
        self
    }

    /// Sets the outlier tail proportion (default for all columns).
    #[must_use]
    pub fn with_outlier_tail_proportion(mut self, p: f64) -> Self {
        self.outlier_tail_proportion = PerColumn::new(p);
        self
    }

    /// Sets the minimum non-null proportion (default for all columns).
    #[must_use]
    pub fn with_min_non_null_proportion(mut self, p: f64) -> Self {
        self.min_non_null_proportion = PerColumn::new(p);
        self
    }

    /// Sets the download cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sampling seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
