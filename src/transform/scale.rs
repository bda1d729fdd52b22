//! Numeric scaling with fitted parameters.

use std::sync::Arc;

use arrow::array::{Float64Array, RecordBatch};
use serde::{Deserialize, Serialize};

use super::{column, set_column, Transform};
use crate::{error::Result, prep::sql::float_literal, stats::values::numeric_values};

/// Prefix of standardized columns.
pub const STD_SCL_PREFIX: &str = "__StdScl__";
/// Prefix of max-abs scaled columns.
pub const MAX_ABS_SCL_PREFIX: &str = "__MaxAbsScl__";
/// Prefix of min-max scaled columns.
pub const MIN_MAX_SCL_PREFIX: &str = "__MinMaxScl__";

/// Fitted parameters of one scaler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scaler", rename_all = "snake_case")]
pub enum ScalerParams {
    /// `(x - mean) / std_dev`.
    Standard {
        /// Center.
        mean: f64,
        /// Spread.
        std_dev: f64,
    },
    /// `x / max_abs`.
    MaxAbs {
        /// Largest absolute bound.
        max_abs: f64,
    },
    /// Affine map of `[orig_min, orig_max]` onto `[target_min, target_max]`.
    MinMax {
        /// Source lower bound.
        orig_min: f64,
        /// Source upper bound.
        orig_max: f64,
        /// Target lower bound.
        target_min: f64,
        /// Target upper bound.
        target_max: f64,
    },
}

impl ScalerParams {
    /// Scales one value. NaN stays NaN.
    pub fn scale(&self, x: f64) -> f64 {
        match *self {
            Self::Standard { mean, std_dev } => (x - mean) / std_dev,
            Self::MaxAbs { max_abs } => x / max_abs,
            Self::MinMax {
                orig_min,
                orig_max,
                target_min,
                target_max,
            } => (target_max - target_min) * (x - orig_min) / (orig_max - orig_min) + target_min,
        }
    }

    /// SQL expression scaling `item`.
    pub fn sql(&self, item: &str) -> String {
        match *self {
            Self::Standard { mean, std_dev } => {
                format!("(({item}) - {}) / {}", float_literal(mean), float_literal(std_dev))
            }
            Self::MaxAbs { max_abs } => format!("({item}) / {}", float_literal(max_abs)),
            Self::MinMax {
                orig_min,
                orig_max,
                target_min,
                target_max,
            } => format!(
                "({} * (({item}) - ({})) / {}) + ({})",
                float_literal(target_max - target_min),
                float_literal(orig_min),
                float_literal(orig_max - orig_min),
                float_literal(target_min)
            ),
        }
    }
}

/// Scales one numeric column into `output` (or in place).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    /// Source column.
    pub column: String,
    /// Output column; the source is replaced when absent.
    #[serde(default)]
    pub output: Option<String>,
    /// Fitted parameters.
    pub params: ScalerParams,
}

impl Scale {
    /// Scales `column` in place.
    pub fn new(column: impl Into<String>, params: ScalerParams) -> Self {
        Self {
            column: column.into(),
            output: None,
            params,
        }
    }

    /// Writes to `output` instead of replacing the source.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

impl Transform for Scale {
    fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let values = numeric_values(&self.column, column(&batch, &self.column)?)?;
        let scaled: Float64Array = values.iter().map(|x| Some(self.params.scale(*x))).collect();
        let out = self.output.as_deref().unwrap_or(&self.column);
        set_column(&batch, out, Arc::new(scaled))
    }
}
