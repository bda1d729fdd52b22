//! Persisted prep maps: original column to (prep column, details).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{stats::values::CategoryValue, transform::ScalerParams};

/// Numeric scaler of a prep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scaler {
    /// Standardize with the fill value as mean and the in-range sample
    /// standard deviation.
    #[default]
    Standard,
    /// Divide by the largest absolute outlier-resistant bound.
    MaxAbs,
    /// Map the outlier-resistant range onto `[-1, 1]`.
    MinMax,
}

/// Fitted categories of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatDetails {
    /// Categories in index order.
    pub cats: Vec<CategoryValue>,
    /// Number of categories; also the index of everything else.
    pub n_cats: usize,
}

/// Categorical part of a prep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatPrepMap {
    /// One-hot encoding; always false.
    #[serde(rename = "__OHE__", default)]
    pub ohe: bool,
    /// Rescale indices into `[-1, 1]`.
    #[serde(rename = "__SCALE__", default)]
    pub scale: bool,
    /// Original column to (prep column, details).
    #[serde(flatten)]
    pub columns: BTreeMap<String, (String, CatDetails)>,
}

/// Fitted fill and scale parameters of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NumDetails {
    /// Sentinel bounds: values `<= lower` or `>= upper` are null.
    pub nulls: (Option<f64>, Option<f64>),
    /// Replacement for nulls.
    pub null_fill_value: f64,
    /// Standard scaler center.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    /// Standard scaler spread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    /// Max-abs scaler divisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_abs: Option<f64>,
    /// Min-max scaler source lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_min: Option<f64>,
    /// Min-max scaler source upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_max: Option<f64>,
    /// Min-max scaler target lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_min: Option<f64>,
    /// Min-max scaler target upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_max: Option<f64>,
}

impl NumDetails {
    /// Details with fill parameters only.
    pub fn fill_only(nulls: (Option<f64>, Option<f64>), null_fill_value: f64) -> Self {
        Self {
            nulls,
            null_fill_value,
            mean: None,
            std_dev: None,
            max_abs: None,
            orig_min: None,
            orig_max: None,
            target_min: None,
            target_max: None,
        }
    }

    /// Attaches fitted scaler parameters.
    #[must_use]
    pub fn with_params(mut self, params: ScalerParams) -> Self {
        match params {
            ScalerParams::Standard { mean, std_dev } => {
                self.mean = Some(mean);
                self.std_dev = Some(std_dev);
            }
            ScalerParams::MaxAbs { max_abs } => self.max_abs = Some(max_abs),
            ScalerParams::MinMax {
                orig_min,
                orig_max,
                target_min,
                target_max,
            } => {
                self.orig_min = Some(orig_min);
                self.orig_max = Some(orig_max);
                self.target_min = Some(target_min);
                self.target_max = Some(target_max);
            }
        }
        self
    }

    /// Scaler parameters for `scaler`, if all of them are present.
    pub fn params(&self, scaler: Scaler) -> Option<ScalerParams> {
        match scaler {
            Scaler::Standard => Some(ScalerParams::Standard {
                mean: self.mean?,
                std_dev: self.std_dev?,
            }),
            Scaler::MaxAbs => Some(ScalerParams::MaxAbs {
                max_abs: self.max_abs?,
            }),
            Scaler::MinMax => Some(ScalerParams::MinMax {
                orig_min: self.orig_min?,
                orig_max: self.orig_max?,
                target_min: self.target_min?,
                target_max: self.target_max?,
            }),
        }
    }

    /// Returns true if `v` is null under the sentinel bounds.
    pub fn is_null(&self, v: f64) -> bool {
        v.is_nan() || self.nulls.0.is_some_and(|l| v <= l) || self.nulls.1.is_some_and(|u| v >= u)
    }
}

/// Numeric part of a prep.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NumPrepMap {
    /// Scaler shared by all columns; `None` keeps the filled values.
    #[serde(rename = "__SCALER__", default)]
    pub scaler: Option<Scaler>,
    /// Original column to (prep column, details).
    #[serde(flatten)]
    pub columns: BTreeMap<String, (String, NumDetails)>,
}
