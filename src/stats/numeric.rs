//! Sample statistics over finite `f64` values.
//!
//! Every function here expects NaN-free input; callers filter nulls first
//! (see [`super::values::finite_values`]).

/// Arithmetic mean, or NaN for an empty slice.
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation with one delta degree of freedom.
///
/// NaN when fewer than two values are given.
#[allow(clippy::cast_precision_loss)]
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Sorts a copy of `values` ascending.
pub fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

/// Quantile with linear interpolation between closest ranks.
///
/// `sorted` must be ascending. NaN for an empty slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Median of an ascending slice.
pub fn median(sorted: &[f64]) -> f64 {
    quantile(sorted, 0.5)
}

/// Lower outlier-resistant bound: the `tail` quantile.
///
/// When that quantile equals the sample minimum while lying strictly below
/// the median, a single extreme value dominates the tail; the bound becomes
/// the smallest value strictly greater than the minimum, never above the
/// median.
pub fn outlier_rst_min(sorted: &[f64], tail: f64) -> f64 {
    let Some(&sample_min) = sorted.first() else {
        return f64::NAN;
    };
    let q = quantile(sorted, tail);
    let med = median(sorted);
    if q == sample_min && q < med {
        sorted
            .iter()
            .copied()
            .find(|v| *v > sample_min)
            .map_or(q, |v| v.min(med))
    } else {
        q
    }
}

/// Upper outlier-resistant bound: the `1 - tail` quantile, with the mirror
/// image of the correction in [`outlier_rst_min`].
pub fn outlier_rst_max(sorted: &[f64], tail: f64) -> f64 {
    let Some(&sample_max) = sorted.last() else {
        return f64::NAN;
    };
    let q = quantile(sorted, 1.0 - tail);
    let med = median(sorted);
    if q == sample_max && q > med {
        sorted
            .iter()
            .rev()
            .copied()
            .find(|v| *v < sample_max)
            .map_or(q, |v| v.max(med))
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_quantile_linear_interpolation() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&v, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&v, 0.0) - 1.0).abs() < 1e-12);
        assert!((quantile(&v, 1.0) - 4.0).abs() < 1e-12);
        assert!((quantile(&v, 1.0 / 3.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(mean(&[]).is_nan());
        assert!(quantile(&[], 0.5).is_nan());
        assert!(std_dev(&[1.0]).is_nan());
        assert!(outlier_rst_min(&[], 0.01).is_nan());
    }

    #[test]
    fn test_std_dev_ddof_one() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&v) - 2.138_089_935_299_395).abs() < 1e-9);
    }

    #[test]
    fn test_single_extreme_duplicate_is_skipped() {
        let mut v: Vec<f64> = (1..=10).map(f64::from).collect();
        v.insert(0, -1000.0);
        assert_eq!(outlier_rst_min(&v, 0.0), 1.0);
        assert_eq!(outlier_rst_min(&v, 0.1), 1.0);

        // Next value above the minimum lies past the median.
        assert_eq!(outlier_rst_min(&[0.0, 0.0, 10.0, 10.0], 0.0), 5.0);

        let mut w: Vec<f64> = (1..=10).map(f64::from).collect();
        w.push(1000.0);
        assert_eq!(outlier_rst_max(&w, 0.0), 10.0);
    }

    #[test]
    fn test_interpolated_bound_kept() {
        let v: Vec<f64> = (0..=100).map(f64::from).collect();
        assert!((outlier_rst_min(&v, 0.05) - 5.0).abs() < 1e-12);
        assert!((outlier_rst_max(&v, 0.05) - 95.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_column_bounds_equal() {
        let v = [3.0; 10];
        assert_eq!(outlier_rst_min(&v, 0.01), 3.0);
        assert_eq!(outlier_rst_max(&v, 0.01), 3.0);
    }

    proptest! {
        #[test]
        fn prop_outlier_bounds_bracket_median(
            values in prop::collection::vec(-1.0e6f64..1.0e6, 2..200),
            tail in 0.0f64..0.49,
        ) {
            let s = sorted(&values);
            prop_assume!(s[0] < s[s.len() - 1]);
            let lo = outlier_rst_min(&s, tail);
            let hi = outlier_rst_max(&s, tail);
            let med = median(&s);
            prop_assert!(lo <= med, "min {} > median {}", lo, med);
            prop_assert!(med <= hi, "median {} > max {}", med, hi);
        }
    }
}
