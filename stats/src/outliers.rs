//! Median absolute deviation outlier thresholds.

use crate::median;

/// Consistency constant that makes the MAD estimate the standard deviation of
/// normally distributed data.
pub const MAD_SCALE: f64 = 1.4826;

/// Scaled median absolute deviation of the finite values around `center`.
pub fn mad(values: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|x| (x - center).abs()).collect();
    MAD_SCALE * median(&deviations)
}

fn center_and_spread(values: &[f64], log: bool) -> Option<(f64, f64)> {
    let transformed: Vec<f64> = if log {
        values.iter().filter(|&&x| x > 0.0).map(|x| x.ln()).collect()
    } else {
        values.iter().copied().filter(|x| x.is_finite()).collect()
    };
    if transformed.is_empty() {
        return None;
    }
    let center = median(&transformed);
    Some((center, mad(&transformed, center)))
}

/// Median of the positive values on the original scale. `exp(ln(m))` may land
/// on either side of `m`, so log-scale thresholds are clamped to it.
fn positive_median(values: &[f64]) -> f64 {
    let positive: Vec<f64> = values.iter().copied().filter(|&x| x > 0.0).collect();
    median(&positive)
}

/// Values below the returned threshold are low outliers.
///
/// With `log`, the statistics are computed on the log of the positive values
/// and the threshold is returned on the original scale. It never exceeds the
/// median, so cells sitting at the median are kept when the spread is zero.
pub fn lower_threshold(values: &[f64], nmads: f64, log: bool) -> f64 {
    match center_and_spread(values, log) {
        None if log => 0.0,
        None => f64::NEG_INFINITY,
        Some((center, spread)) => {
            let t = center - nmads * spread;
            if log {
                t.exp().min(positive_median(values))
            } else {
                t
            }
        }
    }
}

/// Values above the returned threshold are high outliers.
pub fn upper_threshold(values: &[f64], nmads: f64, log: bool) -> f64 {
    match center_and_spread(values, log) {
        None => f64::INFINITY,
        Some((center, spread)) => {
            let t = center + nmads * spread;
            if log {
                t.exp().max(positive_median(values))
            } else {
                t
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::{prop_assert, proptest};

    #[test]
    fn test_mad() {
        // |x - 3| = 2 1 0 1 2 -> median 1
        assert!((mad(&[1.0, 2.0, 3.0, 4.0, 5.0], 3.0) - MAD_SCALE).abs() < 1e-12);
    }

    #[test]
    fn test_thresholds() {
        let values = [10.0, 11.0, 9.0, 10.0, 100.0];
        let hi = upper_threshold(&values, 3.0, false);
        assert!(hi > 11.0 && hi < 100.0);
        let lo = lower_threshold(&values, 3.0, false);
        assert!(lo < 9.0);
    }

    #[test]
    fn test_log_thresholds_ignore_zeros() {
        let values = [0.0, 100.0, 100.0, 100.0];
        assert_eq!(lower_threshold(&values, 3.0, true), 100.0);
        assert_eq!(lower_threshold(&[0.0, 0.0], 3.0, true), 0.0);
        assert_eq!(upper_threshold(&[], 3.0, true), f64::INFINITY);
    }

    #[test]
    fn test_log_thresholds_without_spread() {
        for x in [10.0, 30.0, 7.0, 1e-3] {
            let values = [x; 5];
            let lo = lower_threshold(&values, 3.0, true);
            let hi = upper_threshold(&values, 3.0, true);
            assert!(!values.iter().any(|&v| v < lo), "{x} fell below {lo}");
            assert!(!values.iter().any(|&v| v > hi), "{x} rose above {hi}");
        }
    }

    proptest! {
        #[test]
        fn prop_thresholds_bracket_median(values in vec(0.1f64..1e4, 1..200), nmads in 0.0f64..5.0) {
            let m = crate::median(&values);
            prop_assert!(lower_threshold(&values, nmads, false) <= m + 1e-9);
            prop_assert!(upper_threshold(&values, nmads, false) >= m - 1e-9);
            prop_assert!(lower_threshold(&values, nmads, true) <= m);
            prop_assert!(upper_threshold(&values, nmads, true) >= m);
        }
    }
}
