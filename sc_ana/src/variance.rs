//! Per-feature mean-variance modelling for feature selection.

use anyhow::Result;
use sc_types::block::block_groups;
use sc_types::error::check_length;
use sc_types::{BlockFactor, CountMatrix};

/// Per-feature statistics, averaged across blocks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VarianceResults {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

fn mean_and_variance(row: &[f64], cells: &[usize]) -> (f64, f64) {
    let n = cells.len() as f64;
    let mean = cells.iter().map(|&c| row[c]).sum::<f64>() / n;
    let variance = if cells.len() > 1 {
        cells.iter().map(|&c| (row[c] - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    (mean, variance)
}

/// Fit a trend of variance against mean over the log-normalized matrix;
/// residuals above the trend mark highly variable features.
pub(crate) fn model_variances(
    matrix: &CountMatrix,
    block: Option<&BlockFactor>,
    span: f64,
) -> Result<VarianceResults> {
    if let Some(b) = block {
        check_length("block factor", b.len(), matrix.num_columns())?;
    }
    let groups: Vec<Vec<usize>> = block_groups(block, matrix.num_columns())
        .into_iter()
        .filter(|g| !g.is_empty())
        .collect();
    let mut means = Vec::with_capacity(matrix.num_rows());
    let mut variances = Vec::with_capacity(matrix.num_rows());
    for r in 0..matrix.num_rows() {
        let row = matrix.row_dense(r);
        let (m, v) = groups
            .iter()
            .map(|g| mean_and_variance(&row, g))
            .fold((0.0, 0.0), |(sm, sv), (m, v)| (sm + m, sv + v));
        let k = groups.len().max(1) as f64;
        means.push(m / k);
        variances.push(v / k);
    }
    let fitted = stats::lowess(&means, &variances, span);
    let residuals = variances.iter().zip(&fitted).map(|(v, f)| v - f).collect();
    Ok(VarianceResults {
        means,
        variances,
        fitted,
        residuals,
    })
}

/// Indices of the `n` features with the largest residuals, in index order.
pub(crate) fn top_features(residuals: &[f64], n: usize) -> Vec<usize> {
    let ranks = stats::descending_ranks(residuals);
    (0..residuals.len()).filter(|&i| ranks[i] <= n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_variable_feature_has_largest_residual() -> Result<()> {
        let mut rows: Vec<Vec<f64>> = (0..8)
            .map(|r| (0..10).map(|c| 1.0 + r as f64 * 0.2 + (c % 2) as f64 * 0.05).collect())
            .collect();
        rows.push((0..10).map(|c| if c % 2 == 0 { 0.5 } else { 3.5 }).collect());
        let m = CountMatrix::from_dense(10, &rows)?;
        let out = model_variances(&m, None, 0.5)?;
        assert_eq!(out.means.len(), 9);
        assert_eq!(top_features(&out.residuals, 1), vec![8]);
        Ok(())
    }

    #[test]
    fn test_top_features_keeps_index_order() {
        assert_eq!(top_features(&[0.1, 5.0, -1.0, 3.0], 2), vec![1, 3]);
        assert_eq!(top_features(&[0.1, f64::NAN], 5), vec![0, 1]);
    }
}
