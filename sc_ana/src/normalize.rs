//! Size factors and log-normalization.

use anyhow::Result;
use log::{info, warn};
use sc_types::error::check_length;
use sc_types::CountMatrix;
use stats::median;

use crate::kmeans::kmeans;
use crate::pca::{run_pca, BlockMethod};

/// Scale size factors to a mean of one over cells with positive factors.
/// Zero factors become one: such cells have no counts to scale.
pub(crate) fn center_size_factors(factors: &[f64]) -> Vec<f64> {
    let positive: Vec<f64> = factors.iter().copied().filter(|&f| f > 0.0).collect();
    if positive.is_empty() {
        return vec![1.0; factors.len()];
    }
    let mean = positive.iter().sum::<f64>() / positive.len() as f64;
    factors
        .iter()
        .map(|&f| if f > 0.0 { f / mean } else { 1.0 })
        .collect()
}

/// `log2(count / size_factor + 1)` for every stored entry.
pub(crate) fn log_normalize(matrix: &CountMatrix, size_factors: &[f64]) -> Result<CountMatrix> {
    check_length("size factors", size_factors.len(), matrix.num_columns())?;
    Ok(matrix.map_entries(|_, c, v| (v / size_factors[c] + 1.0).log2()))
}

/// Size factors for composition-biased counts such as antibody tags.
///
/// Cells are clustered on a first-pass log-normalized PCA; each cluster gets
/// the median ratio of its average profile to that of the largest cluster,
/// and cells within a cluster are scaled by their library size.
pub(crate) fn grouped_size_factors(
    matrix: &CountMatrix,
    num_pcs: usize,
    num_clusters: usize,
) -> Result<Vec<f64>> {
    let sums = matrix.column_sums();
    let library = center_size_factors(&sums);
    let n = matrix.num_columns();
    if n < 3 || matrix.num_rows() == 0 {
        return Ok(library);
    }

    let first_pass = log_normalize(matrix, &library)?;
    let rows: Vec<usize> = (0..matrix.num_rows()).collect();
    let pca = run_pca(&first_pass, &rows, num_pcs, None, BlockMethod::None)?;
    if pca.pcs.nrows() == 0 {
        return Ok(library);
    }
    let clusters = kmeans(&pca.pcs, num_clusters.min(n));
    let num_groups = clusters.iter().max().map_or(0, |&m| m + 1);

    // average library-normalized profile per cluster
    let mut profiles = vec![vec![0.0; matrix.num_rows()]; num_groups];
    let mut sizes = vec![0usize; num_groups];
    for &g in &clusters {
        sizes[g] += 1;
    }
    for (r, (indices, values)) in matrix.rows().enumerate() {
        for (&c, &v) in indices.iter().zip(values) {
            profiles[clusters[c]][r] += v / library[c] / sizes[clusters[c]] as f64;
        }
    }

    // cluster 0 is the largest
    let factors: Vec<f64> = profiles
        .iter()
        .map(|profile| {
            let ratios: Vec<f64> = profile
                .iter()
                .zip(&profiles[0])
                .filter(|(_, &base)| base > 0.0)
                .map(|(&p, &base)| p / base)
                .filter(|&r| r > 0.0)
                .collect();
            let m = median(&ratios);
            if m.is_finite() && m > 0.0 {
                m
            } else {
                warn!("cluster profile shares no features with the reference cluster");
                1.0
            }
        })
        .collect();
    info!("computed grouped size factors over {num_groups} clusters");
    let per_cell: Vec<f64> = (0..n)
        .map(|c| {
            if sums[c] > 0.0 {
                library[c] * factors[clusters[c]]
            } else {
                0.0
            }
        })
        .collect();
    Ok(center_size_factors(&per_cell))
}
