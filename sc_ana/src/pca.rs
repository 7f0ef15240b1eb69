//! PCA on log-normalized expression

use anyhow::Result;
use log::info;
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sc_types::error::check_length;
use sc_types::{BlockFactor, CountMatrix};
use serde::{Deserialize, Serialize};

const SEED: u64 = 42;
const OVERSAMPLE: usize = 5;
const SUBSPACE_ITERATIONS: usize = 30;
const JACOBI_SWEEPS: usize = 100;
const JACOBI_TOLERANCE: f64 = 1e-12;

/// How a blocking factor is handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMethod {
    /// Ignore the block.
    #[default]
    None,
    /// Remove per-block means before the decomposition.
    Regress,
    /// Give each block equal weight when computing the rotation.
    Weight,
}

/// Principal components as components × cells, with the proportion of the
/// total variance each one explains.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PcaOutput {
    pub pcs: Array2<f64>,
    pub variance_explained: Vec<f64>,
}

fn dense_cells_by_features(matrix: &CountMatrix, rows: &[usize]) -> Array2<f64> {
    let mut x = Array2::zeros((matrix.num_columns(), rows.len()));
    for (j, &r) in rows.iter().enumerate() {
        let (indices, values) = matrix.row(r);
        for (&c, &v) in indices.iter().zip(values) {
            x[[c, j]] = v;
        }
    }
    x
}

/// Center the columns of `x`; returns per-cell weights for the rotation.
fn center(x: &mut Array2<f64>, block: Option<&BlockFactor>, method: BlockMethod) -> Vec<f64> {
    let n = x.nrows();
    let groups = match (block, method) {
        (Some(b), BlockMethod::Regress | BlockMethod::Weight) if b.num_levels() > 1 => b.groups(),
        _ => vec![(0..n).collect()],
    };
    let mut weights = vec![1.0; n];
    match method {
        BlockMethod::Regress => {
            for group in groups.iter().filter(|g| !g.is_empty()) {
                let means = mean_of_rows(x, group);
                for &c in group {
                    let mut row = x.row_mut(c);
                    row -= &means;
                }
            }
        }
        _ => {
            // weighted mean: each block contributes equally
            let active: Vec<&Vec<usize>> = groups.iter().filter(|g| !g.is_empty()).collect();
            let mut overall = Array1::zeros(x.ncols());
            for group in &active {
                overall += &mean_of_rows(x, group);
            }
            overall /= active.len().max(1) as f64;
            for mut row in x.rows_mut() {
                row -= &overall;
            }
            if method == BlockMethod::Weight {
                for group in &active {
                    let w = (n as f64 / (active.len() as f64 * group.len() as f64)).sqrt();
                    for &c in group.iter() {
                        weights[c] = w;
                    }
                }
            }
        }
    }
    weights
}

fn mean_of_rows(x: &Array2<f64>, rows: &[usize]) -> Array1<f64> {
    let mut sum = Array1::zeros(x.ncols());
    for &r in rows {
        sum += &x.row(r);
    }
    sum / rows.len().max(1) as f64
}

/// Modified Gram-Schmidt on the columns of `q`.
fn orthonormalize(q: &mut Array2<f64>) {
    for j in 0..q.ncols() {
        for i in 0..j {
            let proj = q.column(i).dot(&q.column(j));
            let prev = q.column(i).to_owned();
            let mut col = q.column_mut(j);
            col.scaled_add(-proj, &prev);
        }
        let norm = q.column(j).dot(&q.column(j)).sqrt();
        let mut col = q.column_mut(j);
        if norm > 0.0 {
            col /= norm;
        } else {
            col.fill(0.0);
        }
    }
}

/// Eigen-decomposition of a small symmetric matrix by cyclic Jacobi
/// rotations. Eigenvalues are returned in decreasing order with their
/// eigenvectors as columns.
pub(crate) fn symmetric_eigen(a: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::eye(n);
    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[[i, j]].powi(2))
            .sum();
        if off < JACOBI_TOLERANCE {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if a[[p, q]].abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));
    let values = order.iter().map(|&i| a[[i, i]]).collect();
    let mut vectors = Array2::zeros((n, n));
    for (new, &old) in order.iter().enumerate() {
        vectors.column_mut(new).assign(&v.column(old));
    }
    (values, vectors)
}

/// Top principal components of the selected `rows` of a log-normalized matrix.
pub(crate) fn run_pca(
    matrix: &CountMatrix,
    rows: &[usize],
    num_pcs: usize,
    block: Option<&BlockFactor>,
    method: BlockMethod,
) -> Result<PcaOutput> {
    //! Randomized subspace iteration followed by a Rayleigh-Ritz step.
    let n = matrix.num_columns();
    if let Some(b) = block {
        check_length("block factor", b.len(), n)?;
    }
    let mut x = dense_cells_by_features(matrix, rows);
    let weights = center(&mut x, block, method);
    let mut xw = x.clone();
    for (mut row, &w) in xw.rows_mut().into_iter().zip(&weights) {
        row *= w;
    }

    let k = num_pcs.min(rows.len()).min(n.saturating_sub(1));
    if k == 0 {
        return Ok(PcaOutput {
            pcs: Array2::zeros((0, n)),
            variance_explained: Vec::new(),
        });
    }
    let width = (k + OVERSAMPLE).min(rows.len());
    let mut rng = Pcg64::seed_from_u64(SEED);
    let mut q = Array2::from_shape_fn((rows.len(), width), |_| rng.gen_range(-1.0..1.0));
    orthonormalize(&mut q);
    for _ in 0..SUBSPACE_ITERATIONS {
        let y = xw.dot(&q);
        q = xw.t().dot(&y);
        orthonormalize(&mut q);
    }
    let y = xw.dot(&q);
    let small = y.t().dot(&y);
    let (values, vectors) = symmetric_eigen(&small);
    let mut rotation = q.dot(&vectors);
    rotation = rotation.slice_move(ndarray::s![.., ..k]);

    // sign convention: the largest loading of each component is positive
    for mut col in rotation.columns_mut() {
        let largest = col
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(0.0);
        if largest < 0.0 {
            col *= -1.0;
        }
    }

    let denom = (n as f64 - 1.0).max(1.0);
    let total: f64 = xw.iter().map(|v| v * v).sum::<f64>() / denom;
    let variance_explained = values[..k]
        .iter()
        .map(|&ev| if total > 0.0 { ev.max(0.0) / denom / total } else { 0.0 })
        .collect();
    let pcs = x.dot(&rotation).reversed_axes();
    info!(
        "computed {k} principal components from {} features and {n} cells",
        rows.len()
    );
    Ok(PcaOutput {
        pcs: pcs.as_standard_layout().into_owned(),
        variance_explained,
    })
}

/// Total variance per component axis, used to weigh embeddings.
pub(crate) fn total_variance(pcs: &Array2<f64>) -> f64 {
    let n = pcs.ncols();
    if n < 2 {
        return 0.0;
    }
    pcs.axis_iter(Axis(0))
        .map(|row| {
            let m = row.sum() / n as f64;
            row.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64
        })
        .sum()
}
