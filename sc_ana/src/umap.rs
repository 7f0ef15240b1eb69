//! UMAP embedding from a neighbor list

use log::info;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::BTreeMap;

use crate::nn::Neighbors;
use crate::tsne::ANIMATION_INTERVAL;

const SEED: u64 = 1_234_567;
const NEGATIVE_SAMPLES: usize = 5;
const INITIAL_ALPHA: f64 = 1.0;
const SPREAD: f64 = 1.0;
const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MAX_BINARY_STEPS: usize = 64;
const GRADIENT_CLIP: f64 = 4.0;
const CURVE_ROUNDS: usize = 40;
const CURVE_GRID: usize = 10;

/// Fit the `a`, `b` curve parameters of the low-dimensional similarity
/// `1 / (1 + a d^(2b))` to the offset exponential implied by `min_dist`.
pub(crate) fn fit_curve(min_dist: f64) -> (f64, f64) {
    let xs: Vec<f64> = (1..300).map(|i| i as f64 * SPREAD * 3.0 / 300.0).collect();
    let target: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / SPREAD).exp()
            }
        })
        .collect();
    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&target)
            .map(|(&x, &t)| (1.0 / (1.0 + a * x.powf(2.0 * b)) - t).powi(2))
            .sum()
    };
    let (mut best_a, mut best_b, mut best) = (1.0, 1.0, loss(1.0, 1.0));
    let (mut da, mut db) = (0.5, 0.2);
    for _ in 0..CURVE_ROUNDS {
        let (center_a, center_b) = (best_a, best_b);
        for i in 0..=CURVE_GRID {
            for j in 0..=CURVE_GRID {
                let a = center_a - da + 2.0 * da * i as f64 / CURVE_GRID as f64;
                let b = center_b - db + 2.0 * db * j as f64 / CURVE_GRID as f64;
                if a <= 0.0 || b <= 0.0 {
                    continue;
                }
                let l = loss(a, b);
                if l < best {
                    (best_a, best_b, best) = (a, b, l);
                }
            }
        }
        // shrink only once the optimum is inside the window
        let on_edge = (best_a - center_a).abs() >= da * 0.99 || (best_b - center_b).abs() >= db * 0.99;
        if !on_edge {
            da /= 2.0;
            db /= 2.0;
        }
    }
    (best_a, best_b)
}

/// Fuzzy membership strengths of each cell's neighbors.
fn smooth_memberships(distances: &[f64]) -> Vec<f64> {
    if distances.is_empty() {
        return Vec::new();
    }
    let rho = distances.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);
    let target = (distances.len() as f64).log2();
    let (mut lo, mut hi, mut sigma) = (0.0f64, f64::INFINITY, 1.0f64);
    for _ in 0..MAX_BINARY_STEPS {
        let total: f64 = distances
            .iter()
            .map(|&d| (-((d - rho).max(0.0)) / sigma).exp())
            .sum();
        if (total - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if total > target {
            hi = sigma;
            sigma = (lo + hi) / 2.0;
        } else {
            lo = sigma;
            sigma = if hi.is_finite() { (lo + hi) / 2.0 } else { sigma * 2.0 };
        }
    }
    distances
        .iter()
        .map(|&d| (-((d - rho).max(0.0)) / sigma).exp())
        .collect()
}

/// Optimize a two-dimensional embedding with `num_neighbors` per cell.
pub(crate) fn run_umap(
    neighbors: &Neighbors,
    num_neighbors: usize,
    num_epochs: usize,
    min_dist: f64,
    frame: Option<&(dyn Fn(usize, &[f64], &[f64]) + Sync)>,
) -> (Vec<f64>, Vec<f64>) {
    let n = neighbors.num_cells();
    if n < 2 {
        return (vec![0.0; n], vec![0.0; n]);
    }

    // fuzzy union of the directed neighbor graphs
    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for i in 0..n {
        let k = num_neighbors.min(neighbors.indices[i].len());
        let strengths = smooth_memberships(&neighbors.distances[i][..k]);
        for (&j, w) in neighbors.indices[i][..k].iter().zip(strengths) {
            directed.insert((i, j), w);
        }
    }
    let mut edges: Vec<(usize, usize, f64)> = Vec::new();
    for (&(i, j), &w) in &directed {
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        if i < j || back == 0.0 {
            edges.push((i, j, w + back - w * back));
        }
    }
    let max_weight = edges.iter().map(|e| e.2).fold(0.0, f64::max);

    let (a, b) = fit_curve(min_dist);
    let mut rng = Pcg64::seed_from_u64(SEED);
    let mut y: Vec<[f64; 2]> = (0..n)
        .map(|_| [rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)])
        .collect();

    for epoch in 0..num_epochs {
        let alpha = INITIAL_ALPHA * (1.0 - epoch as f64 / num_epochs as f64);
        for &(i, j, w) in &edges {
            if max_weight <= 0.0 || rng.gen::<f64>() > w / max_weight {
                continue;
            }
            let (dx, dy) = (y[i][0] - y[j][0], y[i][1] - y[j][1]);
            let d2 = dx * dx + dy * dy;
            if d2 > 0.0 {
                let coef = -2.0 * a * b * d2.powf(b - 1.0) / (1.0 + a * d2.powf(b));
                for (d, delta) in [(0, dx), (1, dy)] {
                    let g = (coef * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP) * alpha;
                    y[i][d] += g;
                    y[j][d] -= g;
                }
            }
            for _ in 0..NEGATIVE_SAMPLES {
                let k = rng.gen_range(0..n);
                if k == i {
                    continue;
                }
                let (dx, dy) = (y[i][0] - y[k][0], y[i][1] - y[k][1]);
                let d2 = dx * dx + dy * dy;
                let coef = if d2 > 0.0 {
                    2.0 * b / ((0.001 + d2) * (1.0 + a * d2.powf(b)))
                } else {
                    0.0
                };
                for (d, delta) in [(0, dx), (1, dy)] {
                    let g = if coef > 0.0 {
                        (coef * delta).clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
                    } else {
                        GRADIENT_CLIP
                    };
                    y[i][d] += g * alpha;
                }
            }
        }
        if let Some(frame) = frame {
            if (epoch + 1) % ANIMATION_INTERVAL == 0 {
                let (xs, ys): (Vec<f64>, Vec<f64>) = y.iter().map(|pt| (pt[0], pt[1])).unzip();
                frame(epoch + 1, &xs, &ys);
            }
        }
    }
    info!(
        "UMAP finished {num_epochs} epochs on {n} cells ({} edges)",
        edges.len()
    );
    y.into_iter().map(|pt| (pt[0], pt[1])).unzip()
}
