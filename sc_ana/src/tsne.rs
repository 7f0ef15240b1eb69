//! t-SNE embedding from a neighbor list

use log::info;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use crate::nn::Neighbors;

const SEED: u64 = 209_652_396;
const EXAGGERATION: f64 = 12.0;
const STOP_LYING_ITER: usize = 100;
const MOM_SWITCH_ITER: usize = 250;
const LEARNING_RATE: f64 = 200.0;
const MIN_GAIN: f64 = 0.01;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const MAX_BINARY_STEPS: usize = 200;
/// Frames are reported this often when animating.
pub(crate) const ANIMATION_INTERVAL: usize = 10;

/// Number of neighbors needed for a given perplexity.
pub(crate) fn neighbors_for_perplexity(perplexity: f64) -> usize {
    (perplexity * 3.0).ceil() as usize
}

/// Conditional probabilities of each neighbor, calibrated to `perplexity`.
fn conditional_probabilities(distances: &[f64], perplexity: f64) -> Vec<f64> {
    if distances.is_empty() {
        return Vec::new();
    }
    let target = perplexity.min(distances.len() as f64).ln();
    let d2: Vec<f64> = distances.iter().map(|d| d * d).collect();
    let first = d2[0];
    let (mut lo, mut hi, mut beta) = (0.0f64, f64::INFINITY, 1.0f64);
    let mut probs = vec![0.0; d2.len()];
    for _ in 0..MAX_BINARY_STEPS {
        let mut sum = 0.0;
        for (p, &d) in probs.iter_mut().zip(&d2) {
            *p = (-(d - first) * beta).exp();
            sum += *p;
        }
        let mut entropy = 0.0;
        for p in probs.iter_mut() {
            *p /= sum;
            if *p > 0.0 {
                entropy -= *p * p.ln();
            }
        }
        if (entropy - target).abs() < PERPLEXITY_TOLERANCE {
            break;
        }
        if entropy > target {
            lo = beta;
            beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
        } else {
            hi = beta;
            beta = (beta + lo) / 2.0;
        }
    }
    probs
}

/// Optimize a two-dimensional embedding. `frame` receives the coordinates
/// every [`ANIMATION_INTERVAL`] iterations.
pub(crate) fn run_tsne(
    neighbors: &Neighbors,
    perplexity: f64,
    iterations: usize,
    frame: Option<&(dyn Fn(usize, &[f64], &[f64]) + Sync)>,
) -> (Vec<f64>, Vec<f64>) {
    let n = neighbors.num_cells();
    if n < 2 {
        return (vec![0.0; n], vec![0.0; n]);
    }

    // symmetrized joint probabilities, dense since n is modest
    let mut p = vec![0.0; n * n];
    for i in 0..n {
        let cond = conditional_probabilities(&neighbors.distances[i], perplexity);
        for (&j, &pj) in neighbors.indices[i].iter().zip(&cond) {
            p[i * n + j] += pj;
            p[j * n + i] += pj;
        }
    }
    let total: f64 = p.iter().sum();
    if total > 0.0 {
        p.iter_mut().for_each(|v| *v /= total);
    }

    let mut rng = Pcg64::seed_from_u64(SEED);
    let mut y: Vec<[f64; 2]> = (0..n)
        .map(|_| [rng.gen_range(-1e-4..1e-4), rng.gen_range(-1e-4..1e-4)])
        .collect();
    let mut update: Vec<[f64; 2]> = vec![[0.0; 2]; n];
    let mut gains: Vec<[f64; 2]> = vec![[1.0; 2]; n];
    let mut q: Vec<f64> = vec![0.0; n * n];

    for iter in 0..iterations {
        let exaggeration = if iter < STOP_LYING_ITER { EXAGGERATION } else { 1.0 };
        let momentum = if iter < MOM_SWITCH_ITER { 0.5 } else { 0.8 };

        let mut qsum = 0.0_f64;
        for i in 0..n {
            for j in i + 1..n {
                let dx = y[i][0] - y[j][0];
                let dy = y[i][1] - y[j][1];
                let w = 1.0 / (1.0 + dx * dx + dy * dy);
                q[i * n + j] = w;
                q[j * n + i] = w;
                qsum += 2.0 * w;
            }
        }
        for i in 0..n {
            let mut grad = [0.0_f64; 2];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let w = q[i * n + j];
                let mult = (exaggeration * p[i * n + j] - w / qsum) * w;
                grad[0] += 4.0 * mult * (y[i][0] - y[j][0]);
                grad[1] += 4.0 * mult * (y[i][1] - y[j][1]);
            }
            for d in 0..2 {
                gains[i][d] = if grad[d].signum() != update[i][d].signum() {
                    gains[i][d] + 0.2
                } else {
                    (gains[i][d] * 0.8).max(MIN_GAIN)
                };
                update[i][d] = momentum * update[i][d] - LEARNING_RATE * gains[i][d] * grad[d];
            }
        }
        for (point, step) in y.iter_mut().zip(&update) {
            point[0] += step[0];
            point[1] += step[1];
        }
        // recenter
        let (mx, my) = y
            .iter()
            .fold((0.0, 0.0), |(a, b), pt| (a + pt[0] / n as f64, b + pt[1] / n as f64));
        for point in &mut y {
            point[0] -= mx;
            point[1] -= my;
        }

        if let Some(frame) = frame {
            if (iter + 1) % ANIMATION_INTERVAL == 0 {
                let (xs, ys): (Vec<f64>, Vec<f64>) = y.iter().map(|pt| (pt[0], pt[1])).unzip();
                frame(iter + 1, &xs, &ys);
            }
        }
    }
    info!("t-SNE finished {iterations} iterations on {n} cells");
    y.into_iter().map(|pt| (pt[0], pt[1])).unzip()
}
