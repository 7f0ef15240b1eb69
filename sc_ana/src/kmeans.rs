//! k-means clustering of embedded cells

use log::info;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

const SEED: u64 = 42;
const MAX_ITERATIONS: usize = 100;

fn squared_distance(data: &Array2<f64>, cell: usize, center: &[f64]) -> f64 {
    center
        .iter()
        .enumerate()
        .map(|(d, c)| (data[[d, cell]] - c).powi(2))
        .sum()
}

/// Relabel so that cluster 0 is the largest; ties keep the earlier label first.
pub(crate) fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let num = labels.iter().max().map_or(0, |&m| m + 1);
    let mut sizes = vec![0usize; num];
    for &l in labels {
        sizes[l] += 1;
    }
    let mut order: Vec<usize> = (0..num).filter(|&l| sizes[l] > 0).collect();
    order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(a.cmp(&b)));
    let mut new_label = vec![0; num];
    for (new, &old) in order.iter().enumerate() {
        new_label[old] = new;
    }
    labels.iter().map(|&l| new_label[l]).collect()
}

fn plus_plus_init(data: &Array2<f64>, k: usize, rng: &mut Pcg64) -> Vec<Vec<f64>> {
    let (dims, n) = data.dim();
    let column = |c: usize| (0..dims).map(|d| data[[d, c]]).collect::<Vec<_>>();
    let mut centers = vec![column(rng.gen_range(0..n))];
    let mut nearest: Vec<f64> = (0..n)
        .map(|c| squared_distance(data, c, &centers[0]))
        .collect();
    while centers.len() < k {
        let total: f64 = nearest.iter().sum();
        let chosen = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (c, &w) in nearest.iter().enumerate() {
                if target < w {
                    chosen = c;
                    break;
                }
                target -= w;
            }
            chosen
        } else {
            // every remaining cell sits on a center already
            centers.len() % n
        };
        let center = column(chosen);
        for (c, best) in nearest.iter_mut().enumerate() {
            *best = best.min(squared_distance(data, c, &center));
        }
        centers.push(center);
    }
    centers
}

/// Cluster the columns of `data` (dimensions × cells) into at most `k`
/// clusters. Labels are ordered by decreasing cluster size.
pub(crate) fn kmeans(data: &Array2<f64>, k: usize) -> Vec<usize> {
    let (dims, n) = data.dim();
    if n == 0 {
        return Vec::new();
    }
    let k = k.clamp(1, n);
    let mut rng = Pcg64::seed_from_u64(SEED);
    let mut centers = plus_plus_init(data, k, &mut rng);
    let mut labels = vec![0usize; n];

    for iteration in 0..MAX_ITERATIONS {
        let mut moved = 0;
        for (c, label) in labels.iter_mut().enumerate() {
            let best = (0..k)
                .map(|j| (squared_distance(data, c, &centers[j]), j))
                .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
                .map_or(0, |(_, j)| j);
            moved += usize::from(best != *label);
            *label = best;
        }
        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (c, &label) in labels.iter().enumerate() {
            counts[label] += 1;
            for d in 0..dims {
                sums[label][d] += data[[d, c]];
            }
        }
        for j in 0..k {
            // an emptied cluster keeps its previous center
            if counts[j] > 0 {
                centers[j] = sums[j].iter().map(|s| s / counts[j] as f64).collect();
            }
        }
        if iteration > 0 && moved == 0 {
            info!("k-means converged after {iteration} iterations");
            break;
        }
    }
    relabel_by_size(&labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_relabel_by_size() {
        assert_eq!(relabel_by_size(&[2, 2, 0, 1, 1, 1]), vec![1, 1, 2, 0, 0, 0]);
        assert_eq!(relabel_by_size(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_separated_groups() {
        let mut values = Vec::new();
        let mut ys = Vec::new();
        for i in 0..30 {
            values.push(if i < 20 { 0.0 } else { 50.0 } + (i % 5) as f64 * 0.1);
            ys.push((i % 3) as f64 * 0.1);
        }
        values.extend(ys);
        let data = Array2::from_shape_vec((2, 30), values).unwrap();
        let labels = kmeans(&data, 2);
        assert!(labels[..20].iter().all(|&l| l == 0));
        assert!(labels[20..].iter().all(|&l| l == 1));
        assert_eq!(kmeans(&data, 100).len(), 30);
    }
}
