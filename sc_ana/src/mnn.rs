//! Mutual nearest neighbor batch correction

use log::{info, warn};
use ndarray::Array2;
use sc_types::BlockFactor;

fn squared(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(points: &[Vec<f64>], query: &[f64], candidates: &[usize], k: usize) -> Vec<usize> {
    let mut scored: Vec<(f64, usize)> = candidates
        .iter()
        .map(|&c| (squared(&points[c], query), c))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, c)| c).collect()
}

/// Merge blocks into a growing reference, largest block first. Each merged
/// cell moves by the average correction vector of the mutual pairs closest
/// to it.
pub(crate) fn mnn_correct(embedding: &Array2<f64>, block: &BlockFactor, k: usize) -> Array2<f64> {
    let dims = embedding.nrows();
    let mut points: Vec<Vec<f64>> = embedding.columns().into_iter().map(|c| c.to_vec()).collect();

    let mut groups = block.groups();
    groups.retain(|g| !g.is_empty());
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    let Some((first, rest)) = groups.split_first() else {
        return embedding.clone();
    };
    let mut reference: Vec<usize> = first.clone();

    for target in rest {
        let mut pairs = Vec::new();
        for &t in target {
            for r in nearest(&points, &points[t], &reference, k) {
                if nearest(&points, &points[r], target, k).contains(&t) {
                    pairs.push((t, r));
                }
            }
        }
        if pairs.is_empty() {
            warn!(
                "no mutual nearest neighbors for a block of {} cells, leaving it uncorrected",
                target.len()
            );
            reference.extend(target);
            continue;
        }
        let paired: Vec<usize> = {
            let mut p: Vec<usize> = pairs.iter().map(|&(t, _)| t).collect();
            p.sort_unstable();
            p.dedup();
            p
        };
        let mut vectors = vec![vec![0.0; dims]; points.len()];
        let mut counts = vec![0usize; points.len()];
        for &(t, r) in &pairs {
            for d in 0..dims {
                vectors[t][d] += points[r][d] - points[t][d];
            }
            counts[t] += 1;
        }
        for &t in &paired {
            for v in &mut vectors[t] {
                *v /= counts[t] as f64;
            }
        }

        let corrections: Vec<Vec<f64>> = target
            .iter()
            .map(|&t| {
                let close = nearest(&points, &points[t], &paired, k);
                let mut avg = vec![0.0; dims];
                for &p in &close {
                    for d in 0..dims {
                        avg[d] += vectors[p][d] / close.len() as f64;
                    }
                }
                avg
            })
            .collect();
        for (&t, correction) in target.iter().zip(corrections) {
            for d in 0..dims {
                points[t][d] += correction[d];
            }
        }
        info!(
            "merged a block of {} cells using {} mutual pairs",
            target.len(),
            pairs.len()
        );
        reference.extend(target);
    }

    let mut out = Array2::zeros(embedding.dim());
    for (c, point) in points.iter().enumerate() {
        for d in 0..dims {
            out[[d, c]] = point[d];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_block_is_pulled_back() -> anyhow::Result<()> {
        // two identical populations, the second block shifted by +10
        let mut x = Vec::new();
        let mut ids = Vec::new();
        for b in 0..2 {
            for i in 0..12 {
                x.push(i as f64 * 0.1 + b as f64 * 10.0);
                ids.push(b);
            }
        }
        let y: Vec<f64> = (0..24).map(|i| (i % 12) as f64 * 0.05).collect();
        let embedding = Array2::from_shape_vec((2, 24), [x, y].concat())?;
        let block = BlockFactor::new(ids, vec!["a".into(), "b".into()])?;
        let corrected = mnn_correct(&embedding, &block, 5);
        let shift = (12..24).map(|c| corrected[[0, c]] - embedding[[0, c]]).sum::<f64>() / 12.0;
        assert!((shift + 10.0).abs() < 1.5, "shift was {shift}");
        for c in 0..12 {
            assert_eq!(corrected[[0, c]], embedding[[0, c]]);
        }
        Ok(())
    }
}
