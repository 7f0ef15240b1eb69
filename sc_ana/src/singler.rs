//! Reference-based label transfer for clusters.
//!
//! A reference is reduced to marker features distinguishing each pair of its
//! labels; each cluster profile is then correlated against every reference
//! sample over those markers, and the label with the highest per-label
//! correlation quantile wins.

use anyhow::Result;
use itertools::Itertools;
use log::{info, warn};
use sc_types::PipelineError;
use std::collections::HashMap;

use crate::providers::LabelReference;

/// A reference restricted to features shared with the dataset.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BuiltReference {
    pub name: String,
    /// Unique label names.
    pub labels: Vec<String>,
    /// Dataset rows of the marker features.
    pub data_rows: Vec<usize>,
    /// Reference profiles of each label's samples over the markers.
    pub samples: Vec<Vec<Vec<f64>>>,
}

/// Label assignment of each cluster against one reference.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Assignment {
    pub labels: Vec<String>,
    /// Score of the assigned label, per cluster.
    pub best_scores: Vec<f64>,
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx > 0.0 && syy > 0.0 {
        sxy / (sxx * syy).sqrt()
    } else {
        0.0
    }
}

pub(crate) fn spearman(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    pearson(&stats::average_ranks(x), &stats::average_ranks(y))
}

/// Intersect the reference with `dataset_features` and pick markers.
pub(crate) fn build_reference(
    name: &str,
    reference: &LabelReference,
    dataset_features: &[String],
    top_markers: usize,
) -> Result<BuiltReference> {
    let position: HashMap<&str, usize> = dataset_features
        .iter()
        .enumerate()
        .rev()
        .map(|(i, f)| (f.as_str(), i))
        .collect();
    // (reference row, dataset row)
    let shared: Vec<(usize, usize)> = reference
        .features
        .iter()
        .enumerate()
        .filter_map(|(r, f)| position.get(f.as_str()).map(|&d| (r, d)))
        .collect();
    if shared.is_empty() {
        return Err(PipelineError::reference(format!(
            "reference {name:?} shares no features with the dataset"
        ))
        .into());
    }

    let labels: Vec<String> = reference.labels.iter().cloned().sorted().dedup().collect();
    let members: Vec<Vec<usize>> = labels
        .iter()
        .map(|l| {
            (0..reference.labels.len())
                .filter(|&s| &reference.labels[s] == l)
                .collect()
        })
        .collect();
    let medians: Vec<Vec<f64>> = members
        .iter()
        .map(|samples| {
            shared
                .iter()
                .map(|&(r, _)| {
                    let values: Vec<f64> = samples.iter().map(|&s| reference.profiles[[r, s]]).collect();
                    stats::median(&values)
                })
                .collect()
        })
        .collect();

    let mut chosen = vec![false; shared.len()];
    for (a, b) in (0..labels.len()).tuple_combinations() {
        for (left, right) in [(a, b), (b, a)] {
            let diffs: Vec<f64> = medians[left]
                .iter()
                .zip(&medians[right])
                .map(|(x, y)| x - y)
                .collect();
            for (i, rank) in stats::descending_ranks(&diffs).into_iter().enumerate() {
                if rank <= top_markers && diffs[i] > 0.0 {
                    chosen[i] = true;
                }
            }
        }
    }
    let markers: Vec<usize> = (0..shared.len()).filter(|&i| chosen[i]).collect();
    if markers.is_empty() {
        warn!("reference {name:?} has no markers among the shared features");
    }
    let samples = members
        .iter()
        .map(|samples| {
            samples
                .iter()
                .map(|&s| markers.iter().map(|&i| reference.profiles[[shared[i].0, s]]).collect())
                .collect()
        })
        .collect();
    info!(
        "built reference {name:?}: {} labels, {} shared features, {} markers",
        labels.len(),
        shared.len(),
        markers.len()
    );
    Ok(BuiltReference {
        name: name.to_string(),
        labels,
        data_rows: markers.iter().map(|&i| shared[i].1).collect(),
        samples,
    })
}

/// Score each cluster profile (indexed by dataset row) against a built
/// reference.
pub(crate) fn assign_labels(
    reference: &BuiltReference,
    profiles: &[Vec<f64>],
    quantile: f64,
) -> Assignment {
    let mut labels = Vec::with_capacity(profiles.len());
    let mut best_scores = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let query: Vec<f64> = reference.data_rows.iter().map(|&r| profile[r]).collect();
        let scores: Vec<f64> = reference
            .samples
            .iter()
            .map(|samples| {
                let correlations: Vec<f64> = samples.iter().map(|s| spearman(&query, s)).collect();
                stats::quantile(&correlations, quantile)
            })
            .collect();
        let best = (0..scores.len())
            .filter(|&i| !scores[i].is_nan())
            .max_by(|&a, &b| scores[a].total_cmp(&scores[b]).then(b.cmp(&a)));
        match best {
            Some(i) => {
                labels.push(reference.labels[i].clone());
                best_scores.push(scores[i]);
            }
            None => {
                labels.push(String::new());
                best_scores.push(f64::NAN);
            }
        }
    }
    Assignment {
        labels,
        best_scores,
    }
}

/// Name of the reference whose assignment scores best, per cluster.
pub(crate) fn integrate(names: &[String], assignments: &[Assignment]) -> Vec<String> {
    let num_clusters = assignments.first().map_or(0, |a| a.labels.len());
    (0..num_clusters)
        .map(|c| {
            (0..assignments.len())
                .filter(|&r| !assignments[r].best_scores[c].is_nan())
                .max_by(|&a, &b| {
                    assignments[a].best_scores[c]
                        .total_cmp(&assignments[b].best_scores[c])
                        .then(b.cmp(&a))
                })
                .map(|r| names[r].clone())
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn reference() -> LabelReference {
        LabelReference::new(
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            vec!["T".into(), "T".into(), "B".into(), "B".into()],
            array![
                [9.0, 8.0, 1.0, 0.0],
                [1.0, 0.0, 9.0, 8.0],
                [5.0, 6.0, 1.0, 2.0],
                [2.0, 1.0, 6.0, 5.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_spearman() {
        assert_eq!(spearman(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]), 1.0);
        assert_eq!(spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0);
        assert_eq!(spearman(&[1.0, 1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_label_clusters() -> Result<()> {
        let dataset: Vec<String> = ["X", "D", "C", "B", "A"].iter().map(|s| s.to_string()).collect();
        let built = build_reference("immune", &reference(), &dataset, 2)?;
        assert_eq!(built.labels, vec!["B", "T"]);
        assert_eq!(built.data_rows.len(), 4);

        // cluster 0 looks like T cells, cluster 1 like B cells
        let profiles = vec![
            vec![0.0, 1.0, 4.0, 0.5, 7.0],
            vec![0.0, 4.0, 0.5, 6.0, 1.0],
        ];
        let assigned = assign_labels(&built, &profiles, 0.8);
        assert_eq!(assigned.labels, vec!["T", "B"]);
        assert!(assigned.best_scores.iter().all(|&s| s > 0.5));
        Ok(())
    }

    #[test]
    fn test_disjoint_reference_fails() {
        let dataset = vec!["Z".to_string()];
        assert!(build_reference("immune", &reference(), &dataset, 2).is_err());
    }

    #[test]
    fn test_integrate_picks_best_reference() {
        let a = Assignment {
            labels: vec!["T".into(), "B".into()],
            best_scores: vec![0.9, 0.2],
        };
        let b = Assignment {
            labels: vec!["NK".into(), "Mono".into()],
            best_scores: vec![0.5, 0.7],
        };
        assert_eq!(
            integrate(&["first".into(), "second".into()], &[a, b]),
            vec!["first", "second"]
        );
    }
}
