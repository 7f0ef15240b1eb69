//! Marker scoring: pairwise effect sizes between groups of cells,
//! summarized per group.

use anyhow::Result;
use rayon::prelude::*;
use sc_store::Group;
use sc_types::block::block_groups;
use sc_types::error::check_length;
use sc_types::{BlockFactor, CountMatrix, PipelineError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pairwise effect size.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    Cohen,
    Lfc,
    DeltaDetected,
    Auc,
}

impl Effect {
    pub const ALL: [Effect; 4] = [Effect::Cohen, Effect::Lfc, Effect::DeltaDetected, Effect::Auc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Cohen => "cohen",
            Effect::Lfc => "lfc",
            Effect::DeltaDetected => "delta_detected",
            Effect::Auc => "auc",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the pairwise effects of one group are reduced to a single value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Summary {
    Min,
    Mean,
    /// Best rank of the feature across the pairwise comparisons; smaller is
    /// better.
    #[default]
    MinRank,
}

impl Summary {
    pub const ALL: [Summary; 3] = [Summary::Min, Summary::Mean, Summary::MinRank];

    pub fn as_str(&self) -> &'static str {
        match self {
            Summary::Min => "min",
            Summary::Mean => "mean",
            Summary::MinRank => "min_rank",
        }
    }
}

/// Per-feature summaries of one effect for one group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EffectSummary {
    pub min: Vec<f64>,
    pub mean: Vec<f64>,
    pub min_rank: Vec<f64>,
}

impl EffectSummary {
    pub fn get(&self, summary: Summary) -> &[f64] {
        match summary {
            Summary::Min => &self.min,
            Summary::Mean => &self.mean,
            Summary::MinRank => &self.min_rank,
        }
    }
}

/// Marker statistics of one group against all others.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupMarkers {
    pub means: Vec<f64>,
    pub detected: Vec<f64>,
    pub cohen: EffectSummary,
    pub lfc: EffectSummary,
    pub delta_detected: EffectSummary,
    pub auc: Option<EffectSummary>,
}

impl GroupMarkers {
    pub fn effect(&self, effect: Effect) -> Option<&EffectSummary> {
        match effect {
            Effect::Cohen => Some(&self.cohen),
            Effect::Lfc => Some(&self.lfc),
            Effect::DeltaDetected => Some(&self.delta_detected),
            Effect::Auc => self.auc.as_ref(),
        }
    }

    pub fn num_features(&self) -> usize {
        self.means.len()
    }

    pub(crate) fn write(&self, group: &mut Group) {
        group.write("means", &self.means[..]);
        group.write("detected", &self.detected[..]);
        for effect in Effect::ALL {
            if let Some(summary) = self.effect(effect) {
                let g = group.create_group(effect.as_str());
                for s in Summary::ALL {
                    g.write(s.as_str(), summary.get(s));
                }
            }
        }
    }

    /// Read a persisted group, reordering every per-feature vector with
    /// `reorder`.
    pub(crate) fn read(
        group: &Group,
        reorder: &dyn Fn(Vec<f64>) -> Result<Vec<f64>>,
    ) -> Result<Self> {
        let read_summary = |name: &str| -> Result<Option<EffectSummary>> {
            match group.group_opt(name) {
                None => Ok(None),
                Some(g) => Ok(Some(EffectSummary {
                    min: reorder(g.read("min")?)?,
                    mean: reorder(g.read("mean")?)?,
                    min_rank: reorder(g.read("min_rank")?)?,
                })),
            }
        };
        let required = |name: &str| -> Result<EffectSummary> {
            read_summary(name)?
                .ok_or_else(|| PipelineError::format(format!("missing marker effect {name:?}")).into())
        };
        Ok(GroupMarkers {
            means: reorder(group.read("means")?)?,
            detected: reorder(group.read("detected")?)?,
            cohen: required(Effect::Cohen.as_str())?,
            lfc: required(Effect::Lfc.as_str())?,
            delta_detected: required(Effect::DeltaDetected.as_str())?,
            auc: read_summary(Effect::Auc.as_str())?,
        })
    }
}

/// Per-group statistics of one feature within one block.
#[derive(Clone, Copy, Debug, Default)]
struct Moments {
    count: usize,
    mean: f64,
    variance: f64,
    detected: f64,
}

fn moments(values: &[f64]) -> Moments {
    let count = values.len();
    if count == 0 {
        return Moments::default();
    }
    let n = count as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = if count > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    let detected = values.iter().filter(|&&v| v > 0.0).count() as f64 / n;
    Moments {
        count,
        mean,
        variance,
        detected,
    }
}

fn cohen(left: &Moments, right: &Moments, threshold: f64) -> f64 {
    let diff = left.mean - right.mean - threshold;
    let sd = ((left.variance + right.variance) / 2.0).sqrt();
    if sd > 0.0 {
        diff / sd
    } else if diff == 0.0 {
        0.0
    } else {
        diff.signum() * f64::INFINITY
    }
}

/// Probability that a shifted left value exceeds a right value, ties
/// counting half. `right` must be sorted.
fn auc(left: &[f64], right: &[f64], threshold: f64) -> f64 {
    if left.is_empty() || right.is_empty() {
        return f64::NAN;
    }
    let mut total = 0.0;
    for &x in left {
        let x = x - threshold;
        let below = right.partition_point(|&y| y < x);
        let not_above = right.partition_point(|&y| y <= x);
        total += below as f64 + 0.5 * (not_above - below) as f64;
    }
    total / (left.len() * right.len()) as f64
}

/// Pairwise effects of one feature, indexed `[effect][left * g + right]`,
/// averaged over the blocks where both groups have cells.
fn feature_effects(
    row: &[f64],
    cells: &[Vec<Vec<usize>>],
    num_groups: usize,
    threshold: f64,
    compute_auc: bool,
) -> [Vec<f64>; 4] {
    let pairs = num_groups * num_groups;
    let mut sums: [Vec<f64>; 4] = std::array::from_fn(|_| vec![0.0; pairs]);
    let mut counts = vec![0usize; pairs];
    for block in cells {
        let values: Vec<Vec<f64>> = block
            .iter()
            .map(|g| g.iter().map(|&c| row[c]).collect())
            .collect();
        let stats: Vec<Moments> = values.iter().map(|v| moments(v)).collect();
        let sorted: Vec<Vec<f64>> = if compute_auc {
            values
                .iter()
                .map(|v| {
                    let mut s = v.clone();
                    s.sort_by(f64::total_cmp);
                    s
                })
                .collect()
        } else {
            Vec::new()
        };
        for left in 0..num_groups {
            for right in 0..num_groups {
                if left == right || stats[left].count == 0 || stats[right].count == 0 {
                    continue;
                }
                let idx = left * num_groups + right;
                counts[idx] += 1;
                sums[0][idx] += cohen(&stats[left], &stats[right], threshold);
                sums[1][idx] += stats[left].mean - stats[right].mean;
                sums[2][idx] += stats[left].detected - stats[right].detected;
                if compute_auc {
                    sums[3][idx] += auc(&values[left], &sorted[right], threshold);
                }
            }
        }
    }
    for effect in &mut sums {
        for (v, &n) in effect.iter_mut().zip(&counts) {
            *v = if n > 0 { *v / n as f64 } else { f64::NAN };
        }
    }
    sums
}

fn summarize(pairwise: &[Vec<f64>], num_groups: usize, group: usize) -> EffectSummary {
    let num_features = pairwise.len();
    let others: Vec<usize> = (0..num_groups).filter(|&h| h != group).collect();
    let mut min = vec![f64::NAN; num_features];
    let mut mean = vec![f64::NAN; num_features];
    for (f, effects) in pairwise.iter().enumerate() {
        let valid: Vec<f64> = others
            .iter()
            .map(|&h| effects[group * num_groups + h])
            .filter(|v| !v.is_nan())
            .collect();
        if !valid.is_empty() {
            min[f] = valid.iter().copied().fold(f64::INFINITY, f64::min);
            mean[f] = valid.iter().sum::<f64>() / valid.len() as f64;
        }
    }
    let mut min_rank = vec![f64::INFINITY; num_features];
    for &h in &others {
        let column: Vec<f64> = pairwise
            .iter()
            .map(|effects| effects[group * num_groups + h])
            .collect();
        for (best, rank) in min_rank.iter_mut().zip(stats::descending_ranks(&column)) {
            *best = best.min(rank as f64);
        }
    }
    EffectSummary {
        min,
        mean,
        min_rank,
    }
}

/// Score every feature of a log-normalized matrix for each group.
///
/// `groups[c]` is the group of cell `c`; groups without cells get NaN
/// statistics.
pub(crate) fn score_markers(
    matrix: &CountMatrix,
    groups: &[usize],
    num_groups: usize,
    block: Option<&BlockFactor>,
    lfc_threshold: f64,
    compute_auc: bool,
) -> Result<Vec<GroupMarkers>> {
    let n = matrix.num_columns();
    check_length("group assignments", groups.len(), n)?;
    if let Some(b) = block {
        check_length("block factor", b.len(), n)?;
    }
    if let Some(&bad) = groups.iter().find(|&&g| g >= num_groups) {
        return Err(PipelineError::consistency(format!(
            "group {bad} is out of range for {num_groups} groups"
        ))
        .into());
    }
    // cells[block][group]
    let cells: Vec<Vec<Vec<usize>>> = block_groups(block, n)
        .into_iter()
        .map(|members| {
            let mut per_group = vec![Vec::new(); num_groups];
            for c in members {
                per_group[groups[c]].push(c);
            }
            per_group
        })
        .collect();
    let mut all = vec![Vec::new(); num_groups];
    for (c, &g) in groups.iter().enumerate() {
        all[g].push(c);
    }

    let per_feature: Vec<(Vec<Moments>, [Vec<f64>; 4])> = (0..matrix.num_rows())
        .into_par_iter()
        .map(|r| {
            let row = matrix.row_dense(r);
            let overall = all
                .iter()
                .map(|members| moments(&members.iter().map(|&c| row[c]).collect::<Vec<_>>()))
                .collect();
            (
                overall,
                feature_effects(&row, &cells, num_groups, lfc_threshold, compute_auc),
            )
        })
        .collect();

    let effect_columns: Vec<Vec<Vec<f64>>> = (0..4)
        .map(|e| per_feature.iter().map(|(_, fx)| fx[e].clone()).collect())
        .collect();
    Ok((0..num_groups)
        .map(|g| GroupMarkers {
            means: per_feature
                .iter()
                .map(|(m, _)| if m[g].count > 0 { m[g].mean } else { f64::NAN })
                .collect(),
            detected: per_feature
                .iter()
                .map(|(m, _)| if m[g].count > 0 { m[g].detected } else { f64::NAN })
                .collect(),
            cohen: summarize(&effect_columns[0], num_groups, g),
            lfc: summarize(&effect_columns[1], num_groups, g),
            delta_detected: summarize(&effect_columns[2], num_groups, g),
            auc: compute_auc.then(|| summarize(&effect_columns[3], num_groups, g)),
        })
        .collect())
}

/// Markers of the `left` group against the `right` group only.
pub(crate) fn score_versus(
    matrix: &CountMatrix,
    groups: &[usize],
    left: usize,
    right: usize,
    block: Option<&BlockFactor>,
    lfc_threshold: f64,
    compute_auc: bool,
) -> Result<GroupMarkers> {
    check_length("group assignments", groups.len(), matrix.num_columns())?;
    let keep: Vec<usize> = (0..groups.len())
        .filter(|&c| groups[c] == left || groups[c] == right)
        .collect();
    let sub = matrix.subset_columns(&keep)?;
    let labels: Vec<usize> = keep
        .iter()
        .map(|&c| usize::from(groups[c] != left))
        .collect();
    let sub_block = block.map(|b| b.subset(&keep)).transpose()?;
    let mut scored = score_markers(&sub, &labels, 2, sub_block.as_ref(), lfc_threshold, compute_auc)?;
    Ok(scored.swap_remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matrix() -> CountMatrix {
        // feature 0 marks group 0, feature 1 marks group 1, feature 2 is flat
        CountMatrix::from_dense(
            6,
            &[
                vec![5.0, 6.0, 5.5, 0.0, 0.5, 0.0],
                vec![0.0, 0.0, 1.0, 4.0, 5.0, 4.5],
                vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_two_group_markers() -> Result<()> {
        let groups = vec![0, 0, 0, 1, 1, 1];
        let out = score_markers(&matrix(), &groups, 2, None, 0.0, true)?;
        assert_eq!(out.len(), 2);
        let g0 = &out[0];
        assert_eq!(g0.means[2], 1.0);
        assert_eq!(g0.detected[0], 1.0);
        assert!((g0.detected[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!(g0.cohen.min[0] > 0.0);
        assert!(g0.cohen.min[1] < 0.0);
        assert_eq!(g0.cohen.min[2], 0.0);
        assert_eq!(g0.cohen.min_rank[0], 1.0);
        assert_eq!(out[1].cohen.min_rank[1], 1.0);
        let auc = g0.auc.as_ref().unwrap();
        assert_eq!(auc.mean[0], 1.0);
        assert_eq!(auc.mean[2], 0.5);
        assert!((g0.lfc.mean[0] - (5.5 - 0.5 / 3.0)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_versus_matches_pairwise() -> Result<()> {
        let groups = vec![0, 0, 2, 1, 1, 2];
        let versus = score_versus(&matrix(), &groups, 1, 0, None, 0.0, false)?;
        assert!(versus.auc.is_none());
        assert!(versus.lfc.mean[1] > 0.0);
        assert_eq!(versus.cohen.min, versus.cohen.mean);
        Ok(())
    }

    #[test]
    fn test_blocks_average_effects() -> Result<()> {
        let groups = vec![0, 1, 0, 1, 0, 1];
        let block = BlockFactor::new(vec![0, 0, 0, 1, 1, 1], vec!["a".into(), "b".into()])?;
        let out = score_markers(&matrix(), &groups, 2, Some(&block), 0.0, false)?;
        // block a: lfc (5 + 5.5)/2 - 6 ; block b: 0.5 - (0 + 0)/2
        let expected = ((5.25 - 6.0) + (0.5 - 0.0)) / 2.0;
        assert!((out[0].lfc.mean[0] - expected).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_persisted_layout() -> Result<()> {
        let groups = vec![0, 0, 0, 1, 1, 1];
        let out = score_markers(&matrix(), &groups, 2, None, 0.0, true)?;
        let mut g = Group::new();
        out[1].write(&mut g);
        assert!(g.group("cohen")?.contains("min_rank"));
        let back = GroupMarkers::read(&g, &|v: Vec<f64>| -> Result<Vec<f64>> { Ok(v) })?;
        assert_eq!(back, out[1]);
        assert!(score_markers(&matrix(), &[0, 1], 2, None, 0.0, false).is_err());
        Ok(())
    }

    #[test]
    fn test_cohen_zero_variance() {
        let a = moments(&[2.0, 2.0]);
        let b = moments(&[1.0, 1.0]);
        assert_eq!(cohen(&a, &b, 0.0), f64::INFINITY);
        assert_eq!(cohen(&b, &a, 0.0), f64::NEG_INFINITY);
        assert_eq!(cohen(&a, &a, 0.0), 0.0);
    }
}
