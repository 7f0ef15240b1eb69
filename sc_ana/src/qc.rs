//! Per-cell quality control metrics and outlier filters.

use anyhow::Result;
use log::info;
use sc_store::Group;
use sc_types::block::block_groups;
use sc_types::error::check_length;
use sc_types::{BlockFactor, Column, CountMatrix, DataFrame};
use stats::{lower_threshold, median, upper_threshold};
use std::collections::BTreeMap;

pub(crate) const SUMS: &str = "sums";
pub(crate) const DETECTED: &str = "detected";
pub(crate) const SUBSET_PROPORTION: &str = "subset_proportion";
pub(crate) const IGG_TOTAL: &str = "igg_total";
pub(crate) const MAX_PROPORTION: &str = "max_proportion";
pub(crate) const MAX_INDEX: &str = "max_index";
pub(crate) const MAX_COUNT: &str = "max_count";

/// Protein-coding mitochondrial genes, matched case-insensitively with an
/// `mt-` prefix so both human and mouse symbols are found.
const MITO_GENES: [&str; 13] = [
    "nd1", "nd2", "co1", "co2", "atp8", "atp6", "co3", "nd3", "nd4l", "nd4", "nd5", "nd6", "cyb",
];

/// Metrics, per-block thresholds and the resulting discards of one modality.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QcResults {
    pub metrics: BTreeMap<String, Vec<f64>>,
    /// Row of the most abundant feature in each cell, for CRISPR guides.
    pub max_index: Option<Vec<usize>>,
    /// One value per block level.
    pub thresholds: BTreeMap<String, Vec<f64>>,
    pub discards: Vec<bool>,
}

impl QcResults {
    pub fn num_discarded(&self) -> usize {
        self.discards.iter().filter(|&&d| d).count()
    }

    pub fn write(&self, results: &mut Group) {
        let metrics = results.create_group("metrics");
        for (name, values) in &self.metrics {
            metrics.write(name, &values[..]);
        }
        if let Some(index) = &self.max_index {
            metrics.write(MAX_INDEX, &index[..]);
        }
        let thresholds = results.create_group("thresholds");
        for (name, values) in &self.thresholds {
            thresholds.write(name, &values[..]);
        }
        results.write("discards", &self.discards[..]);
    }

    pub fn read(results: &Group) -> Result<Self> {
        let mut out = QcResults {
            discards: results.read("discards")?,
            ..Default::default()
        };
        if let Some(metrics) = results.group_opt("metrics") {
            for name in metrics.names() {
                if name == MAX_INDEX {
                    out.max_index = Some(metrics.read(name)?);
                } else {
                    out.metrics.insert(name.to_string(), metrics.read(name)?);
                }
            }
        }
        if let Some(thresholds) = results.group_opt("thresholds") {
            for name in thresholds.names() {
                out.thresholds
                    .insert(name.to_string(), thresholds.read(name)?);
            }
        }
        Ok(out)
    }
}

fn string_columns(features: &DataFrame) -> impl Iterator<Item = &[String]> {
    features.iter().filter_map(|(_, col)| match col {
        Column::Str(values) => Some(values.as_slice()),
        Column::Num(_) => None,
    })
}

/// Rows whose identifier or name satisfies `pred` in any string column.
fn matching_rows(features: &DataFrame, pred: impl Fn(&str) -> bool) -> Vec<usize> {
    let mut hit = vec![false; features.num_rows()];
    for values in string_columns(features) {
        for (h, v) in hit.iter_mut().zip(values) {
            *h |= pred(&v.to_lowercase());
        }
    }
    (0..hit.len()).filter(|&i| hit[i]).collect()
}

/// Mitochondrial feature rows, either from the built-in gene list or by
/// name prefix.
pub(crate) fn mito_rows(features: &DataFrame, use_default: bool, prefix: &str) -> Vec<usize> {
    if use_default {
        matching_rows(features, |name| {
            name.strip_prefix("mt-")
                .map_or(false, |gene| MITO_GENES.contains(&gene))
        })
    } else {
        let prefix = prefix.to_lowercase();
        matching_rows(features, |name| !prefix.is_empty() && name.starts_with(&prefix))
    }
}

/// Rows of isotype control antibodies.
pub(crate) fn igg_rows(features: &DataFrame, prefix: &str) -> Vec<usize> {
    let prefix = prefix.to_lowercase();
    matching_rows(features, |name| !prefix.is_empty() && name.starts_with(&prefix))
}

fn subset_totals(matrix: &CountMatrix, rows: &[usize]) -> Vec<f64> {
    let mut totals = vec![0.0; matrix.num_columns()];
    for &r in rows {
        let (indices, values) = matrix.row(r);
        for (&c, &v) in indices.iter().zip(values) {
            totals[c] += v;
        }
    }
    totals
}

/// Apply `threshold` to the values of each block.
fn per_block(
    values: &[f64],
    groups: &[Vec<usize>],
    threshold: impl Fn(&[f64]) -> f64,
) -> Vec<f64> {
    groups
        .iter()
        .map(|cells| {
            let sub: Vec<f64> = cells.iter().map(|&c| values[c]).collect();
            threshold(&sub)
        })
        .collect()
}

fn block_of(block: Option<&BlockFactor>, num_cells: usize) -> Vec<usize> {
    match block {
        Some(b) => b.ids().iter().map(|&id| id as usize).collect(),
        None => vec![0; num_cells],
    }
}

fn check_block(block: Option<&BlockFactor>, num_cells: usize) -> Result<()> {
    if let Some(b) = block {
        check_length("block factor", b.len(), num_cells)?;
    }
    Ok(())
}

pub(crate) fn rna_qc(
    matrix: &CountMatrix,
    mito: &[usize],
    block: Option<&BlockFactor>,
    nmads: f64,
) -> Result<QcResults> {
    let n = matrix.num_columns();
    check_block(block, n)?;
    let sums = matrix.column_sums();
    let detected = matrix.column_detected();
    let proportion: Vec<f64> = subset_totals(matrix, mito)
        .iter()
        .zip(&sums)
        .map(|(&m, &s)| if s > 0.0 { m / s } else { 0.0 })
        .collect();

    let groups = block_groups(block, n);
    let sum_thr = per_block(&sums, &groups, |v| lower_threshold(v, nmads, true));
    let det_thr = per_block(&detected, &groups, |v| lower_threshold(v, nmads, true));
    let prop_thr = per_block(&proportion, &groups, |v| upper_threshold(v, nmads, false));
    let ids = block_of(block, n);
    let discards = (0..n)
        .map(|c| {
            let b = ids[c];
            sums[c] < sum_thr[b] || detected[c] < det_thr[b] || proportion[c] > prop_thr[b]
        })
        .collect();

    let out = QcResults {
        metrics: BTreeMap::from([
            (SUMS.to_string(), sums),
            (DETECTED.to_string(), detected),
            (SUBSET_PROPORTION.to_string(), proportion),
        ]),
        max_index: None,
        thresholds: BTreeMap::from([
            (SUMS.to_string(), sum_thr),
            (DETECTED.to_string(), det_thr),
            (SUBSET_PROPORTION.to_string(), prop_thr),
        ]),
        discards,
    };
    info!(
        "RNA QC: {} of {n} cells fail ({} mitochondrial features)",
        out.num_discarded(),
        mito.len()
    );
    Ok(out)
}

pub(crate) fn adt_qc(
    matrix: &CountMatrix,
    igg: &[usize],
    block: Option<&BlockFactor>,
    nmads: f64,
    min_detected_drop: f64,
) -> Result<QcResults> {
    let n = matrix.num_columns();
    check_block(block, n)?;
    let sums = matrix.column_sums();
    let detected = matrix.column_detected();
    let igg_total = subset_totals(matrix, igg);

    let groups = block_groups(block, n);
    let det_thr = per_block(&detected, &groups, |v| {
        let floor = (1.0 - min_detected_drop) * median(v);
        let mad = lower_threshold(v, nmads, true);
        if floor.is_finite() {
            mad.min(floor)
        } else {
            mad
        }
    });
    let igg_thr = per_block(&igg_total, &groups, |v| upper_threshold(v, nmads, true));
    let ids = block_of(block, n);
    let discards = (0..n)
        .map(|c| detected[c] < det_thr[ids[c]] || igg_total[c] > igg_thr[ids[c]])
        .collect();

    let out = QcResults {
        metrics: BTreeMap::from([
            (SUMS.to_string(), sums),
            (DETECTED.to_string(), detected),
            (IGG_TOTAL.to_string(), igg_total),
        ]),
        max_index: None,
        thresholds: BTreeMap::from([
            (DETECTED.to_string(), det_thr),
            (IGG_TOTAL.to_string(), igg_thr),
        ]),
        discards,
    };
    info!("ADT QC: {} of {n} cells fail", out.num_discarded());
    Ok(out)
}

pub(crate) fn crispr_qc(
    matrix: &CountMatrix,
    block: Option<&BlockFactor>,
    nmads: f64,
) -> Result<QcResults> {
    let n = matrix.num_columns();
    check_block(block, n)?;
    let sums = matrix.column_sums();
    let detected = matrix.column_detected();
    let mut max_count = vec![0.0; n];
    let mut max_index = vec![0usize; n];
    for (r, (indices, values)) in matrix.rows().enumerate() {
        for (&c, &v) in indices.iter().zip(values) {
            if v > max_count[c] {
                max_count[c] = v;
                max_index[c] = r;
            }
        }
    }
    let max_proportion: Vec<f64> = max_count
        .iter()
        .zip(&sums)
        .map(|(&m, &s)| if s > 0.0 { m / s } else { 0.0 })
        .collect();

    let groups = block_groups(block, n);
    let count_thr = per_block(&max_count, &groups, |v| lower_threshold(v, nmads, true));
    let ids = block_of(block, n);
    let discards = (0..n).map(|c| max_count[c] < count_thr[ids[c]]).collect();

    let out = QcResults {
        metrics: BTreeMap::from([
            (SUMS.to_string(), sums),
            (DETECTED.to_string(), detected),
            (MAX_PROPORTION.to_string(), max_proportion),
        ]),
        max_index: Some(max_index),
        thresholds: BTreeMap::from([(MAX_COUNT.to_string(), count_thr)]),
        discards,
    };
    info!("CRISPR QC: {} of {n} cells fail", out.num_discarded());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn features(names: &[&str]) -> DataFrame {
        let mut df = DataFrame::new(names.len());
        df.add_column(
            "id",
            Column::Str((0..names.len()).map(|i| format!("ENSG{i}")).collect()),
        )
        .unwrap();
        df.add_column("name", Column::Str(names.iter().map(|s| s.to_string()).collect()))
            .unwrap();
        df
    }

    #[test]
    fn test_mito_rows() {
        let df = features(&["MT-CO1", "mt-Nd4l", "Actb", "MT-unknown", "mito1"]);
        assert_eq!(mito_rows(&df, true, "mt-"), vec![0, 1]);
        assert_eq!(mito_rows(&df, false, "mt-"), vec![0, 1, 3]);
        assert_eq!(mito_rows(&df, false, "MITO"), vec![4]);
        assert_eq!(mito_rows(&df, false, ""), Vec::<usize>::new());
    }

    #[test]
    fn test_rna_qc_flags_high_mito_cell() -> Result<()> {
        // row 0 is mitochondrial; the last cell is dominated by it
        let mut mito = vec![1.0; 10];
        mito[9] = 80.0;
        let other: Vec<f64> = (0..10).map(|c| 50.0 + c as f64).collect();
        let m = CountMatrix::from_dense(10, &[mito, other])?;
        let out = rna_qc(&m, &[0], None, 3.0)?;
        assert_eq!(out.thresholds[SUMS].len(), 1);
        assert!(out.discards[9]);
        assert_eq!(out.num_discarded(), 1);

        let mut g = Group::new();
        out.write(&mut g);
        assert_eq!(QcResults::read(&g)?, out);
        Ok(())
    }

    #[test]
    fn test_thresholds_per_block() -> Result<()> {
        let counts: Vec<f64> = (0..8).map(|c| if c < 4 { 10.0 } else { 1000.0 }).collect();
        let m = CountMatrix::from_dense(8, &[counts])?;
        let block = BlockFactor::new(vec![0, 0, 0, 0, 1, 1, 1, 1], vec!["a".into(), "b".into()])?;
        let blocked = rna_qc(&m, &[], Some(&block), 3.0)?;
        assert_eq!(blocked.thresholds[SUMS].len(), 2);
        assert_eq!(blocked.num_discarded(), 0);
        Ok(())
    }

    #[test]
    fn test_every_feature_detected_keeps_all_cells() -> Result<()> {
        let rows: Vec<Vec<f64>> = (0..10)
            .map(|r| (0..6).map(|c| (r + c + 1) as f64).collect())
            .collect();
        let m = CountMatrix::from_dense(6, &rows)?;
        let out = rna_qc(&m, &[], None, 3.0)?;
        assert!(out.metrics[DETECTED].iter().all(|&d| d == 10.0));
        assert!(out.thresholds[DETECTED][0] <= 10.0);
        assert_eq!(out.num_discarded(), 0);
        Ok(())
    }

    #[test]
    fn test_adt_and_crispr() -> Result<()> {
        let m = CountMatrix::from_dense(
            4,
            &[vec![10.0, 12.0, 11.0, 0.0], vec![1.0, 0.0, 2.0, 9.0], vec![0.0, 0.0, 0.0, 0.0]],
        )?;
        let adt = adt_qc(&m, &[2], None, 3.0, 0.1)?;
        assert_eq!(adt.metrics[IGG_TOTAL], vec![0.0; 4]);
        assert!(adt.thresholds[IGG_TOTAL][0].is_infinite());

        let crispr = crispr_qc(&m, None, 3.0)?;
        assert_eq!(crispr.max_index, Some(vec![0, 0, 0, 1]));
        assert_eq!(crispr.metrics[MAX_PROPORTION][3], 1.0);
        let mut g = Group::new();
        crispr.write(&mut g);
        assert_eq!(QcResults::read(&g)?, crispr);
        Ok(())
    }
}
