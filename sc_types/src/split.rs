//! Partition a combined matrix into per-modality sub-matrices.

use anyhow::Result;
use log::warn;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::check_length;
use crate::feature_type::{FeatureType, Modality};
use crate::frame::{Column, DataFrame};
use crate::matrix::CountMatrix;

/// Per-modality matrices, their rows in the unsplit matrix, and their
/// feature annotations.
#[derive(Debug, Default)]
pub struct SplitMatrix {
    pub matrices: BTreeMap<Modality, CountMatrix>,
    pub row_ids: BTreeMap<Modality, Vec<usize>>,
    pub features: BTreeMap<Modality, DataFrame>,
}

/// The mapping used when a caller does not supply one.
pub fn default_mapping() -> BTreeMap<FeatureType, Modality> {
    [FeatureType::Gene, FeatureType::Antibody, FeatureType::Crispr]
        .into_iter()
        .filter_map(|ft| ft.default_modality().map(|m| (ft, m)))
        .collect()
}

/// Split rows by the feature type in `type_column`.
///
/// Without a type column every row belongs to `default`. Rows whose type is
/// not in `mapping` are dropped with a warning. When a single modality
/// receives every row in order, the matrix is moved through without copying.
pub fn split_by_feature_type(
    matrix: CountMatrix,
    features: DataFrame,
    type_column: Option<&str>,
    mapping: &BTreeMap<FeatureType, Modality>,
    default: Modality,
) -> Result<SplitMatrix> {
    check_length("feature annotations", features.num_rows(), matrix.num_rows())?;
    let num_rows = matrix.num_rows();

    let types = match type_column {
        Some(name) => features.column(name).map(Column::to_strings),
        None => None,
    };

    let mut groups: BTreeMap<Modality, Vec<usize>> = BTreeMap::new();
    match types {
        None => {
            groups.insert(default, (0..num_rows).collect());
        }
        Some(types) => {
            let mut unmapped: BTreeMap<String, usize> = BTreeMap::new();
            for (row, t) in types.iter().enumerate() {
                let modality = FeatureType::from_str(t)
                    .ok()
                    .and_then(|ft| mapping.get(&ft).copied());
                match modality {
                    Some(m) => groups.entry(m).or_default().push(row),
                    None => *unmapped.entry(t.clone()).or_default() += 1,
                }
            }
            for (t, n) in unmapped {
                warn!("dropping {n} features of unmapped type {t:?}");
            }
        }
    }

    let identity = groups.len() == 1
        && groups
            .values()
            .next()
            .map_or(false, |rows| rows.len() == num_rows && rows.iter().enumerate().all(|(i, &r)| i == r));

    let mut out = SplitMatrix::default();
    if identity {
        if let Some((modality, rows)) = groups.into_iter().next() {
            out.matrices.insert(modality, matrix);
            out.features.insert(modality, features);
            out.row_ids.insert(modality, rows);
        }
        return Ok(out);
    }

    for (modality, rows) in groups {
        out.matrices.insert(modality, matrix.subset_rows(&rows)?);
        out.features.insert(modality, features.subset_rows(&rows)?);
        out.row_ids.insert(modality, rows);
    }
    Ok(out)
}
