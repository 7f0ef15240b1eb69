//! Per-modality log-normalization of the filtered counts.

use anyhow::{Context, Result};
use log::info;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{BlockFactor, CountMatrix, Deferred, Modality, Owned, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::normalize::{center_size_factors, grouped_size_factors, log_normalize};
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::quality_control::{
    AdtQcParams, CrisprQcParams, QcSettings, QualityControl, RnaQcParams,
};
use crate::steps::{LazyMatrix, NormalizedSource};

/// Parameters of one modality's normalization, and its size factors.
pub trait NormSettings:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const STEP: Step;
    const MODALITY: Modality;
    type Qc: QcSettings;

    fn size_factors(&self, matrix: &CountMatrix) -> Result<Vec<f64>>;
}

/// Center size factors separately within each block.
fn center_by_block(factors: &[f64], block: Option<&BlockFactor>) -> Vec<f64> {
    match block {
        None => center_size_factors(factors),
        Some(b) => {
            let mut out = vec![1.0; factors.len()];
            for cells in b.groups() {
                let sub: Vec<f64> = cells.iter().map(|&c| factors[c]).collect();
                for (&c, f) in cells.iter().zip(center_size_factors(&sub)) {
                    out[c] = f;
                }
            }
            out
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnaNormalizationParams {}

impl NormSettings for RnaNormalizationParams {
    const STEP: Step = Step::RnaNormalization;
    const MODALITY: Modality = Modality::Rna;
    type Qc = RnaQcParams;

    fn size_factors(&self, matrix: &CountMatrix) -> Result<Vec<f64>> {
        Ok(matrix.column_sums())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdtNormalizationParams {
    /// Principal components of the first-pass clustering.
    pub num_pcs: usize,
    pub num_clusters: usize,
}

impl Default for AdtNormalizationParams {
    fn default() -> Self {
        AdtNormalizationParams {
            num_pcs: 25,
            num_clusters: 20,
        }
    }
}

impl NormSettings for AdtNormalizationParams {
    const STEP: Step = Step::AdtNormalization;
    const MODALITY: Modality = Modality::Adt;
    type Qc = AdtQcParams;

    fn size_factors(&self, matrix: &CountMatrix) -> Result<Vec<f64>> {
        grouped_size_factors(matrix, self.num_pcs, self.num_clusters)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisprNormalizationParams {}

impl NormSettings for CrisprNormalizationParams {
    const STEP: Step = Step::CrisprNormalization;
    const MODALITY: Modality = Modality::Crispr;
    type Qc = CrisprQcParams;

    fn size_factors(&self, matrix: &CountMatrix) -> Result<Vec<f64>> {
        Ok(matrix.column_sums())
    }
}

#[derive(Debug)]
pub struct Normalization<P> {
    status: Status,
    params: Option<P>,
    /// `Some(None)` once computed for a dataset without this modality.
    cache: Option<Option<LazyMatrix>>,
}

pub type RnaNormalization = Normalization<RnaNormalizationParams>;
pub type AdtNormalization = Normalization<AdtNormalizationParams>;
pub type CrisprNormalization = Normalization<CrisprNormalizationParams>;

impl<P> Default for Normalization<P> {
    fn default() -> Self {
        Normalization {
            status: Status::default(),
            params: None,
            cache: None,
        }
    }
}

fn lazy_normalize<P: NormSettings>(filtering: &CellFiltering, params: &P) -> Option<LazyMatrix> {
    let filtered = filtering.fetch_filtered_matrix(P::MODALITY)?;
    let block = filtering.fetch_filtered_block().cloned();
    let params = params.clone();
    Some(Deferred::new(move || {
        let matrix = filtered.get()?;
        let raw = params
            .size_factors(matrix)
            .with_context(|| format!("failed to compute {} size factors", P::MODALITY))?;
        let factors = center_by_block(&raw, block.as_ref());
        let normalized = log_normalize(matrix, &factors)?;
        info!(
            "{}: log-normalized {} features in {} cells",
            P::STEP,
            normalized.num_rows(),
            normalized.num_columns()
        );
        Ok(Shared::Owned(Owned::new(normalized)))
    }))
}

impl<P: NormSettings> Normalization<P> {
    pub fn new() -> Self {
        Normalization::default()
    }

    /// The matrix itself is built on first access.
    pub fn compute(
        &mut self,
        qc: &QualityControl<P::Qc>,
        filtering: &CellFiltering,
        params: P,
    ) -> Result<()> {
        let needed =
            qc.changed() || filtering.changed() || self.params.as_ref() != Some(&params);
        if !self.status.begin(P::STEP, needed) {
            return Ok(());
        }
        self.cache = Some(lazy_normalize(filtering, &params));
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> P {
        self.params.clone().unwrap_or_default()
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if self.cache.is_some() {
            group.create_group(RESULTS);
        }
        Ok(())
    }

    /// Nothing is stored; the matrix is rebuilt lazily from the filtered
    /// counts.
    pub fn unserialize(group: &Group, filtering: &CellFiltering) -> Result<Self> {
        let params: P = read_step_parameters(group)?;
        let mut step = Normalization::new();
        if results(group).is_some() {
            step.cache = Some(lazy_normalize(filtering, &params));
            step.status = Status::restored();
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl<P: NormSettings> StepState for Normalization<P> {
    fn step(&self) -> Step {
        P::STEP
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}

impl<P: NormSettings> NormalizedSource for Normalization<P> {
    fn modality(&self) -> Modality {
        P::MODALITY
    }

    fn fetch_lazy(&self) -> Option<LazyMatrix> {
        self.cache.clone().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_center_by_block() {
        let block = BlockFactor::new(vec![0, 0, 1, 1], vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(
            center_by_block(&[1.0, 3.0, 10.0, 30.0], Some(&block)),
            vec![0.5, 1.5, 0.5, 1.5]
        );
        assert_eq!(center_by_block(&[2.0, 0.0, 6.0], None), vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_lazy_normalization() -> Result<()> {
        let mut p = Pipeline::multimodal(40, 5)?;
        let mut norm = AdtNormalization::new();
        norm.compute(&p.adt_qc, &p.filtering, AdtNormalizationParams::default())?;
        assert!(norm.changed());
        let lazy = norm.fetch_lazy().unwrap();
        assert!(!lazy.is_ready());
        let first = norm.fetch_normalized()?.unwrap();
        assert_eq!(first.num_columns(), p.filtering.num_retained());

        p.rerun()?;
        norm.compute(&p.adt_qc, &p.filtering, AdtNormalizationParams::default())?;
        assert!(!norm.changed());
        assert!(first.same_buffer(&norm.fetch_normalized()?.unwrap()));

        let mut g = Group::new();
        norm.serialize(&mut g)?;
        let back = AdtNormalization::unserialize(&g, &p.filtering)?;
        assert_eq!(back.fetch_parameters(), AdtNormalizationParams::default());
        assert_eq!(*back.fetch_normalized()?.unwrap(), *first);
        Ok(())
    }
}
