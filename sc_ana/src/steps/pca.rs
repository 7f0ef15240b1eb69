//! Per-modality principal components analysis.

use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::Array2;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Modality, Owned, PipelineError, View};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::pca::{run_pca, BlockMethod};
use crate::persist::{read_array2, read_step_parameters, results, write_array2, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::feature_selection::FeatureSelection;
use crate::steps::{EmbeddingSource, NormalizedSource};

/// Parameters of one modality's PCA.
pub trait PcaSettings:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync
{
    const STEP: Step;
    const MODALITY: Modality;

    fn num_pcs(&self) -> usize;

    fn block_method(&self) -> BlockMethod;

    /// Number of highly variable features to use; `None` uses every feature.
    fn num_hvgs(&self) -> Option<usize> {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnaPcaParams {
    pub num_hvgs: usize,
    pub num_pcs: usize,
    pub block_method: BlockMethod,
}

impl Default for RnaPcaParams {
    fn default() -> Self {
        RnaPcaParams {
            num_hvgs: 2000,
            num_pcs: 20,
            block_method: BlockMethod::None,
        }
    }
}

impl PcaSettings for RnaPcaParams {
    const STEP: Step = Step::RnaPca;
    const MODALITY: Modality = Modality::Rna;

    fn num_pcs(&self) -> usize {
        self.num_pcs
    }

    fn block_method(&self) -> BlockMethod {
        self.block_method
    }

    fn num_hvgs(&self) -> Option<usize> {
        Some(self.num_hvgs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdtPcaParams {
    pub num_pcs: usize,
    pub block_method: BlockMethod,
}

impl Default for AdtPcaParams {
    fn default() -> Self {
        AdtPcaParams {
            num_pcs: 20,
            block_method: BlockMethod::None,
        }
    }
}

impl PcaSettings for AdtPcaParams {
    const STEP: Step = Step::AdtPca;
    const MODALITY: Modality = Modality::Adt;

    fn num_pcs(&self) -> usize {
        self.num_pcs
    }

    fn block_method(&self) -> BlockMethod {
        self.block_method
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisprPcaParams {
    pub num_pcs: usize,
    pub block_method: BlockMethod,
}

impl Default for CrisprPcaParams {
    fn default() -> Self {
        CrisprPcaParams {
            num_pcs: 20,
            block_method: BlockMethod::None,
        }
    }
}

impl PcaSettings for CrisprPcaParams {
    const STEP: Step = Step::CrisprPca;
    const MODALITY: Modality = Modality::Crispr;

    fn num_pcs(&self) -> usize {
        self.num_pcs
    }

    fn block_method(&self) -> BlockMethod {
        self.block_method
    }
}

#[derive(Debug)]
struct PcaCache {
    /// Components × cells.
    pcs: Owned<Array2<f64>>,
    variance_explained: Vec<f64>,
}

#[derive(Debug)]
pub struct Pca<P> {
    status: Status,
    params: Option<P>,
    /// `Some(None)` once computed for a dataset without this modality.
    cache: Option<Option<PcaCache>>,
}

pub type RnaPca = Pca<RnaPcaParams>;
pub type AdtPca = Pca<AdtPcaParams>;
pub type CrisprPca = Pca<CrisprPcaParams>;

impl<P> Default for Pca<P> {
    fn default() -> Self {
        Pca {
            status: Status::default(),
            params: None,
            cache: None,
        }
    }
}

impl<P: PcaSettings> Pca<P> {
    pub fn new() -> Self {
        Pca::default()
    }

    /// `selection` is only consulted when the parameters ask for highly
    /// variable features.
    pub fn compute(
        &mut self,
        selection: &FeatureSelection,
        normalization: &dyn NormalizedSource,
        filtering: &CellFiltering,
        params: P,
    ) -> Result<()> {
        if normalization.modality() != P::MODALITY {
            return Err(PipelineError::state(format!(
                "{} was given {} normalized data",
                P::STEP,
                normalization.modality()
            ))
            .into());
        }
        let uses_selection = params.num_hvgs().is_some();
        let needed = (uses_selection && selection.changed())
            || normalization.changed()
            || filtering.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(P::STEP, needed) {
            return Ok(());
        }

        let computed = match normalization.fetch_normalized()? {
            None => None,
            Some(matrix) => {
                let rows = match params.num_hvgs() {
                    Some(n) => selection.fetch_top_features(n).ok_or_else(|| {
                        PipelineError::state(format!(
                            "{} needs feature selection results",
                            P::STEP
                        ))
                    })?,
                    None => (0..matrix.num_rows()).collect(),
                };
                let out = run_pca(
                    &matrix,
                    &rows,
                    params.num_pcs(),
                    filtering.fetch_filtered_block(),
                    params.block_method(),
                )
                .with_context(|| format!("{} failed", P::STEP))?;
                info!(
                    "{}: {} components explain {:.1}% of the variance",
                    P::STEP,
                    out.pcs.nrows(),
                    100.0 * out.variance_explained.iter().sum::<f64>()
                );
                Some(PcaCache {
                    pcs: Owned::new(out.pcs),
                    variance_explained: out.variance_explained,
                })
            }
        };
        self.cache = Some(computed);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> P {
        self.params.clone().unwrap_or_default()
    }

    fn computed(&self) -> Option<&PcaCache> {
        self.cache.as_ref()?.as_ref()
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(computed) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(c) = computed {
                write_array2(out, "pcs", &c.pcs);
                out.write("var_exp", &c.variance_explained[..]);
            }
        }
        Ok(())
    }

    pub fn unserialize(group: &Group, normalization: &dyn NormalizedSource) -> Result<Self> {
        let mut step = Pca::<P>::new();
        step.params = Some(read_step_parameters(group)?);
        let Some(saved) = results(group) else {
            return Ok(step);
        };
        if !saved.contains("pcs") {
            if normalization.fetch_lazy().is_some() {
                warn!("{}: no saved components, will recompute", P::STEP);
                return Ok(step);
            }
            step.cache = Some(None);
        } else {
            let pcs = read_array2(saved, "pcs")
                .with_context(|| format!("failed to read {} components", P::STEP))?;
            let variance_explained: Vec<f64> = saved.read("var_exp")?;
            sc_types::error::check_length(
                &format!("{} variance explained", P::STEP),
                variance_explained.len(),
                pcs.nrows(),
            )?;
            step.cache = Some(Some(PcaCache {
                pcs: Owned::new(pcs),
                variance_explained,
            }));
        }
        step.status = Status::restored();
        Ok(step)
    }
}

impl<P: PcaSettings> StepState for Pca<P> {
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

impl<P: PcaSettings> EmbeddingSource for Pca<P> {
    fn modality(&self) -> Modality {
        P::MODALITY
    }

    fn fetch_pcs(&self) -> Option<View<Array2<f64>>> {
        self.computed().map(|c| c.pcs.view())
    }

    fn fetch_variance_explained(&self) -> Option<&[f64]> {
        self.computed().map(|c| c.variance_explained.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::feature_selection::FeatureSelectionParams;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wrong_modality_is_state_error() -> Result<()> {
        let p = Pipeline::multimodal(40, 21)?;
        let mut pca = AdtPca::new();
        let err = pca
            .compute(
                &FeatureSelection::new(),
                &p.rna_norm,
                &p.filtering,
                AdtPcaParams::default(),
            )
            .unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::State(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rna_pca_and_roundtrip() -> Result<()> {
        let mut p = Pipeline::rna_only(50, 40, 9)?;
        let mut fs = FeatureSelection::new();
        fs.compute(&p.filtering, &p.rna_norm, FeatureSelectionParams::default())?;
        let mut pca = RnaPca::new();
        let params = RnaPcaParams {
            num_hvgs: 30,
            num_pcs: 5,
            ..Default::default()
        };
        pca.compute(&fs, &p.rna_norm, &p.filtering, params.clone())?;
        let pcs = pca.fetch_pcs().unwrap();
        assert_eq!(pcs.dim(), (5, p.filtering.num_retained()));

        p.rerun()?;
        fs.compute(&p.filtering, &p.rna_norm, FeatureSelectionParams::default())?;
        pca.compute(&fs, &p.rna_norm, &p.filtering, params.clone())?;
        assert!(!pca.changed());
        assert!(pcs.same_buffer(&pca.fetch_pcs().unwrap()));

        let mut g = Group::new();
        pca.serialize(&mut g)?;
        let back = RnaPca::unserialize(&g, &p.rna_norm)?;
        assert_eq!(back.fetch_parameters(), params);
        assert_eq!(*back.fetch_pcs().unwrap(), *pcs);
        assert_eq!(back.fetch_variance_explained(), pca.fetch_variance_explained());
        Ok(())
    }
}
