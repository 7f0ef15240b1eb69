//! Removal of block effects from the combined embedding.

use anyhow::{Context, Result};
use log::info;
use ndarray::Array2;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::error::check_length;
use sc_types::{BlockFactor, Owned, PipelineError, Shared, View};
use serde::{Deserialize, Serialize};

use crate::mnn::mnn_correct;
use crate::persist::{read_array2, read_step_parameters, results, write_array2, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::combine_embeddings::CombineEmbeddings;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    /// Mutual nearest neighbors.
    #[default]
    Mnn,
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchCorrectionParams {
    pub method: CorrectionMethod,
    pub num_neighbors: usize,
    pub approximate: bool,
}

impl Default for BatchCorrectionParams {
    fn default() -> Self {
        BatchCorrectionParams {
            method: CorrectionMethod::Mnn,
            num_neighbors: 15,
            approximate: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchCorrection {
    status: Status,
    params: Option<BatchCorrectionParams>,
    cache: Option<Shared<Array2<f64>>>,
}

/// The embedding itself unless there is more than one block to merge.
fn correct(
    embedding: View<Array2<f64>>,
    block: Option<&BlockFactor>,
    params: &BatchCorrectionParams,
) -> Result<Shared<Array2<f64>>> {
    let block = match (params.method, block) {
        (CorrectionMethod::Mnn, Some(b)) if b.num_levels() > 1 => b,
        _ => return Ok(Shared::View(embedding)),
    };
    check_length("block factor", block.len(), embedding.ncols())?;
    let corrected = mnn_correct(&embedding, block, params.num_neighbors);
    info!(
        "batch correction: merged {} blocks over {} cells",
        block.num_levels(),
        corrected.ncols()
    );
    Ok(Shared::Owned(Owned::new(corrected)))
}

fn combined_embedding(combined: &CombineEmbeddings) -> Result<View<Array2<f64>>> {
    combined
        .fetch_combined()
        .ok_or_else(|| PipelineError::state("batch correction needs a combined embedding").into())
}

impl BatchCorrection {
    pub fn new() -> Self {
        BatchCorrection::default()
    }

    pub fn compute(
        &mut self,
        filtering: &CellFiltering,
        combined: &CombineEmbeddings,
        params: BatchCorrectionParams,
    ) -> Result<()> {
        let needed = filtering.changed()
            || combined.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::BatchCorrection, needed) {
            return Ok(());
        }
        let embedding = combined_embedding(combined)?;
        self.cache = Some(correct(embedding, filtering.fetch_filtered_block(), &params)?);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> BatchCorrectionParams {
        self.params.clone().unwrap_or_default()
    }

    /// Corrected embedding, components × cells.
    pub fn fetch_corrected(&self) -> Option<View<Array2<f64>>> {
        self.cache.as_ref().map(Shared::view)
    }

    pub fn is_corrected(&self) -> bool {
        self.cache.as_ref().map_or(false, |c| !c.is_view())
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(cache) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(owned) = cache.as_owned() {
                write_array2(out, "corrected", owned);
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        filtering: &CellFiltering,
        combined: &CombineEmbeddings,
    ) -> Result<Self> {
        let params: BatchCorrectionParams = read_step_parameters(group)?;
        let mut step = BatchCorrection::new();
        if let Some(saved) = results(group) {
            step.cache = Some(if saved.contains("corrected") {
                let corrected =
                    read_array2(saved, "corrected").context("failed to read corrected embedding")?;
                Shared::Owned(Owned::new(corrected))
            } else {
                correct(
                    combined_embedding(combined)?,
                    filtering.fetch_filtered_block(),
                    &params,
                )?
            });
            step.status = Status::restored();
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for BatchCorrection {
    fn step(&self) -> Step {
        Step::BatchCorrection
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unblocked_is_a_view() -> Result<()> {
        let e = Pipeline::rna_only(40, 30, 2)?.embed()?;
        let mut step = BatchCorrection::new();
        step.compute(&e.pipeline.filtering, &e.combined, BatchCorrectionParams::default())?;
        assert!(!step.is_corrected());
        assert!(step
            .fetch_corrected()
            .unwrap()
            .same_buffer(&e.combined.fetch_combined().unwrap()));
        Ok(())
    }

    #[test]
    fn test_mnn_with_blocks_and_roundtrip() -> Result<()> {
        let e = Pipeline::batched(40, 20, 6)?.embed()?;
        let mut step = BatchCorrection::new();
        step.compute(&e.pipeline.filtering, &e.combined, BatchCorrectionParams::default())?;
        assert!(step.is_corrected());
        let corrected = step.fetch_corrected().unwrap();
        assert_eq!(corrected.dim(), e.combined.fetch_combined().unwrap().dim());

        let mut g = Group::new();
        step.serialize(&mut g)?;
        let back = BatchCorrection::unserialize(&g, &e.pipeline.filtering, &e.combined)?;
        assert_eq!(*back.fetch_corrected().unwrap(), *corrected);

        let mut none = BatchCorrection::new();
        none.compute(
            &e.pipeline.filtering,
            &e.combined,
            BatchCorrectionParams {
                method: CorrectionMethod::None,
                ..Default::default()
            },
        )?;
        assert!(!none.is_corrected());
        let mut g = Group::new();
        none.serialize(&mut g)?;
        assert!(g.group(RESULTS)?.is_empty());
        Ok(())
    }
}
