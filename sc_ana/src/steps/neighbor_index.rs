//! Neighbor search index over the corrected embedding.

use anyhow::Result;
use log::info;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Deferred, PipelineError};
use serde::{Deserialize, Serialize};

use crate::nn::{NeighborIndex, Neighbors};
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::batch_correction::BatchCorrection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborIndexParams {
    /// Accepted for compatibility; the search is always exact.
    pub approximate: bool,
}

impl Default for NeighborIndexParams {
    fn default() -> Self {
        NeighborIndexParams { approximate: true }
    }
}

#[derive(Debug, Default)]
pub struct NeighborIndexStep {
    status: Status,
    params: Option<NeighborIndexParams>,
    cache: Option<Deferred<NeighborIndex>>,
}

fn lazy_index(corrected: &BatchCorrection) -> Result<Deferred<NeighborIndex>> {
    let embedding = corrected
        .fetch_corrected()
        .ok_or_else(|| PipelineError::state("neighbor index needs a corrected embedding"))?;
    Ok(Deferred::new(move || {
        let index = NeighborIndex::new(&embedding);
        info!(
            "neighbor index: {} cells in {} dimensions",
            index.num_cells(),
            index.num_dims()
        );
        Ok(index)
    }))
}

impl NeighborIndexStep {
    pub fn new() -> Self {
        NeighborIndexStep::default()
    }

    /// The index is built on first use.
    pub fn compute(&mut self, corrected: &BatchCorrection, params: NeighborIndexParams) -> Result<()> {
        let needed = corrected.changed() || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::NeighborIndex, needed) {
            return Ok(());
        }
        self.cache = Some(lazy_index(corrected)?);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> NeighborIndexParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_index(&self) -> Result<&NeighborIndex> {
        self.cache
            .as_ref()
            .ok_or_else(|| PipelineError::state("neighbor index has not been computed"))?
            .get()
    }

    /// The `k` nearest neighbors of every cell.
    pub fn fetch_neighbors(&self, k: usize) -> Result<Neighbors> {
        Ok(self.fetch_index()?.search(k))
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if self.cache.is_some() {
            group.create_group(RESULTS);
        }
        Ok(())
    }

    pub fn unserialize(group: &Group, corrected: &BatchCorrection) -> Result<Self> {
        let params: NeighborIndexParams = read_step_parameters(group)?;
        let mut step = NeighborIndexStep::new();
        if results(group).is_some() {
            step.cache = Some(lazy_index(corrected)?);
            step.status = Status::restored();
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for NeighborIndexStep {
    fn step(&self) -> Step {
        Step::NeighborIndex
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
    use crate::steps::batch_correction::BatchCorrectionParams;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lazy_index() -> Result<()> {
        let mut e = Pipeline::rna_only(40, 30, 4)?.embed()?;
        let mut corrected = BatchCorrection::new();
        corrected.compute(&e.pipeline.filtering, &e.combined, BatchCorrectionParams::default())?;

        let mut step = NeighborIndexStep::new();
        assert!(step.fetch_index().is_err());
        step.compute(&corrected, NeighborIndexParams::default())?;
        assert!(step.changed());
        assert!(!step.cache.as_ref().unwrap().is_ready());
        let neighbors = step.fetch_neighbors(5)?;
        assert_eq!(neighbors.num_cells(), e.pipeline.filtering.num_retained());
        assert!(neighbors.indices.iter().all(|n| n.len() == 5));

        // an unchanged upstream keeps the built index
        e.rerun()?;
        corrected.compute(&e.pipeline.filtering, &e.combined, BatchCorrectionParams::default())?;
        step.compute(&corrected, NeighborIndexParams::default())?;
        assert!(!step.changed());
        assert!(step.cache.as_ref().unwrap().is_ready());

        let mut g = Group::new();
        step.serialize(&mut g)?;
        let back = NeighborIndexStep::unserialize(&g, &corrected)?;
        assert_eq!(back.fetch_neighbors(5)?, neighbors);
        Ok(())
    }
}
