//! t-SNE visualization of the corrected embedding.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Owned, View};
use serde::{Deserialize, Serialize};

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::session::{AnimationFrame, Session};
use crate::step::{Status, Step, StepState};
use crate::steps::neighbor_index::NeighborIndexStep;
use crate::steps::Coordinates;
use crate::tsne::{neighbors_for_perplexity, run_tsne};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsneParams {
    pub perplexity: f64,
    pub iterations: usize,
    /// Report intermediate coordinates through the session. Does not affect
    /// the result.
    pub animate: bool,
}

impl Default for TsneParams {
    fn default() -> Self {
        TsneParams {
            perplexity: 30.0,
            iterations: 500,
            animate: false,
        }
    }
}

impl TsneParams {
    fn same_layout(&self, other: &TsneParams) -> bool {
        self.perplexity == other.perplexity && self.iterations == other.iterations
    }
}

#[derive(Debug, Default)]
pub struct Tsne {
    status: Status,
    params: Option<TsneParams>,
    cache: Option<Owned<Coordinates>>,
}

impl Tsne {
    pub fn new() -> Self {
        Tsne::default()
    }

    pub fn compute(
        &mut self,
        index: &NeighborIndexStep,
        params: TsneParams,
        session: &Session,
    ) -> Result<()> {
        let needed = index.changed()
            || self.params.as_ref().map_or(true, |p| !p.same_layout(&params));
        if !self.status.begin(Step::Tsne, needed) {
            return Ok(());
        }
        let neighbors = index.fetch_neighbors(neighbors_for_perplexity(params.perplexity))?;
        let report = |iteration: usize, x: &[f64], y: &[f64]| {
            session.animate(&AnimationFrame {
                step: Step::Tsne,
                iteration,
                x: x.to_vec(),
                y: y.to_vec(),
            });
        };
        let frame: Option<&(dyn Fn(usize, &[f64], &[f64]) + Sync)> =
            if params.animate { Some(&report) } else { None };
        let (x, y) = session
            .install(|| run_tsne(&neighbors, params.perplexity, params.iterations, frame))
            .context("failed to run t-SNE")?;
        info!("tsne: {} iterations over {} cells", params.iterations, x.len());
        self.cache = Some(Owned::new(Coordinates { x, y }));
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> TsneParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_coordinates(&self) -> Option<View<Coordinates>> {
        self.cache.as_ref().map(Owned::view)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        let params = self.fetch_parameters();
        write_step_parameters(group, &params)?;
        if let Some(coords) = &self.cache {
            let out = group.create_group(RESULTS);
            coords.write(out);
            out.write("iterations", params.iterations);
        }
        Ok(())
    }

    pub fn unserialize(group: &Group) -> Result<Self> {
        let params: TsneParams = read_step_parameters(group)?;
        let mut step = Tsne::new();
        match results(group) {
            Some(saved) if saved.contains("x") => {
                step.cache = Some(Owned::new(Coordinates::read(saved)?));
                step.status = Status::restored();
            }
            Some(_) => warn!("tsne: no saved coordinates, will recompute"),
            None => {}
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for Tsne {
    fn step(&self) -> Step {
        Step::Tsne
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
