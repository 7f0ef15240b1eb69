//! k-means clustering of the corrected embedding.

use anyhow::Result;
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Owned, PipelineError, View};
use serde::{Deserialize, Serialize};

use crate::kmeans::kmeans;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::batch_correction::BatchCorrection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmeansClusterParams {
    pub k: usize,
}

impl Default for KmeansClusterParams {
    fn default() -> Self {
        KmeansClusterParams { k: 10 }
    }
}

#[derive(Debug, Default)]
pub struct KmeansCluster {
    status: Status,
    params: Option<KmeansClusterParams>,
    cache: Option<Owned<Vec<usize>>>,
}

impl KmeansCluster {
    pub fn new() -> Self {
        KmeansCluster::default()
    }

    /// Only clusters when `run_me` is set. Otherwise a change upstream just
    /// drops the outdated clusters.
    pub fn compute(
        &mut self,
        corrected: &BatchCorrection,
        params: KmeansClusterParams,
        run_me: bool,
    ) -> Result<()> {
        let needed = corrected.changed() || self.params.as_ref() != Some(&params);
        if !run_me {
            self.status.set_changed(false);
            if needed {
                if self.cache.take().is_some() {
                    info!("{}: dropped outdated clusters", Step::KmeansCluster);
                }
                self.params = Some(params);
                self.status.invalidate();
                self.status.set_changed(true);
            }
            return Ok(());
        }
        if !self
            .status
            .begin(Step::KmeansCluster, needed || self.cache.is_none())
        {
            return Ok(());
        }
        let embedding = corrected
            .fetch_corrected()
            .ok_or_else(|| PipelineError::state("k-means needs a corrected embedding"))?;
        let clusters = kmeans(&embedding, params.k);
        info!(
            "{}: {} clusters",
            Step::KmeansCluster,
            clusters.iter().max().map_or(0, |m| m + 1)
        );
        self.cache = Some(Owned::new(clusters));
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> KmeansClusterParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_clusters(&self) -> Option<View<Vec<usize>>> {
        self.cache.as_ref().map(Owned::view)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(clusters) = &self.cache {
            group.create_group(RESULTS).write("clusters", &clusters[..]);
        }
        Ok(())
    }

    pub fn unserialize(group: &Group) -> Result<Self> {
        let params: KmeansClusterParams = read_step_parameters(group)?;
        let mut step = KmeansCluster::new();
        if let Some(saved) = results(group) {
            if saved.contains("clusters") {
                step.cache = Some(Owned::new(saved.read("clusters")?));
                step.status = Status::restored();
            } else {
                warn!("{}: results without clusters", Step::KmeansCluster);
            }
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for KmeansCluster {
    fn step(&self) -> Step {
        Step::KmeansCluster
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
