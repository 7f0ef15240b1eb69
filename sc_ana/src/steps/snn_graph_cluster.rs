//! Community detection on the shared nearest neighbor graph.

use anyhow::Result;
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Owned, View};
use serde::{Deserialize, Serialize};

use crate::louvain::{build_snn_graph, cluster_graph, Algorithm, Scheme};
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::neighbor_index::NeighborIndexStep;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnnGraphClusterParams {
    pub k: usize,
    pub scheme: Scheme,
    pub resolution: f64,
    pub algorithm: Algorithm,
}

impl Default for SnnGraphClusterParams {
    fn default() -> Self {
        SnnGraphClusterParams {
            k: 10,
            scheme: Scheme::Rank,
            resolution: 1.0,
            algorithm: Algorithm::Multilevel,
        }
    }
}

#[derive(Debug, Default)]
pub struct SnnGraphCluster {
    status: Status,
    params: Option<SnnGraphClusterParams>,
    cache: Option<Owned<Vec<usize>>>,
}

impl SnnGraphCluster {
    pub fn new() -> Self {
        SnnGraphCluster::default()
    }

    /// Only clusters when `run_me` is set. Otherwise a change upstream just
    /// drops the outdated clusters.
    pub fn compute(
        &mut self,
        index: &NeighborIndexStep,
        params: SnnGraphClusterParams,
        run_me: bool,
    ) -> Result<()> {
        let needed = index.changed() || self.params.as_ref() != Some(&params);
        if !run_me {
            self.status.set_changed(false);
            if needed {
                if self.cache.take().is_some() {
                    info!("{}: dropped outdated clusters", Step::SnnGraphCluster);
                }
                self.params = Some(params);
                self.status.invalidate();
                self.status.set_changed(true);
            }
            return Ok(());
        }
        if !self
            .status
            .begin(Step::SnnGraphCluster, needed || self.cache.is_none())
        {
            return Ok(());
        }
        let neighbors = index.fetch_neighbors(params.k)?;
        let graph = build_snn_graph(&neighbors, params.scheme);
        let clusters = cluster_graph(&graph, params.resolution, params.algorithm);
        info!(
            "{}: {} clusters from a graph of {} edges",
            Step::SnnGraphCluster,
            clusters.iter().max().map_or(0, |m| m + 1),
            graph.num_edges()
        );
        self.cache = Some(Owned::new(clusters));
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> SnnGraphClusterParams {
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
        let params: SnnGraphClusterParams = read_step_parameters(group)?;
        let mut step = SnnGraphCluster::new();
        if let Some(saved) = results(group) {
            if saved.contains("clusters") {
                step.cache = Some(Owned::new(saved.read("clusters")?));
                step.status = Status::restored();
            } else {
                warn!("{}: results without clusters", Step::SnnGraphCluster);
            }
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for SnnGraphCluster {
    fn step(&self) -> Step {
        Step::SnnGraphCluster
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
    fn test_snn_clusters_and_roundtrip() -> Result<()> {
        let mut e = Pipeline::rna_only(40, 40, 13)?.embed()?;
        let mut snn = SnnGraphCluster::new();
        snn.compute(&e.index, SnnGraphClusterParams::default(), true)?;
        let clusters = snn.fetch_clusters().unwrap();
        assert_eq!(clusters.len(), e.pipeline.filtering.num_retained());
        // labels are ordered by decreasing size, so cluster 0 exists
        assert!(clusters.contains(&0));

        e.rerun()?;
        snn.compute(&e.index, SnnGraphClusterParams::default(), true)?;
        assert!(!snn.changed());

        let jaccard = SnnGraphClusterParams {
            scheme: Scheme::Jaccard,
            ..Default::default()
        };
        snn.compute(&e.index, jaccard.clone(), true)?;
        assert!(snn.changed());

        let mut g = Group::new();
        snn.serialize(&mut g)?;
        let back = SnnGraphCluster::unserialize(&g)?;
        assert_eq!(back.fetch_parameters(), jaccard);
        assert_eq!(*back.fetch_clusters().unwrap(), *snn.fetch_clusters().unwrap());
        Ok(())
    }
}
