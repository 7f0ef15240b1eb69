//! Selection of the clustering that downstream steps use.

use anyhow::Result;
use log::warn;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{PipelineError, View};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::kmeans_cluster::KmeansCluster;
use crate::steps::snn_graph_cluster::SnnGraphCluster;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMethod {
    #[default]
    SnnGraph,
    Kmeans,
}

impl fmt::Display for ClusterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterMethod::SnnGraph => "snn_graph",
            ClusterMethod::Kmeans => "kmeans",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChooseClusteringParams {
    pub method: ClusterMethod,
}

#[derive(Debug, Default)]
pub struct ChooseClustering {
    status: Status,
    params: Option<ChooseClusteringParams>,
    cache: Option<View<Vec<usize>>>,
}

fn chosen(
    method: ClusterMethod,
    snn: &SnnGraphCluster,
    kmeans: &KmeansCluster,
) -> Option<View<Vec<usize>>> {
    match method {
        ClusterMethod::SnnGraph => snn.fetch_clusters(),
        ClusterMethod::Kmeans => kmeans.fetch_clusters(),
    }
}

impl ChooseClustering {
    pub fn new() -> Self {
        ChooseClustering::default()
    }

    /// Changed only if the method or the chosen clustering changed.
    pub fn compute(
        &mut self,
        snn: &SnnGraphCluster,
        kmeans: &KmeansCluster,
        params: ChooseClusteringParams,
    ) -> Result<()> {
        let upstream_changed = match params.method {
            ClusterMethod::SnnGraph => snn.changed(),
            ClusterMethod::Kmeans => kmeans.changed(),
        };
        let needed = upstream_changed || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::ChooseClustering, needed) {
            return Ok(());
        }
        let clusters = chosen(params.method, snn, kmeans).ok_or_else(|| {
            PipelineError::state(format!("{} clustering has not been computed", params.method))
        })?;
        self.cache = Some(clusters);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> ChooseClusteringParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_clusters(&self) -> Option<View<Vec<usize>>> {
        self.cache.clone()
    }

    pub fn num_clusters(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.iter().max().map(|m| m + 1))
            .unwrap_or(0)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if self.cache.is_some() {
            group.create_group(RESULTS);
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        snn: &SnnGraphCluster,
        kmeans: &KmeansCluster,
    ) -> Result<Self> {
        let params: ChooseClusteringParams = read_step_parameters(group)?;
        let mut step = ChooseClustering::new();
        if results(group).is_some() {
            match chosen(params.method, snn, kmeans) {
                Some(clusters) => {
                    step.cache = Some(clusters);
                    step.status = Status::restored();
                }
                None => warn!("{}: no saved {} clusters", Step::ChooseClustering, params.method),
            }
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for ChooseClustering {
    fn step(&self) -> Step {
        Step::ChooseClustering
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
    use crate::steps::kmeans_cluster::KmeansClusterParams;
    use crate::steps::snn_graph_cluster::SnnGraphClusterParams;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_switching_methods() -> Result<()> {
        let mut e = Pipeline::rna_only(40, 30, 17)?.embed()?;
        let mut snn = SnnGraphCluster::new();
        let mut km = KmeansCluster::new();
        let mut choose = ChooseClustering::new();

        snn.compute(&e.index, SnnGraphClusterParams::default(), true)?;
        km.compute(&e.corrected, KmeansClusterParams::default(), false)?;
        choose.compute(&snn, &km, ChooseClusteringParams::default())?;
        assert!(choose.changed());
        assert!(choose
            .fetch_clusters()
            .unwrap()
            .same_buffer(&snn.fetch_clusters().unwrap()));

        // k-means changing does not matter while SNN is chosen
        e.rerun()?;
        snn.compute(&e.index, SnnGraphClusterParams::default(), true)?;
        km.compute(&e.corrected, KmeansClusterParams { k: 3 }, false)?;
        assert!(km.changed());
        choose.compute(&snn, &km, ChooseClusteringParams::default())?;
        assert!(!choose.changed());

        let kmeans = ChooseClusteringParams {
            method: ClusterMethod::Kmeans,
        };
        snn.compute(&e.index, SnnGraphClusterParams::default(), false)?;
        km.compute(&e.corrected, KmeansClusterParams { k: 3 }, true)?;
        choose.compute(&snn, &km, kmeans.clone())?;
        assert!(choose.changed());
        assert!(choose
            .fetch_clusters()
            .unwrap()
            .same_buffer(&km.fetch_clusters().unwrap()));

        // switching back reuses the SNN clusters, which were never dropped
        snn.compute(&e.index, SnnGraphClusterParams::default(), true)?;
        assert!(!snn.changed());
        choose.compute(&snn, &km, ChooseClusteringParams::default())?;
        assert!(choose.changed());

        let mut g = Group::new();
        choose.serialize(&mut g)?;
        let back = ChooseClustering::unserialize(&g, &snn, &km)?;
        assert_eq!(*back.fetch_clusters().unwrap(), *snn.fetch_clusters().unwrap());
        Ok(())
    }

    #[test]
    fn test_missing_clusters_is_state_error() {
        let mut choose = ChooseClustering::new();
        let err = choose
            .compute(
                &SnnGraphCluster::new(),
                &KmeansCluster::new(),
                ChooseClusteringParams::default(),
            )
            .unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::State(_))
        ));
    }
}
