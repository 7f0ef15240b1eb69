//! Marker detection for each cluster, in every available modality.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{BlockFactor, Modality, PipelineError, View};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use crate::markers::{score_markers, score_versus, GroupMarkers};
use crate::permute::Permuter;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::choose_clustering::ChooseClustering;
use crate::steps::{normalized_matrices, LazyMatrix, NormalizedSource};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerDetectionParams {
    pub lfc_threshold: f64,
    pub compute_auc: bool,
}

impl Default for MarkerDetectionParams {
    fn default() -> Self {
        MarkerDetectionParams {
            lfc_threshold: 0.0,
            compute_auc: true,
        }
    }
}

/// Scores pairwise comparisons on request and remembers them.
#[derive(Debug)]
pub(crate) struct VersusScorer<K> {
    matrices: BTreeMap<Modality, LazyMatrix>,
    block: Option<BlockFactor>,
    lfc_threshold: f64,
    compute_auc: bool,
    memo: Mutex<HashMap<(Modality, K), Arc<GroupMarkers>>>,
}

impl<K: Clone + Eq + Hash> VersusScorer<K> {
    pub(crate) fn new(
        normalized: &[&dyn NormalizedSource],
        block: Option<&BlockFactor>,
        lfc_threshold: f64,
        compute_auc: bool,
    ) -> Self {
        VersusScorer {
            matrices: normalized_matrices(normalized).into_iter().collect(),
            block: block.cloned(),
            lfc_threshold,
            compute_auc,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Markers of group `left` against group `right`, where `groups` assigns
    /// every cell to a group.
    pub(crate) fn score(
        &self,
        modality: Modality,
        key: K,
        groups: &[usize],
        left: usize,
        right: usize,
    ) -> Result<Arc<GroupMarkers>> {
        let memo_key = (modality, key);
        if let Some(found) = self
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&memo_key)
        {
            return Ok(Arc::clone(found));
        }
        let lazy = self.matrices.get(&modality).ok_or_else(|| {
            PipelineError::reference(format!("no normalized {modality} data to compare"))
        })?;
        let scored = Arc::new(score_versus(
            lazy.get()?,
            groups,
            left,
            right,
            self.block.as_ref(),
            self.lfc_threshold,
            self.compute_auc,
        )?);
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(memo_key, Arc::clone(&scored));
        Ok(scored)
    }
}

#[derive(Debug)]
struct MarkerCache {
    results: BTreeMap<Modality, Vec<GroupMarkers>>,
    clusters: Option<View<Vec<usize>>>,
    versus: VersusScorer<(usize, usize)>,
}

#[derive(Debug, Default)]
pub struct MarkerDetection {
    status: Status,
    params: Option<MarkerDetectionParams>,
    cache: Option<MarkerCache>,
}

fn read_modality(group: &Group, modality: Modality, permuter: &Permuter) -> Result<Vec<GroupMarkers>> {
    let mut clusters: Vec<usize> = group
        .names()
        .map(|n| {
            n.parse::<usize>()
                .map_err(|_| PipelineError::format(format!("unexpected marker group {n:?}")).into())
        })
        .collect::<Result<_>>()?;
    clusters.sort_unstable();
    if clusters.iter().enumerate().any(|(i, &c)| i != c) {
        return Err(PipelineError::format(format!("{modality} marker clusters are not contiguous")).into());
    }
    let reorder = |values: Vec<f64>| permuter.permute(modality, values);
    clusters
        .iter()
        .map(|c| GroupMarkers::read(group.group(&c.to_string())?, &reorder))
        .collect()
}

impl MarkerDetection {
    pub fn new() -> Self {
        MarkerDetection::default()
    }

    pub fn compute(
        &mut self,
        filtering: &CellFiltering,
        normalized: &[&dyn NormalizedSource],
        choose: &ChooseClustering,
        params: MarkerDetectionParams,
    ) -> Result<()> {
        let needed = filtering.changed()
            || normalized.iter().any(|n| n.changed())
            || choose.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::MarkerDetection, needed) {
            return Ok(());
        }
        let clusters = choose
            .fetch_clusters()
            .ok_or_else(|| PipelineError::state("marker detection needs a chosen clustering"))?;
        let num_clusters = choose.num_clusters();
        let block = filtering.fetch_filtered_block();
        let mut results = BTreeMap::new();
        for (modality, lazy) in normalized_matrices(normalized) {
            let scored = score_markers(
                lazy.get()?,
                &clusters,
                num_clusters,
                block,
                params.lfc_threshold,
                params.compute_auc,
            )
            .with_context(|| format!("failed to score {modality} markers"))?;
            info!(
                "marker detection: {} {} features in {} clusters",
                modality,
                scored.first().map_or(0, GroupMarkers::num_features),
                num_clusters
            );
            results.insert(modality, scored);
        }
        self.cache = Some(MarkerCache {
            results,
            clusters: Some(clusters),
            versus: VersusScorer::new(normalized, block, params.lfc_threshold, params.compute_auc),
        });
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> MarkerDetectionParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn modalities(&self) -> Vec<Modality> {
        self.cache
            .as_ref()
            .map(|c| c.results.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Per-cluster markers of one modality.
    pub fn fetch_results(&self, modality: Modality) -> Option<&[GroupMarkers]> {
        self.cache.as_ref()?.results.get(&modality).map(Vec::as_slice)
    }

    pub fn num_clusters(&self) -> usize {
        self.cache
            .as_ref()
            .and_then(|c| c.results.values().next().map(Vec::len))
            .unwrap_or(0)
    }

    /// Markers of cluster `left` against cluster `right` only. Computed on
    /// first request.
    pub fn fetch_versus(
        &self,
        modality: Modality,
        left: usize,
        right: usize,
    ) -> Result<Arc<GroupMarkers>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| PipelineError::state("marker detection has not been computed"))?;
        let clusters = cache
            .clusters
            .as_ref()
            .ok_or_else(|| PipelineError::state("no clusters to compare"))?;
        cache.versus.score(modality, (left, right), clusters, left, right)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(cache) = &self.cache {
            let out = group.create_group(RESULTS);
            for (modality, scored) in &cache.results {
                let g = out.create_group(modality.as_str());
                for (c, markers) in scored.iter().enumerate() {
                    markers.write(g.create_group(&c.to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        filtering: &CellFiltering,
        normalized: &[&dyn NormalizedSource],
        choose: &ChooseClustering,
        permuter: &Permuter,
    ) -> Result<Self> {
        let params: MarkerDetectionParams = read_step_parameters(group)?;
        let mut step = MarkerDetection::new();
        if let Some(saved) = results(group) {
            let mut results = BTreeMap::new();
            let mut complete = true;
            for (modality, _) in normalized_matrices(normalized) {
                match saved.group_opt(modality.as_str()) {
                    Some(g) => {
                        let scored = read_modality(g, modality, permuter)
                            .with_context(|| format!("failed to read {modality} markers"))?;
                        results.insert(modality, scored);
                    }
                    None => complete = false,
                }
            }
            if complete {
                step.cache = Some(MarkerCache {
                    results,
                    clusters: choose.fetch_clusters(),
                    versus: VersusScorer::new(
                        normalized,
                        filtering.fetch_filtered_block(),
                        params.lfc_threshold,
                        params.compute_auc,
                    ),
                });
                step.status = Status::restored();
            } else {
                warn!("marker detection: saved results miss a modality, will recompute");
            }
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for MarkerDetection {
    fn step(&self) -> Step {
        Step::MarkerDetection
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
    use crate::markers::{Effect, Summary};
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_markers_per_modality() -> Result<()> {
        let mut e = Pipeline::multimodal(60, 23)?.embed()?;
        let mut md = MarkerDetection::new();
        md.compute(
            &e.pipeline.filtering,
            &e.pipeline.normalized(),
            &e.choose,
            MarkerDetectionParams::default(),
        )?;
        assert_eq!(md.modalities(), vec![Modality::Rna, Modality::Adt, Modality::Crispr]);
        let rna = md.fetch_results(Modality::Rna).unwrap();
        assert_eq!(rna.len(), e.choose.num_clusters());
        assert!(rna[0].auc.is_some());
        assert_eq!(
            rna[0].effect(Effect::Cohen).unwrap().get(Summary::Mean).len(),
            rna[0].num_features()
        );

        e.rerun()?;
        md.compute(
            &e.pipeline.filtering,
            &e.pipeline.normalized(),
            &e.choose,
            MarkerDetectionParams::default(),
        )?;
        assert!(!md.changed());

        md.compute(
            &e.pipeline.filtering,
            &e.pipeline.normalized(),
            &e.choose,
            MarkerDetectionParams {
                compute_auc: false,
                ..Default::default()
            },
        )?;
        assert!(md.changed());
        assert!(md.fetch_results(Modality::Adt).unwrap()[0].auc.is_none());
        Ok(())
    }

    #[test]
    fn test_versus_is_memoized_and_roundtrip() -> Result<()> {
        let e = Pipeline::rna_only(40, 40, 29)?.embed()?;
        let mut md = MarkerDetection::new();
        md.compute(
            &e.pipeline.filtering,
            &e.pipeline.normalized(),
            &e.choose,
            MarkerDetectionParams::default(),
        )?;
        if e.choose.num_clusters() >= 2 {
            let first = md.fetch_versus(Modality::Rna, 0, 1)?;
            let again = md.fetch_versus(Modality::Rna, 0, 1)?;
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert!(md.fetch_versus(Modality::Adt, 0, 1).is_err());

        let mut g = Group::new();
        md.serialize(&mut g)?;
        let back = MarkerDetection::unserialize(
            &g,
            &e.pipeline.filtering,
            &e.pipeline.normalized(),
            &e.choose,
            &Permuter::identity(),
        )?;
        assert_eq!(back.fetch_parameters(), md.fetch_parameters());
        let (a, b) = (
            back.fetch_results(Modality::Rna).unwrap(),
            md.fetch_results(Modality::Rna).unwrap(),
        );
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            // NaN statistics of empty groups compare unequal, so compare bits
            let bits = |v: &[f64]| v.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&x.means), bits(&y.means));
            assert_eq!(bits(&x.cohen.min_rank), bits(&y.cohen.min_rank));
        }
        Ok(())
    }
}
