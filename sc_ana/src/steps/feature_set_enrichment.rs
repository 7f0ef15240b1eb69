//! Over-representation of feature sets among each cluster's top markers.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Modality, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::markers::{Effect, GroupMarkers, Summary};
use crate::permute::Permuter;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::providers::FeatureSetCollection;
use crate::session::Session;
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::cell_labelling::feature_ids;
use crate::steps::inputs::Inputs;
use crate::steps::marker_detection::MarkerDetection;
use crate::steps::normalization::RnaNormalization;
use crate::steps::{LazyMatrix, NormalizedSource};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSetEnrichmentParams {
    /// Names resolved through the session's feature set provider.
    pub collections: Vec<String>,
    pub gene_id_column: Option<String>,
    pub top_markers: usize,
    pub rank_marker_type: Effect,
    pub rank_summary: Summary,
}

impl Default for FeatureSetEnrichmentParams {
    fn default() -> Self {
        FeatureSetEnrichmentParams {
            collections: Vec::new(),
            gene_id_column: None,
            top_markers: 100,
            rank_marker_type: Effect::Cohen,
            rank_summary: Summary::MinRank,
        }
    }
}

/// Enrichment of every set for one cluster, most significant first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterEnrichment {
    pub set_ids: Vec<usize>,
    /// Markers in each set.
    pub counts: Vec<usize>,
    pub pvalues: Vec<f64>,
    pub num_markers: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionEnrichment {
    /// RNA rows that map to some feature of the collection.
    pub universe: Vec<usize>,
    pub set_names: Vec<String>,
    /// RNA rows of each set's features.
    pub set_rows: Vec<Vec<usize>>,
    pub clusters: Vec<ClusterEnrichment>,
}

impl CollectionEnrichment {
    pub fn set_sizes(&self) -> Vec<usize> {
        self.set_rows.iter().map(Vec::len).collect()
    }
}

#[derive(Debug)]
struct EnrichmentCache {
    collections: BTreeMap<String, CollectionEnrichment>,
    normalized: Option<LazyMatrix>,
    scores: Mutex<HashMap<(String, usize), Arc<Vec<f64>>>>,
}

#[derive(Debug, Default)]
pub struct FeatureSetEnrichment {
    status: Status,
    params: Option<FeatureSetEnrichmentParams>,
    /// `Some(None)` once computed for a dataset without RNA.
    cache: Option<Option<EnrichmentCache>>,
}

/// Map the collection onto dataset rows.
fn reindex(
    collection: &FeatureSetCollection,
    ids: &[String],
) -> (Vec<usize>, Vec<String>, Vec<Vec<usize>>) {
    let mut position: HashMap<&str, Vec<usize>> = HashMap::new();
    for (row, id) in ids.iter().enumerate() {
        position.entry(id.as_str()).or_default().push(row);
    }
    let set_rows: Vec<Vec<usize>> = collection
        .sets
        .iter()
        .map(|set| {
            let mut rows: Vec<usize> = set
                .features
                .iter()
                .filter_map(|f| position.get(f.as_str()))
                .flatten()
                .copied()
                .collect();
            rows.sort_unstable();
            rows.dedup();
            rows
        })
        .collect();
    let mut universe: Vec<usize> = set_rows.iter().flatten().copied().collect();
    universe.sort_unstable();
    universe.dedup();
    let names = collection.sets.iter().map(|s| s.name.clone()).collect();
    (universe, names, set_rows)
}

/// Universe rows among the top `top` markers by `effect`/`summary`. Ties at
/// the cutoff are all kept.
fn select_markers(
    markers: &GroupMarkers,
    universe: &[usize],
    effect: Effect,
    summary: Summary,
    top: usize,
) -> Result<Vec<usize>> {
    let values = markers
        .effect(effect)
        .ok_or_else(|| PipelineError::reference(format!("markers have no {effect} effect sizes")))?
        .get(summary);
    if top == 0 {
        return Ok(Vec::new());
    }
    let smaller_is_better = summary == Summary::MinRank;
    let mut ranked: Vec<f64> = universe
        .iter()
        .map(|&r| values[r])
        .filter(|v| !v.is_nan())
        .collect();
    if smaller_is_better {
        ranked.sort_by(f64::total_cmp);
    } else {
        ranked.sort_by(|a, b| b.total_cmp(a));
    }
    let Some(&threshold) = ranked.get(top.min(ranked.len()).saturating_sub(1)) else {
        return Ok(Vec::new());
    };
    Ok(universe
        .iter()
        .copied()
        .filter(|&r| {
            let v = values[r];
            if smaller_is_better {
                v <= threshold
            } else if effect == Effect::Auc {
                v >= threshold && v > 0.5
            } else {
                v >= threshold
            }
        })
        .collect())
}

fn enrich_cluster(
    markers: &GroupMarkers,
    collection: &MappedCollection<'_>,
    params: &FeatureSetEnrichmentParams,
) -> Result<ClusterEnrichment> {
    let selected = select_markers(
        markers,
        collection.universe,
        params.rank_marker_type,
        params.rank_summary,
        params.top_markers,
    )?;
    let selected_set: HashSet<usize> = selected.iter().copied().collect();
    let counts: Vec<usize> = collection
        .set_rows
        .iter()
        .map(|rows| rows.iter().filter(|&&r| selected_set.contains(&r)).count())
        .collect();
    let universe_size = collection.universe.len() as u64;
    let raw: Vec<f64> = counts
        .iter()
        .zip(collection.set_rows)
        .map(|(&overlap, rows)| {
            stats::hypergeometric_upper_tail(
                overlap as u64,
                rows.len() as u64,
                universe_size,
                selected.len() as u64,
            )
        })
        .collect();
    let mut order: Vec<usize> = (0..raw.len()).collect();
    order.sort_by(|&a, &b| raw[a].total_cmp(&raw[b]).then(a.cmp(&b)));
    Ok(ClusterEnrichment {
        counts: order.iter().map(|&s| counts[s]).collect(),
        pvalues: order.iter().map(|&s| raw[s]).collect(),
        set_ids: order,
        num_markers: selected.len(),
    })
}

struct MappedCollection<'a> {
    universe: &'a [usize],
    set_rows: &'a [Vec<usize>],
}

fn enrich(
    inputs: &Inputs,
    markers: &MarkerDetection,
    params: &FeatureSetEnrichmentParams,
    session: &Session,
) -> Result<Option<BTreeMap<String, CollectionEnrichment>>> {
    let (Some(scored), Some(features)) = (
        markers.fetch_results(Modality::Rna),
        inputs.fetch_features(Modality::Rna),
    ) else {
        return Ok(None);
    };
    let ids = feature_ids(features, params.gene_id_column.as_deref())?;
    let mut out = BTreeMap::new();
    for name in &params.collections {
        let collection = session.feature_sets().fetch(name)?;
        let (universe, set_names, set_rows) = reindex(&collection, &ids);
        if universe.is_empty() {
            warn!("feature set collection {name:?} shares no features with the dataset");
        }
        let mapped = MappedCollection {
            universe: &universe,
            set_rows: &set_rows,
        };
        let clusters = scored
            .iter()
            .map(|m| enrich_cluster(m, &mapped, params))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to test feature sets of {name:?}"))?;
        info!(
            "feature set enrichment: {} sets of {name:?} over a universe of {} features",
            set_names.len(),
            universe.len()
        );
        out.insert(
            name.clone(),
            CollectionEnrichment {
                universe,
                set_names,
                set_rows,
                clusters,
            },
        );
    }
    Ok(Some(out))
}

fn read_collection(group: &Group, permuter: &Permuter) -> Result<CollectionEnrichment> {
    let remap = |rows: Vec<usize>| permuter.remap_indices(Modality::Rna, &rows);
    let set_names: Vec<String> = group.read("set_names")?;
    let rows_group = group.group("set_rows")?;
    let set_rows = (0..set_names.len())
        .map(|i| remap(rows_group.read(&i.to_string())?))
        .collect::<Result<Vec<_>>>()?;
    let clusters_group = group.group("clusters")?;
    let clusters = (0..clusters_group.names().count())
        .map(|c| -> Result<ClusterEnrichment> {
            let g = clusters_group.group(&c.to_string())?;
            Ok(ClusterEnrichment {
                set_ids: g.read("set_ids")?,
                counts: g.read("counts")?,
                pvalues: g.read("pvalues")?,
                num_markers: g.read("num_markers")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CollectionEnrichment {
        universe: remap(group.read("universe")?)?,
        set_names,
        set_rows,
        clusters,
    })
}

impl FeatureSetEnrichment {
    pub fn new() -> Self {
        FeatureSetEnrichment::default()
    }

    pub fn compute(
        &mut self,
        inputs: &Inputs,
        markers: &MarkerDetection,
        filtering: &CellFiltering,
        normalization: &RnaNormalization,
        params: FeatureSetEnrichmentParams,
        session: &Session,
    ) -> Result<()> {
        let needed = inputs.changed()
            || markers.changed()
            || filtering.changed()
            || normalization.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::FeatureSetEnrichment, needed) {
            return Ok(());
        }
        let enriched = enrich(inputs, markers, &params, session)?.map(|collections| {
            EnrichmentCache {
                collections,
                normalized: normalization.fetch_lazy(),
                scores: Mutex::new(HashMap::new()),
            }
        });
        self.cache = Some(enriched);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> FeatureSetEnrichmentParams {
        self.params.clone().unwrap_or_default()
    }

    fn computed(&self) -> Option<&EnrichmentCache> {
        self.cache.as_ref()?.as_ref()
    }

    pub fn fetch_collection(&self, name: &str) -> Option<&CollectionEnrichment> {
        self.computed()?.collections.get(name)
    }

    /// Mean log-expression of a set's features in every cell. Computed on
    /// first request.
    pub fn fetch_set_scores(&self, collection: &str, set: usize) -> Result<Arc<Vec<f64>>> {
        let cache = self
            .computed()
            .ok_or_else(|| PipelineError::state("feature set enrichment has not been computed"))?;
        let key = (collection.to_string(), set);
        if let Some(found) = cache
            .scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(found));
        }
        let rows = cache
            .collections
            .get(collection)
            .and_then(|c| c.set_rows.get(set))
            .ok_or_else(|| {
                PipelineError::reference(format!("no set {set} in collection {collection:?}"))
            })?;
        let matrix = cache
            .normalized
            .as_ref()
            .ok_or_else(|| PipelineError::state("no normalized RNA data to score"))?
            .get()?;
        let mut totals = vec![0.0; matrix.num_columns()];
        for &r in rows {
            let (cells, values) = matrix.row(r);
            for (&c, &v) in cells.iter().zip(values) {
                totals[c] += v;
            }
        }
        if !rows.is_empty() {
            let n = rows.len() as f64;
            totals.iter_mut().for_each(|t| *t /= n);
        }
        let scores = Arc::new(totals);
        cache
            .scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&scores));
        Ok(scores)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(enriched) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(cache) = enriched {
                let all = out.create_group("collections");
                for (name, c) in &cache.collections {
                    let g = all.create_group(name);
                    g.write("universe", &c.universe[..]);
                    g.write("set_names", &c.set_names[..]);
                    g.write("set_sizes", &c.set_sizes()[..]);
                    let rows = g.create_group("set_rows");
                    for (i, r) in c.set_rows.iter().enumerate() {
                        rows.write(&i.to_string(), &r[..]);
                    }
                    let clusters = g.create_group("clusters");
                    for (i, e) in c.clusters.iter().enumerate() {
                        let cg = clusters.create_group(&i.to_string());
                        cg.write("set_ids", &e.set_ids[..]);
                        cg.write("counts", &e.counts[..]);
                        cg.write("pvalues", &e.pvalues[..]);
                        cg.write("num_markers", e.num_markers);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        markers: &MarkerDetection,
        normalization: &RnaNormalization,
        permuter: &Permuter,
    ) -> Result<Self> {
        let params: FeatureSetEnrichmentParams = read_step_parameters(group)?;
        let mut step = FeatureSetEnrichment::new();
        if let Some(saved) = results(group) {
            match saved.group_opt("collections") {
                Some(all) => {
                    let mut collections = BTreeMap::new();
                    for name in all.names() {
                        let c = read_collection(all.group(name)?, permuter)
                            .with_context(|| format!("failed to read enrichment of {name:?}"))?;
                        collections.insert(name.to_string(), c);
                    }
                    step.cache = Some(Some(EnrichmentCache {
                        collections,
                        normalized: normalization.fetch_lazy(),
                        scores: Mutex::new(HashMap::new()),
                    }));
                    step.status = Status::restored();
                }
                None if markers.fetch_results(Modality::Rna).is_some() => {
                    warn!("feature set enrichment: no saved results, will recompute");
                }
                None => {
                    step.cache = Some(None);
                    step.status = Status::restored();
                }
            }
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for FeatureSetEnrichment {
    fn step(&self) -> Step {
        Step::FeatureSetEnrichment
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
