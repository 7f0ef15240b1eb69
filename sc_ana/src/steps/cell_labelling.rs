//! Cluster labelling against reference datasets.
//!
//! Each reference is fetched and reduced to its markers in parallel on the
//! session's workers; every cluster's mean profile is then scored against
//! each reference, and with two or more references the best scoring
//! reference is picked per cluster.

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::error::check_length;
use sc_types::{DataFrame, Modality, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::session::Session;
use crate::singler::{assign_labels, build_reference, integrate};
use crate::step::{Status, Step, StepState};
use crate::steps::inputs::Inputs;
use crate::steps::marker_detection::MarkerDetection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellLabellingParams {
    /// Names resolved through the session's reference provider.
    pub references: Vec<String>,
    /// Feature annotation column matched against reference features; the
    /// first column when unset.
    pub gene_id_column: Option<String>,
    pub top_markers: usize,
    pub quantile: f64,
}

impl Default for CellLabellingParams {
    fn default() -> Self {
        CellLabellingParams {
            references: Vec::new(),
            gene_id_column: None,
            top_markers: 20,
            quantile: 0.8,
        }
    }
}

/// Labels of each cluster against one reference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceLabels {
    pub labels: Vec<String>,
    pub scores: Vec<f64>,
}

#[derive(Debug, Default, PartialEq)]
struct LabelCache {
    per_reference: BTreeMap<String, ReferenceLabels>,
    integrated: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct CellLabelling {
    status: Status,
    params: Option<CellLabellingParams>,
    /// `Some(None)` once computed for a dataset without RNA.
    cache: Option<Option<LabelCache>>,
}

/// Feature identifiers of the RNA rows, from `column` or the first column.
pub(crate) fn feature_ids(features: &DataFrame, column: Option<&str>) -> Result<Vec<String>> {
    let ids = match column {
        Some(name) => features.column(name).ok_or_else(|| {
            PipelineError::reference(format!("no feature annotation column {name:?}"))
        })?,
        None => features
            .first_column()
            .ok_or_else(|| PipelineError::reference("features have no annotation columns"))?,
    };
    Ok(ids.to_strings())
}

fn label_clusters(
    inputs: &Inputs,
    markers: &MarkerDetection,
    params: &CellLabellingParams,
    session: &Session,
) -> Result<Option<LabelCache>> {
    let (Some(scored), Some(features)) = (
        markers.fetch_results(Modality::Rna),
        inputs.fetch_features(Modality::Rna),
    ) else {
        return Ok(None);
    };
    let ids = feature_ids(features, params.gene_id_column.as_deref())?;
    let profiles: Vec<Vec<f64>> = scored.iter().map(|m| m.means.clone()).collect();
    for p in &profiles {
        check_length("cluster profile", p.len(), ids.len())?;
    }

    let assignments = session.install(|| {
        params
            .references
            .par_iter()
            .map(|name| {
                let reference = session.references().fetch(name)?;
                let built = build_reference(name, &reference, &ids, params.top_markers)
                    .with_context(|| format!("failed to build reference {name:?}"))?;
                Ok(assign_labels(&built, &profiles, params.quantile))
            })
            .collect::<Result<Vec<_>>>()
    })??;

    let integrated = (assignments.len() >= 2).then(|| integrate(&params.references, &assignments));
    let per_reference = params
        .references
        .iter()
        .cloned()
        .zip(assignments)
        .map(|(name, a)| {
            (
                name,
                ReferenceLabels {
                    labels: a.labels,
                    scores: a.best_scores,
                },
            )
        })
        .collect();
    Ok(Some(LabelCache {
        per_reference,
        integrated,
    }))
}

impl CellLabelling {
    pub fn new() -> Self {
        CellLabelling::default()
    }

    pub fn compute(
        &mut self,
        inputs: &Inputs,
        markers: &MarkerDetection,
        params: CellLabellingParams,
        session: &Session,
    ) -> Result<()> {
        let needed =
            inputs.changed() || markers.changed() || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::CellLabelling, needed) {
            return Ok(());
        }
        let labelled = label_clusters(inputs, markers, &params, session)?;
        if let Some(cache) = &labelled {
            info!(
                "cell labelling: {} clusters against {} references",
                markers.num_clusters(),
                cache.per_reference.len()
            );
        }
        self.cache = Some(labelled);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> CellLabellingParams {
        self.params.clone().unwrap_or_default()
    }

    fn computed(&self) -> Option<&LabelCache> {
        self.cache.as_ref()?.as_ref()
    }

    pub fn fetch_labels(&self, reference: &str) -> Option<&ReferenceLabels> {
        self.computed()?.per_reference.get(reference)
    }

    /// Best reference per cluster, with two or more references.
    pub fn fetch_integrated(&self) -> Option<&[String]> {
        self.computed()?.integrated.as_deref()
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(labelled) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(cache) = labelled {
                let per = out.create_group("per_reference");
                for (name, labels) in &cache.per_reference {
                    let g = per.create_group(name);
                    g.write("labels", &labels.labels[..]);
                    g.write("scores", &labels.scores[..]);
                }
                if let Some(integrated) = &cache.integrated {
                    out.write("integrated", &integrated[..]);
                }
            }
        }
        Ok(())
    }

    pub fn unserialize(group: &Group, markers: &MarkerDetection) -> Result<Self> {
        let params: CellLabellingParams = read_step_parameters(group)?;
        let mut step = CellLabelling::new();
        if let Some(saved) = results(group) {
            match saved.group_opt("per_reference") {
                Some(per) => {
                    let mut per_reference = BTreeMap::new();
                    for (name, _) in per.iter() {
                        let g = per.group(name)?;
                        let labels = ReferenceLabels {
                            labels: g.read("labels")?,
                            scores: g.read("scores")?,
                        };
                        check_length(
                            &format!("{name} label scores"),
                            labels.scores.len(),
                            labels.labels.len(),
                        )?;
                        per_reference.insert(name.to_string(), labels);
                    }
                    step.cache = Some(Some(LabelCache {
                        per_reference,
                        integrated: saved.read_opt("integrated")?,
                    }));
                    step.status = Status::restored();
                }
                None if markers.fetch_results(Modality::Rna).is_some() => {
                    warn!("cell labelling: no saved labels, will recompute");
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

impl StepState for CellLabelling {
    fn step(&self) -> Step {
        Step::CellLabelling
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
