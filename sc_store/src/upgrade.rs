//! Upgrade of documents written by older versions.
//!
//! Each transform takes a document in one legacy layout and returns it in the
//! next layout. Transforms only restructure: steps that did not exist yet are
//! added with the parameters that reproduce the old behavior and an empty
//! `results` group, and values that older versions stored in another encoding
//! are recovered where possible.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_types::PipelineError;

use crate::container::{version_parts, CURRENT_VERSION, LEGACY_THRESHOLD};
use crate::document::{Group, Node, Value};
use crate::names::*;

/// Bring a document of any supported version up to the current layout.
pub fn upgrade(version: u64, document: Group) -> Result<Group> {
    if version > CURRENT_VERSION {
        let (major, minor, patch) = version_parts(version);
        return Err(PipelineError::format(format!(
            "unsupported future version {major}.{minor}.{patch}"
        ))
        .into());
    }
    if version >= LEGACY_THRESHOLD {
        return Ok(document);
    }
    info!("upgrading state document from version {version}");
    let mut doc = document;
    if version < 1_000_000 {
        doc = from_v0(doc).context("failed to upgrade a version 0 document")?;
    }
    if version < 2_000_000 {
        doc = from_v1(doc).context("failed to upgrade a version 1 document")?;
    }
    doc = from_v2(doc).context("failed to upgrade a version 2 document")?;
    Ok(doc)
}

fn parameters(step: &Group) -> Group {
    step.group_opt(PARAMETERS).cloned().unwrap_or_default()
}

fn results(step: &Group) -> Option<Group> {
    step.group_opt(RESULTS).cloned()
}

fn step_group(params: Group, results: Option<Group>) -> Group {
    let mut step = Group::new();
    step.insert_group(PARAMETERS, params);
    if let Some(r) = results {
        step.insert_group(RESULTS, r);
    }
    step
}

/// Add a step that did not exist in the source version.
fn synthesize(doc: &mut Group, name: &str, params: Group) {
    if !doc.contains(name) {
        doc.insert_group(name, step_group(params, Some(Group::new())));
    }
}

/// Move a value between groups, wrapping scalars into one-element arrays.
fn move_as_array(from: &Group, from_name: &str, to: &mut Group, to_name: &str) {
    match from.value_opt(from_name) {
        Some(Value::Float(x)) => to.write(to_name, vec![*x]),
        Some(Value::Int(i)) => to.write(to_name, vec![*i as f64]),
        Some(v) => to.write(to_name, v.clone()),
        None => {}
    }
}

fn copy_value(from: &Group, from_name: &str, to: &mut Group, to_name: &str) {
    if let Some(v) = from.value_opt(from_name) {
        to.write(to_name, v.clone());
    }
}

/// Scheme codes of the old graph construction step.
fn recover_scheme(value: Option<&Value>) -> &'static str {
    match value {
        Some(Value::Int(1)) => "number",
        Some(Value::Int(2)) => "jaccard",
        Some(Value::Str(s)) if s == "number" => "number",
        Some(Value::Str(s)) if s == "jaccard" => "jaccard",
        Some(Value::Int(0)) | Some(Value::Str(_)) | None => "rank",
        Some(other) => {
            warn!("unrecognized SNN weighting scheme {other:?}, using rank");
            "rank"
        }
    }
}

/// Version 0 split QC and SNN clustering over several steps, called feature
/// selection `model_gene_var`, and had no k-means.
fn from_v0(mut doc: Group) -> Result<Group> {
    let metrics = doc.take_group("quality_control_metrics").unwrap_or_default();
    let thresholds = doc
        .take_group("quality_control_thresholds")
        .unwrap_or_default();
    if !metrics.is_empty() || !thresholds.is_empty() {
        let mut params = parameters(&metrics);
        copy_value(&parameters(&thresholds), "nmads", &mut params, "nmads");

        let qc_results = match (results(&metrics), results(&thresholds)) {
            (Some(m), Some(t)) => {
                let mut out = Group::new();
                let dest = out.create_group("metrics");
                copy_value(&m, "sums", dest, "sums");
                copy_value(&m, "detected", dest, "detected");
                copy_value(&m, "proportion", dest, "subset_proportion");
                let dest = out.create_group("thresholds");
                move_as_array(&t, "sums", dest, "sums");
                move_as_array(&t, "detected", dest, "detected");
                move_as_array(&t, "proportion", dest, "subset_proportion");
                copy_value(&t, "discards", &mut out, "discards");
                Some(out)
            }
            _ => None,
        };
        doc.insert_group("quality_control", step_group(params, qc_results));
    }

    doc.rename("model_gene_var", FEATURE_SELECTION);

    let find = doc.take_group("snn_find_neighbors").unwrap_or_default();
    let build = doc.take_group("snn_build_graph").unwrap_or_default();
    let cluster = doc.take_group("snn_cluster_graph").unwrap_or_default();
    if !find.is_empty() || !build.is_empty() || !cluster.is_empty() {
        let mut params = Group::new();
        copy_value(&parameters(&find), "k", &mut params, "k");
        params.write(
            "scheme",
            recover_scheme(parameters(&build).value_opt("scheme")),
        );
        copy_value(&parameters(&cluster), "resolution", &mut params, "resolution");
        params.write("algorithm", "multilevel");
        doc.insert_group(SNN_GRAPH_CLUSTER, step_group(params, results(&cluster)));
    }

    if !doc.contains(KMEANS_CLUSTER) {
        doc.insert_group(KMEANS_CLUSTER, step_group(Group::new(), None));
    }
    if !doc.contains(CHOOSE_CLUSTERING) {
        let mut params = Group::new();
        params.write("method", "snn_graph");
        doc.insert_group(CHOOSE_CLUSTERING, step_group(params, Some(Group::new())));
    }
    Ok(doc)
}

/// Version 1 was RNA-only, kept marker results under `results/clusters`, and
/// let PCA perform MNN correction itself.
fn from_v1(mut doc: Group) -> Result<Group> {
    doc.rename("quality_control", RNA_QUALITY_CONTROL);
    doc.rename("normalization", RNA_NORMALIZATION);
    doc.rename("pca", RNA_PCA);

    let mut correction = Group::new();
    correction.write("method", "none");
    if let Ok(pca_params) = doc
        .group_mut(RNA_PCA)
        .and_then(|pca| pca.group_mut(PARAMETERS))
    {
        if matches!(pca_params.value_opt("block_method"), Some(Value::Str(s)) if s == "mnn") {
            pca_params.write("block_method", "none");
            correction.write("method", "mnn");
        }
    }
    synthesize(&mut doc, BATCH_CORRECTION, correction);

    synthesize(&mut doc, ADT_QUALITY_CONTROL, Group::new());
    synthesize(&mut doc, ADT_NORMALIZATION, Group::new());
    synthesize(&mut doc, ADT_PCA, Group::new());

    let mut filtering = Group::new();
    filtering.write("use_rna", true);
    filtering.write("use_adt", false);
    synthesize(&mut doc, CELL_FILTERING, filtering);
    synthesize(&mut doc, COMBINE_EMBEDDINGS, Group::new());
    synthesize(&mut doc, CELL_LABELLING, Group::new());

    if let Ok(markers) = doc
        .group_mut(MARKER_DETECTION)
        .and_then(|m| m.group_mut(RESULTS))
    {
        if let Some(clusters) = markers.take_group("clusters") {
            markers.insert_group("RNA", clusters);
        }
    }

    if let Some(custom) = doc.take_group("custom_marker_management") {
        let params = parameters(&custom);
        let mut out = Group::new();
        let per_selection = out.create_group("per_selection");
        if let Some(markers) = results(&custom).and_then(|r| r.group_opt("markers").cloned()) {
            for (name, node) in markers.iter() {
                if let Node::Group(g) = node {
                    per_selection.create_group(name).insert_group("RNA", g.clone());
                }
            }
        }
        doc.insert_group(CUSTOM_SELECTIONS, step_group(params, Some(out)));
    }
    Ok(doc)
}

/// Version 2 had no CRISPR steps, no feature set enrichment, and stored the
/// embedding weights as a single record.
fn from_v2(mut doc: Group) -> Result<Group> {
    synthesize(&mut doc, CRISPR_QUALITY_CONTROL, Group::new());
    synthesize(&mut doc, CRISPR_NORMALIZATION, Group::new());
    synthesize(&mut doc, CRISPR_PCA, Group::new());
    synthesize(&mut doc, FEATURE_SET_ENRICHMENT, Group::new());

    if let Ok(params) = doc
        .group_mut(COMBINE_EMBEDDINGS)
        .and_then(|c| c.group_mut(PARAMETERS))
    {
        match params.take_group("weights") {
            Some(weights) => {
                for (modality, key) in [("RNA", "rna_weight"), ("ADT", "adt_weight")] {
                    copy_value(&weights, modality, params, key);
                }
            }
            None => {
                // a null record meant equal weights
                params.remove("weights");
            }
        }
    }

    if let Ok(params) = doc
        .group_mut(CELL_FILTERING)
        .and_then(|c| c.group_mut(PARAMETERS))
    {
        if !params.contains("use_crispr") {
            params.write("use_crispr", false);
        }
    }
    Ok(doc)
}
