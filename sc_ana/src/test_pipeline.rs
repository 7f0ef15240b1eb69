//! End-to-end scenarios over the full step graph

use anyhow::Result;
use pretty_assertions::assert_eq;
use sc_store::names::*;
use sc_store::{read_container, write_container, ExtractToDirectory, Group, Storage};
use sc_types::{Dataset, DatasetRegistry, Modality};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::analysis::*;
use crate::config::AnalysisParameters;
use crate::io::export_analysis;
use crate::session::Session;
use crate::step::{Step, StepState};
use crate::steps::quality_control::CrisprQcParams;
use crate::steps::{
    AdtPcaParams, CellFilteringParams, CellLabellingParams, CellSubset, ClusterMethod,
    CorrectionMethod, CrisprPcaParams, DatasetMap, FeatureSetEnrichmentParams,
    KmeansClusterParams,
};
use crate::testing::{
    batched_dataset, memory_dataset, multimodal_memory_dataset, write_matrix_market,
    NUM_CLUSTERS,
};

fn session() -> Arc<Session> {
    Arc::new(Session::builder().num_threads(2).build().unwrap())
}

fn params() -> AnalysisParameters {
    let mut params = AnalysisParameters::default();
    params.rna_pca.num_hvgs = 30;
    params.rna_pca.num_pcs = 5;
    params.adt_pca.num_pcs = 5;
    params.crispr_pca.num_pcs = 3;
    params.tsne.perplexity = 5.0;
    params.tsne.iterations = 50;
    params.umap.num_epochs = 50;
    params.kmeans_cluster.k = NUM_CLUSTERS;
    params
}

fn one(name: &str, dataset: impl Dataset + 'static) -> DatasetMap {
    BTreeMap::from([(name.to_string(), Arc::new(dataset) as Arc<dyn Dataset>)])
}

fn run_fresh(datasets: &DatasetMap, params: &AnalysisParameters) -> Result<Analysis> {
    let mut analysis = create_analysis(session())?;
    run_analysis(&mut analysis, Some(datasets), params, &NoopObserver)?;
    Ok(analysis)
}

#[test]
fn test_switch_clustering() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = write_matrix_market(&memory_dataset(30, 60, 101), dir.path(), "rna")?;
    let mut params = params();
    let mut analysis = run_fresh(&one("main", dataset), &params)?;
    let snn_clusters = analysis.choose_clustering.fetch_clusters().unwrap().to_vec();

    // only the chosen method has results in the saved state
    let path = dir.path().join("snn.sca");
    save_analysis(&analysis, &path, false)?;
    let summary = inspect_container(&path)?;
    let clustering: Vec<(String, bool)> = summary
        .steps
        .into_iter()
        .filter(|(step, _)| step.ends_with("_cluster"))
        .collect();
    assert_eq!(
        clustering,
        vec![
            ("kmeans_cluster".to_string(), false),
            ("snn_graph_cluster".to_string(), true)
        ]
    );

    params.choose_clustering.method = ClusterMethod::Kmeans;
    run_analysis(&mut analysis, None, &params, &NoopObserver)?;
    let changed = analysis.changed_steps();
    for step in [Step::KmeansCluster, Step::ChooseClustering, Step::MarkerDetection] {
        assert!(changed.contains(&step), "{step} should have changed");
    }
    for step in [Step::Tsne, Step::Umap, Step::SnnGraphCluster, Step::RnaPca] {
        assert!(!changed.contains(&step), "{step} should not have changed");
    }
    assert!(analysis.kmeans_cluster.fetch_clusters().is_some());
    assert!(analysis.snn_graph_cluster.fetch_clusters().is_some());

    // the graph clusters are still cached
    params.choose_clustering.method = ClusterMethod::SnnGraph;
    run_analysis(&mut analysis, None, &params, &NoopObserver)?;
    assert!(!analysis.snn_graph_cluster.changed());
    assert!(!analysis.kmeans_cluster.changed());
    assert_eq!(
        analysis.choose_clustering.fetch_clusters().unwrap().to_vec(),
        snn_clusters
    );

    // with k-means active, the graph clustering recomputes alone
    params.choose_clustering.method = ClusterMethod::Kmeans;
    run_analysis(&mut analysis, None, &params, &NoopObserver)?;
    assert!(!analysis.kmeans_cluster.changed());
    params.snn_graph_cluster.resolution = 0.5;
    run_analysis(&mut analysis, None, &params, &NoopObserver)?;
    assert_eq!(analysis.changed_steps(), vec![Step::SnnGraphCluster]);
    assert!(analysis.kmeans_cluster.fetch_clusters().is_some());
    Ok(())
}

#[test]
fn test_subset_reuses_loaded_data() -> Result<()> {
    let dataset = memory_dataset(30, 60, 102);
    let loads = dataset.load_counter();
    let datasets = one("main", dataset);
    let params = params();
    let analysis = run_fresh(&datasets, &params)?;
    assert_eq!(loads.get(), 1);

    let keep: Vec<usize> = (0..60).step_by(2).collect();
    let mut subset = subset_inputs(&analysis, &keep, false)?;
    assert_eq!(subset.inputs.num_cells(), 30);
    assert_eq!(analysis.inputs.num_cells(), 60);
    assert_eq!(subset.changed_steps(), Vec::<Step>::new());

    run_analysis(&mut subset, None, &params, &NoopObserver)?;
    assert_eq!(loads.get(), 1);
    assert_eq!(subset.inputs.fetch_cell_indices(), Some(&keep[..]));
    assert_eq!(subset.changed_steps().len(), 24);

    // positions relative to the subset compose with it
    let nested = subset_inputs(&subset, &[0, 1], false)?;
    assert_eq!(nested.inputs.fetch_cell_indices(), Some(&[0, 2][..]));
    assert!(subset_inputs(&subset, &[30], false).is_err());
    Ok(())
}

#[test]
fn test_typed_features_split_into_modalities() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = write_matrix_market(&multimodal_memory_dataset(50, 103), dir.path(), "multi")?;
    let analysis = run_fresh(&one("main", dataset), &params())?;

    let rows = |m| analysis.inputs.fetch_matrix(m).map(|x| x.num_rows());
    assert_eq!(rows(Modality::Rna), Some(30));
    assert_eq!(rows(Modality::Adt), Some(8));
    assert_eq!(rows(Modality::Crispr), Some(4));

    let clusters = analysis.marker_detection.num_clusters();
    for modality in Modality::ALL {
        let markers = analysis.marker_detection.fetch_results(modality).unwrap();
        assert_eq!(markers.len(), clusters);
    }
    assert!(analysis.combine_embeddings.fetch_combined().is_some());
    Ok(())
}

#[test]
fn test_batches_are_corrected() -> Result<()> {
    let analysis = run_fresh(&batched_dataset(30, 40, 104), &params())?;
    assert_eq!(analysis.inputs.num_cells(), 80);
    let block = analysis.cell_filtering.fetch_filtered_block().unwrap();
    assert_eq!(block.num_levels(), 2);
    let corrected = analysis.batch_correction.fetch_corrected().unwrap();
    assert_eq!(corrected.nrows(), analysis.cell_filtering.num_retained());
    Ok(())
}

fn save_and_reload(analysis: &Analysis, dir: &Path, embed: bool) -> Result<Analysis> {
    let path = dir.join(if embed { "embedded.sca" } else { "linked.sca" });
    save_analysis(analysis, &path, embed)?;
    let summary = inspect_container(&path)?;
    assert_eq!(summary.embedded, embed);
    assert!(summary
        .steps
        .iter()
        .any(|(step, has_results)| step == "tsne" && *has_results));

    let mut resolver = ExtractToDirectory::new(dir.join("extracted"));
    load_analysis(&path, session(), &DatasetRegistry::default(), &mut resolver)
}

#[test]
fn test_save_and_load() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = write_matrix_market(&memory_dataset(30, 60, 105), dir.path(), "rna")?;
    let mut params = params();
    params.custom_selections.selections = BTreeMap::from([("first".to_string(), vec![0, 1, 2])]);
    let analysis = run_fresh(&one("main", dataset), &params)?;

    for embed in [false, true] {
        let mut back = save_and_reload(&analysis, dir.path(), embed)?;
        assert!(back.is_reloaded());
        assert_eq!(retrieve_parameters(&back), params);
        assert_eq!(
            back.choose_clustering.fetch_clusters().unwrap().to_vec(),
            analysis.choose_clustering.fetch_clusters().unwrap().to_vec()
        );
        assert_eq!(
            *back.tsne.fetch_coordinates().unwrap(),
            *analysis.tsne.fetch_coordinates().unwrap()
        );
        assert_eq!(
            back.custom_selections
                .fetch_results("first", Modality::Rna)
                .map(|m| m.means.clone()),
            analysis
                .custom_selections
                .fetch_results("first", Modality::Rna)
                .map(|m| m.means.clone())
        );

        // the first run after loading starts from the inputs
        run_analysis(&mut back, None, &params, &NoopObserver)?;
        assert!(back.changed_steps().contains(&Step::Inputs));
        assert!(!back.is_reloaded());
        run_analysis(&mut back, None, &params, &NoopObserver)?;
        assert_eq!(back.changed_steps(), Vec::<Step>::new());
    }
    Ok(())
}

#[test]
fn test_saved_subsets_can_be_changed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = write_matrix_market(&memory_dataset(30, 60, 107), dir.path(), "rna")?;
    let mut params = params();
    params.inputs.subset = Some(CellSubset::Indices((0..40).collect()));
    let analysis = run_fresh(&one("main", dataset), &params)?;
    assert_eq!(analysis.inputs.num_cells(), 40);

    let mut back = save_and_reload(&analysis, dir.path(), false)?;
    assert_eq!(retrieve_parameters(&back), params);
    params.inputs.subset = None;
    run_analysis(&mut back, None, &params, &NoopObserver)?;
    assert_eq!(back.inputs.num_cells(), 60);

    // a subset taken from the analysis survives a reload and overrides the parameter
    let keep: Vec<usize> = (0..60).step_by(3).collect();
    let mut subset = subset_inputs(&back, &keep, false)?;
    run_analysis(&mut subset, None, &params, &NoopObserver)?;
    let mut back = save_and_reload(&subset, dir.path(), true)?;
    assert_eq!(retrieve_parameters(&back), params);
    run_analysis(&mut back, None, &params, &NoopObserver)?;
    assert_eq!(back.inputs.fetch_cell_indices(), Some(&keep[..]));
    Ok(())
}

/// Stamp a linked container with an older version code. The version field
/// follows the storage flag in the preamble.
fn write_legacy(path: &Path, doc: &Group, version: u64) -> Result<()> {
    write_container(path, doc, Storage::Linked, &[])?;
    let mut bytes = std::fs::read(path)?;
    bytes[8..16].copy_from_slice(&version.to_le_bytes());
    std::fs::write(path, bytes)?;
    Ok(())
}

/// The version 1 layout of an RNA-only document: unprefixed RNA steps,
/// markers under `clusters`, and none of the steps added since.
fn to_v1_layout(mut doc: Group) -> Group {
    for step in [
        ADT_QUALITY_CONTROL,
        ADT_NORMALIZATION,
        ADT_PCA,
        CRISPR_QUALITY_CONTROL,
        CRISPR_NORMALIZATION,
        CRISPR_PCA,
        CELL_FILTERING,
        COMBINE_EMBEDDINGS,
        BATCH_CORRECTION,
        CELL_LABELLING,
        FEATURE_SET_ENRICHMENT,
    ] {
        doc.remove(step);
    }
    doc.rename(RNA_QUALITY_CONTROL, "quality_control");
    doc.rename(RNA_NORMALIZATION, "normalization");
    doc.rename(RNA_PCA, "pca");
    if let Ok(markers) = doc
        .group_mut(MARKER_DETECTION)
        .and_then(|m| m.group_mut(RESULTS))
    {
        markers.rename("RNA", "clusters");
    }
    doc.rename(CUSTOM_SELECTIONS, "custom_marker_management");
    doc
}

fn copy(from: Option<&Group>, name: &str, to: &mut Group, as_name: &str) {
    if let Some(v) = from.and_then(|g| g.value_opt(name)) {
        to.write(as_name, v.clone());
    }
}

/// The version 0 layout: QC and SNN clustering split over several steps, and
/// no k-means.
fn to_v0_layout(doc: Group) -> Group {
    let mut doc = to_v1_layout(doc);
    let qc = doc.take_group("quality_control").unwrap_or_default();
    let qc_params = qc.group_opt(PARAMETERS).cloned().unwrap_or_default();
    let qc_results = qc.group_opt(RESULTS).cloned().unwrap_or_default();
    let metrics = doc.create_group("quality_control_metrics");
    metrics.insert_group(PARAMETERS, qc_params.clone());
    let out = metrics.create_group(RESULTS);
    let saved = qc_results.group_opt("metrics");
    copy(saved, "sums", out, "sums");
    copy(saved, "detected", out, "detected");
    copy(saved, "subset_proportion", out, "proportion");

    let thresholds = doc.create_group("quality_control_thresholds");
    copy(Some(&qc_params), "nmads", thresholds.create_group(PARAMETERS), "nmads");
    let out = thresholds.create_group(RESULTS);
    let saved = qc_results.group_opt("thresholds");
    copy(saved, "sums", out, "sums");
    copy(saved, "detected", out, "detected");
    copy(saved, "subset_proportion", out, "proportion");
    copy(Some(&qc_results), "discards", out, "discards");

    doc.rename(FEATURE_SELECTION, "model_gene_var");
    let snn = doc.take_group(SNN_GRAPH_CLUSTER).unwrap_or_default();
    let snn_params = snn.group_opt(PARAMETERS).cloned().unwrap_or_default();
    copy(
        Some(&snn_params),
        "k",
        doc.create_group("snn_find_neighbors").create_group(PARAMETERS),
        "k",
    );
    doc.create_group("snn_build_graph")
        .create_group(PARAMETERS)
        .write("scheme", 0i64);
    let cluster = doc.create_group("snn_cluster_graph");
    copy(Some(&snn_params), "resolution", cluster.create_group(PARAMETERS), "resolution");
    if let Some(results) = snn.group_opt(RESULTS) {
        cluster.insert_group(RESULTS, results.clone());
    }
    doc.remove(KMEANS_CLUSTER);
    doc.remove(CHOOSE_CLUSTERING);
    doc
}

#[test]
fn test_legacy_containers_load_with_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = write_matrix_market(&memory_dataset(30, 60, 108), dir.path(), "rna")?;
    let params = params();
    let analysis = run_fresh(&one("main", dataset), &params)?;
    let current = dir.path().join("current.sca");
    save_analysis(&analysis, &current, false)?;
    let doc = read_container(&current)?.document;

    for (version, legacy) in [
        (1_002_000, to_v1_layout(doc.clone())),
        (0, to_v0_layout(doc.clone())),
    ] {
        let path = dir.path().join(format!("legacy-{version}.sca"));
        write_legacy(&path, &legacy, version)?;
        let mut resolver = ExtractToDirectory::new(dir.path().join("extracted"));
        let mut back = load_analysis(&path, session(), &DatasetRegistry::default(), &mut resolver)?;
        assert!(back.is_reloaded());

        let restored = retrieve_parameters(&back);
        assert_eq!(restored.rna_quality_control, params.rna_quality_control);
        assert_eq!(restored.rna_pca, params.rna_pca);
        assert_eq!(restored.snn_graph_cluster, params.snn_graph_cluster);
        assert_eq!(restored.tsne, params.tsne);
        assert_eq!(restored.cell_labelling, CellLabellingParams::default());
        assert_eq!(restored.adt_pca, AdtPcaParams::default());
        assert_eq!(restored.crispr_quality_control, CrisprQcParams::default());
        assert_eq!(restored.crispr_pca, CrisprPcaParams::default());
        assert_eq!(restored.feature_set_enrichment, FeatureSetEnrichmentParams::default());
        assert_eq!(restored.batch_correction.method, CorrectionMethod::None);
        assert_eq!(
            restored.cell_filtering,
            CellFilteringParams {
                use_rna: true,
                use_adt: false,
                use_crispr: false,
            }
        );
        if version == 0 {
            assert_eq!(restored.kmeans_cluster, KmeansClusterParams::default());
        } else {
            assert_eq!(restored.kmeans_cluster, params.kmeans_cluster);
        }

        // the RNA results come back, rebuilt filtering included
        assert_eq!(
            back.cell_filtering.num_retained(),
            analysis.cell_filtering.num_retained()
        );
        assert_eq!(
            back.snn_graph_cluster.fetch_clusters().unwrap().to_vec(),
            analysis.snn_graph_cluster.fetch_clusters().unwrap().to_vec()
        );

        run_analysis(&mut back, None, &restored, &NoopObserver)?;
        let changed = back.changed_steps();
        assert!(changed.contains(&Step::Inputs));
        assert!(changed.contains(&Step::CellLabelling));
        assert!(back.choose_clustering.num_clusters() > 0);
        run_analysis(&mut back, None, &restored, &NoopObserver)?;
        assert_eq!(back.changed_steps(), Vec::<Step>::new());
    }
    Ok(())
}

#[test]
fn test_export() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let analysis = run_fresh(&one("main", memory_dataset(30, 45, 106)), &params())?;
    let out = dir.path().join("out");
    export_analysis(&analysis, &out)?;

    let retained = analysis.cell_filtering.num_retained();
    let mut reader = ::csv::Reader::from_path(out.join("clustering/chosen/clusters.csv"))?;
    assert_eq!(reader.records().count(), retained);
    let mut reader = ::csv::Reader::from_path(out.join("umap_components/projection.csv"))?;
    assert_eq!(reader.records().count(), retained);
    let mut reader = ::csv::Reader::from_path(out.join("markers/RNA.csv"))?;
    assert_eq!(reader.records().count(), 30);
    assert!(!out.join("clustering/kmeans").exists());
    Ok(())
}
