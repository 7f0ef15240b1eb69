//! The analysis state and the operations that drive it: running every step
//! in dependency order, subsetting, saving and loading.

use anyhow::{Context, Result};
use log::info;
use sc_store::names::RESULTS;
use sc_store::upgrade::upgrade;
use sc_store::{read_container, write_container, FileResolver, FileSink, Group, Storage};
use sc_types::DatasetRegistry;
use std::path::Path;
use std::sync::Arc;

use crate::config::AnalysisParameters;
use crate::persist::step_group;
use crate::session::Session;
use crate::step::{Step, StepState};
use crate::steps::*;

/// Progress callbacks of [`run_analysis`]. Both are called on the thread
/// running the step and block it; an error aborts the run.
pub trait RunObserver: Sync {
    fn started(&self, _step: Step) -> Result<()> {
        Ok(())
    }

    fn finished(&self, _step: Step, _changed: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Every step of one analysis, wired to a session.
#[derive(Debug)]
pub struct Analysis {
    session: Arc<Session>,
    /// Set by [`load_analysis`]; the next run treats the inputs as changed.
    reloaded: bool,
    pub inputs: Inputs,
    pub rna_quality_control: RnaQualityControl,
    pub adt_quality_control: AdtQualityControl,
    pub crispr_quality_control: CrisprQualityControl,
    pub cell_filtering: CellFiltering,
    pub rna_normalization: RnaNormalization,
    pub adt_normalization: AdtNormalization,
    pub crispr_normalization: CrisprNormalization,
    pub feature_selection: FeatureSelection,
    pub rna_pca: RnaPca,
    pub adt_pca: AdtPca,
    pub crispr_pca: CrisprPca,
    pub combine_embeddings: CombineEmbeddings,
    pub batch_correction: BatchCorrection,
    pub neighbor_index: NeighborIndexStep,
    pub tsne: Tsne,
    pub umap: Umap,
    pub kmeans_cluster: KmeansCluster,
    pub snn_graph_cluster: SnnGraphCluster,
    pub choose_clustering: ChooseClustering,
    pub marker_detection: MarkerDetection,
    pub cell_labelling: CellLabelling,
    pub feature_set_enrichment: FeatureSetEnrichment,
    pub custom_selections: CustomSelections,
}

impl Analysis {
    fn empty(session: Arc<Session>, inputs: Inputs) -> Self {
        Analysis {
            session,
            reloaded: false,
            inputs,
            rna_quality_control: RnaQualityControl::new(),
            adt_quality_control: AdtQualityControl::new(),
            crispr_quality_control: CrisprQualityControl::new(),
            cell_filtering: CellFiltering::new(),
            rna_normalization: RnaNormalization::new(),
            adt_normalization: AdtNormalization::new(),
            crispr_normalization: CrisprNormalization::new(),
            feature_selection: FeatureSelection::new(),
            rna_pca: RnaPca::new(),
            adt_pca: AdtPca::new(),
            crispr_pca: CrisprPca::new(),
            combine_embeddings: CombineEmbeddings::new(),
            batch_correction: BatchCorrection::new(),
            neighbor_index: NeighborIndexStep::new(),
            tsne: Tsne::new(),
            umap: Umap::new(),
            kmeans_cluster: KmeansCluster::new(),
            snn_graph_cluster: SnnGraphCluster::new(),
            choose_clustering: ChooseClustering::new(),
            marker_detection: MarkerDetection::new(),
            cell_labelling: CellLabelling::new(),
            feature_set_enrichment: FeatureSetEnrichment::new(),
            custom_selections: CustomSelections::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_reloaded(&self) -> bool {
        self.reloaded
    }

    /// Every step, in dependency order.
    pub fn steps(&self) -> [&dyn StepState; 24] {
        [
            &self.inputs,
            &self.rna_quality_control,
            &self.adt_quality_control,
            &self.crispr_quality_control,
            &self.cell_filtering,
            &self.rna_normalization,
            &self.adt_normalization,
            &self.crispr_normalization,
            &self.feature_selection,
            &self.rna_pca,
            &self.adt_pca,
            &self.crispr_pca,
            &self.combine_embeddings,
            &self.batch_correction,
            &self.neighbor_index,
            &self.tsne,
            &self.umap,
            &self.kmeans_cluster,
            &self.snn_graph_cluster,
            &self.choose_clustering,
            &self.marker_detection,
            &self.cell_labelling,
            &self.feature_set_enrichment,
            &self.custom_selections,
        ]
    }

    fn steps_mut(&mut self) -> [&mut dyn StepState; 24] {
        [
            &mut self.inputs,
            &mut self.rna_quality_control,
            &mut self.adt_quality_control,
            &mut self.crispr_quality_control,
            &mut self.cell_filtering,
            &mut self.rna_normalization,
            &mut self.adt_normalization,
            &mut self.crispr_normalization,
            &mut self.feature_selection,
            &mut self.rna_pca,
            &mut self.adt_pca,
            &mut self.crispr_pca,
            &mut self.combine_embeddings,
            &mut self.batch_correction,
            &mut self.neighbor_index,
            &mut self.tsne,
            &mut self.umap,
            &mut self.kmeans_cluster,
            &mut self.snn_graph_cluster,
            &mut self.choose_clustering,
            &mut self.marker_detection,
            &mut self.cell_labelling,
            &mut self.feature_set_enrichment,
            &mut self.custom_selections,
        ]
    }

    /// Steps whose last `compute` produced new results.
    pub fn changed_steps(&self) -> Vec<Step> {
        self.steps()
            .iter()
            .filter(|s| s.changed())
            .map(|s| s.step())
            .collect()
    }

    pub fn normalized(&self) -> [&dyn NormalizedSource; 3] {
        [
            &self.rna_normalization,
            &self.adt_normalization,
            &self.crispr_normalization,
        ]
    }
}

/// A new analysis with every step stale.
pub fn create_analysis(session: Arc<Session>) -> Result<Analysis> {
    session
        .workers()
        .context("cannot create an analysis without workers")?;
    Ok(Analysis::empty(session, Inputs::new()))
}

/// Run `op` on `step` between the observer's callbacks.
fn tracked<S: StepState>(
    observer: &dyn RunObserver,
    step: &mut S,
    op: impl FnOnce(&mut S) -> Result<()>,
) -> Result<()> {
    let id = step.step();
    observer.started(id)?;
    op(step).with_context(|| format!("failed to compute {id}"))?;
    observer.finished(id, step.changed())
}

/// Compute every step in dependency order. `datasets` may be omitted once
/// the inputs have been loaded. An error leaves the remaining steps as they
/// were.
pub fn run_analysis(
    analysis: &mut Analysis,
    datasets: Option<&DatasetMap>,
    params: &AnalysisParameters,
    observer: &dyn RunObserver,
) -> Result<()> {
    let reloaded = std::mem::take(&mut analysis.reloaded);
    let Analysis {
        session,
        reloaded: _,
        inputs,
        rna_quality_control,
        adt_quality_control,
        crispr_quality_control,
        cell_filtering,
        rna_normalization,
        adt_normalization,
        crispr_normalization,
        feature_selection,
        rna_pca,
        adt_pca,
        crispr_pca,
        combine_embeddings,
        batch_correction,
        neighbor_index,
        tsne,
        umap,
        kmeans_cluster,
        snn_graph_cluster,
        choose_clustering,
        marker_detection,
        cell_labelling,
        feature_set_enrichment,
        custom_selections,
    } = analysis;
    let session: &Session = session;

    tracked(observer, inputs, |s| {
        s.compute(datasets, params.inputs.clone())?;
        if reloaded {
            s.force_changed();
        }
        Ok(())
    })?;
    let inputs: &Inputs = inputs;

    tracked(observer, rna_quality_control, |s| {
        s.compute(inputs, params.rna_quality_control.clone())
    })?;
    tracked(observer, adt_quality_control, |s| {
        s.compute(inputs, params.adt_quality_control.clone())
    })?;
    tracked(observer, crispr_quality_control, |s| {
        s.compute(inputs, params.crispr_quality_control.clone())
    })?;
    let rna_qc: &RnaQualityControl = rna_quality_control;
    let adt_qc: &AdtQualityControl = adt_quality_control;
    let crispr_qc: &CrisprQualityControl = crispr_quality_control;

    tracked(observer, cell_filtering, |s| {
        s.compute(inputs, rna_qc, adt_qc, crispr_qc, params.cell_filtering.clone())
    })?;
    let filtering: &CellFiltering = cell_filtering;

    tracked(observer, rna_normalization, |s| {
        s.compute(rna_qc, filtering, params.rna_normalization.clone())
    })?;
    tracked(observer, adt_normalization, |s| {
        s.compute(adt_qc, filtering, params.adt_normalization.clone())
    })?;
    tracked(observer, crispr_normalization, |s| {
        s.compute(crispr_qc, filtering, params.crispr_normalization.clone())
    })?;
    let rna_norm: &RnaNormalization = rna_normalization;
    let normalized: [&dyn NormalizedSource; 3] =
        [rna_norm, &*adt_normalization, &*crispr_normalization];

    tracked(observer, feature_selection, |s| {
        s.compute(filtering, rna_norm, params.feature_selection.clone())
    })?;
    let selection: &FeatureSelection = feature_selection;

    tracked(observer, rna_pca, |s| {
        s.compute(selection, normalized[0], filtering, params.rna_pca.clone())
    })?;
    tracked(observer, adt_pca, |s| {
        s.compute(selection, normalized[1], filtering, params.adt_pca.clone())
    })?;
    tracked(observer, crispr_pca, |s| {
        s.compute(selection, normalized[2], filtering, params.crispr_pca.clone())
    })?;
    let embeddings: [&dyn EmbeddingSource; 3] = [&*rna_pca, &*adt_pca, &*crispr_pca];

    tracked(observer, combine_embeddings, |s| {
        s.compute(&embeddings, params.combine_embeddings.clone())
    })?;
    let combined: &CombineEmbeddings = combine_embeddings;
    tracked(observer, batch_correction, |s| {
        s.compute(filtering, combined, params.batch_correction.clone())
    })?;
    let corrected: &BatchCorrection = batch_correction;
    tracked(observer, neighbor_index, |s| {
        s.compute(corrected, params.neighbor_index.clone())
    })?;
    let index: &NeighborIndexStep = neighbor_index;

    let (t, u) = session.install(|| {
        rayon::join(
            || tracked(observer, tsne, |s| s.compute(index, params.tsne.clone(), session)),
            || tracked(observer, umap, |s| s.compute(index, params.umap.clone(), session)),
        )
    })?;
    t?;
    u?;

    let method = params.choose_clustering.method;
    let (k, g) = session.install(|| {
        rayon::join(
            || {
                tracked(observer, kmeans_cluster, |s| {
                    s.compute(
                        corrected,
                        params.kmeans_cluster.clone(),
                        method == ClusterMethod::Kmeans,
                    )
                })
            },
            || {
                tracked(observer, snn_graph_cluster, |s| {
                    s.compute(
                        index,
                        params.snn_graph_cluster.clone(),
                        method == ClusterMethod::SnnGraph,
                    )
                })
            },
        )
    })?;
    k?;
    g?;

    let (snn, kmeans): (&SnnGraphCluster, &KmeansCluster) = (snn_graph_cluster, kmeans_cluster);
    tracked(observer, choose_clustering, |s| {
        s.compute(snn, kmeans, params.choose_clustering.clone())
    })?;
    let chosen: &ChooseClustering = choose_clustering;

    tracked(observer, marker_detection, |s| {
        s.compute(filtering, &normalized, chosen, params.marker_detection.clone())
    })?;
    let markers: &MarkerDetection = marker_detection;
    tracked(observer, cell_labelling, |s| {
        s.compute(inputs, markers, params.cell_labelling.clone(), session)
    })?;
    tracked(observer, feature_set_enrichment, |s| {
        s.compute(
            inputs,
            markers,
            filtering,
            rna_norm,
            params.feature_set_enrichment.clone(),
            session,
        )
    })?;
    tracked(observer, custom_selections, |s| {
        s.compute(filtering, &normalized, params.custom_selections.clone())
    })?;
    Ok(())
}

/// Release every step's buffers, downstream first.
pub fn free_analysis(mut analysis: Analysis) {
    for step in analysis.steps_mut().into_iter().rev() {
        step.free();
    }
}

/// The parameters each step last ran with.
pub fn retrieve_parameters(analysis: &Analysis) -> AnalysisParameters {
    AnalysisParameters {
        inputs: analysis.inputs.fetch_parameters(),
        rna_quality_control: analysis.rna_quality_control.fetch_parameters(),
        adt_quality_control: analysis.adt_quality_control.fetch_parameters(),
        crispr_quality_control: analysis.crispr_quality_control.fetch_parameters(),
        cell_filtering: analysis.cell_filtering.fetch_parameters(),
        rna_normalization: analysis.rna_normalization.fetch_parameters(),
        adt_normalization: analysis.adt_normalization.fetch_parameters(),
        crispr_normalization: analysis.crispr_normalization.fetch_parameters(),
        feature_selection: analysis.feature_selection.fetch_parameters(),
        rna_pca: analysis.rna_pca.fetch_parameters(),
        adt_pca: analysis.adt_pca.fetch_parameters(),
        crispr_pca: analysis.crispr_pca.fetch_parameters(),
        combine_embeddings: analysis.combine_embeddings.fetch_parameters(),
        batch_correction: analysis.batch_correction.fetch_parameters(),
        neighbor_index: analysis.neighbor_index.fetch_parameters(),
        tsne: analysis.tsne.fetch_parameters(),
        umap: analysis.umap.fetch_parameters(),
        kmeans_cluster: analysis.kmeans_cluster.fetch_parameters(),
        snn_graph_cluster: analysis.snn_graph_cluster.fetch_parameters(),
        choose_clustering: analysis.choose_clustering.fetch_parameters(),
        marker_detection: analysis.marker_detection.fetch_parameters(),
        cell_labelling: analysis.cell_labelling.fetch_parameters(),
        feature_set_enrichment: analysis.feature_set_enrichment.fetch_parameters(),
        custom_selections: analysis.custom_selections.fetch_parameters(),
    }
}

/// A new analysis over a subset of the loaded cells. `indices` refer to the
/// current cells, or to the loaded data when `on_original` is set. Nothing
/// is read again and `analysis` is left untouched.
pub fn subset_inputs(analysis: &Analysis, indices: &[usize], on_original: bool) -> Result<Analysis> {
    let inputs = analysis
        .inputs
        .subset(indices, on_original)
        .context("failed to subset the inputs")?;
    info!("new analysis over {} cells", inputs.num_cells());
    Ok(Analysis::empty(Arc::clone(&analysis.session), inputs))
}

/// Build the state document of `analysis`, registering raw files with `sink`.
fn state_document(analysis: &Analysis, sink: &mut FileSink) -> Result<Group> {
    let mut doc = Group::new();
    macro_rules! save {
        ($($field:ident),* $(,)?) => {
            $(
                analysis
                    .$field
                    .serialize(doc.create_group(analysis.$field.step().name()))
                    .with_context(|| format!("failed to save {}", analysis.$field.step()))?;
            )*
        };
    }
    analysis
        .inputs
        .serialize(doc.create_group(Step::Inputs.name()), sink)
        .context("failed to save inputs")?;
    save!(
        rna_quality_control,
        adt_quality_control,
        crispr_quality_control,
        cell_filtering,
        rna_normalization,
        adt_normalization,
        crispr_normalization,
        feature_selection,
        rna_pca,
        adt_pca,
        crispr_pca,
        combine_embeddings,
        batch_correction,
        neighbor_index,
        tsne,
        umap,
        kmeans_cluster,
        snn_graph_cluster,
        choose_clustering,
        marker_detection,
        cell_labelling,
        feature_set_enrichment,
        custom_selections,
    );
    Ok(doc)
}

/// Write `analysis` to a container at `path`. With `embed` the raw input
/// files are copied into the container, otherwise their paths are recorded.
pub fn save_analysis(analysis: &Analysis, path: &Path, embed: bool) -> Result<()> {
    let storage = if embed {
        Storage::Embedded
    } else {
        Storage::Linked
    };
    let mut sink = FileSink::new(storage);
    let doc = state_document(analysis, &mut sink)?;
    write_container(path, &doc, storage, &sink.into_files())
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Read a container, upgrading legacy layouts, and restore every step in
/// dependency order. Datasets are rebuilt through `registry` from files
/// located by `resolver`.
pub fn load_analysis(
    path: &Path,
    session: Arc<Session>,
    registry: &DatasetRegistry,
    resolver: &mut dyn FileResolver,
) -> Result<Analysis> {
    session
        .workers()
        .context("cannot load an analysis without workers")?;
    let container = read_container(path)?;
    let version = container.preamble.version;
    let doc = upgrade(version, container.document)
        .with_context(|| format!("failed to upgrade {}", path.display()))?;
    let group = |step: Step| step_group(&doc, step);
    info!("restoring analysis from {} (version {version})", path.display());

    let (inputs, permuter) = Inputs::unserialize(
        group(Step::Inputs)?,
        registry,
        resolver,
        container.embedded.as_ref(),
    )
    .context("failed to restore inputs")?;
    if !permuter.is_identity() {
        info!("features were reordered since the analysis was saved");
    }
    let rna_quality_control =
        RnaQualityControl::unserialize(group(Step::RnaQualityControl)?, &inputs)?;
    let adt_quality_control =
        AdtQualityControl::unserialize(group(Step::AdtQualityControl)?, &inputs)?;
    let crispr_quality_control =
        CrisprQualityControl::unserialize(group(Step::CrisprQualityControl)?, &inputs)?;
    let cell_filtering = CellFiltering::unserialize(
        group(Step::CellFiltering)?,
        &inputs,
        &rna_quality_control,
        &adt_quality_control,
        &crispr_quality_control,
    )?;
    let rna_normalization =
        RnaNormalization::unserialize(group(Step::RnaNormalization)?, &cell_filtering)?;
    let adt_normalization =
        AdtNormalization::unserialize(group(Step::AdtNormalization)?, &cell_filtering)?;
    let crispr_normalization =
        CrisprNormalization::unserialize(group(Step::CrisprNormalization)?, &cell_filtering)?;
    let feature_selection = FeatureSelection::unserialize(
        group(Step::FeatureSelection)?,
        &rna_normalization,
        &permuter,
    )?;
    let rna_pca = RnaPca::unserialize(group(Step::RnaPca)?, &rna_normalization)?;
    let adt_pca = AdtPca::unserialize(group(Step::AdtPca)?, &adt_normalization)?;
    let crispr_pca = CrisprPca::unserialize(group(Step::CrisprPca)?, &crispr_normalization)?;
    let embeddings: [&dyn EmbeddingSource; 3] = [&rna_pca, &adt_pca, &crispr_pca];
    let combine_embeddings =
        CombineEmbeddings::unserialize(group(Step::CombineEmbeddings)?, &embeddings)?;
    let batch_correction = BatchCorrection::unserialize(
        group(Step::BatchCorrection)?,
        &cell_filtering,
        &combine_embeddings,
    )?;
    let neighbor_index =
        NeighborIndexStep::unserialize(group(Step::NeighborIndex)?, &batch_correction)?;
    let tsne = Tsne::unserialize(group(Step::Tsne)?)?;
    let umap = Umap::unserialize(group(Step::Umap)?)?;
    let kmeans_cluster = KmeansCluster::unserialize(group(Step::KmeansCluster)?)?;
    let snn_graph_cluster = SnnGraphCluster::unserialize(group(Step::SnnGraphCluster)?)?;
    let choose_clustering = ChooseClustering::unserialize(
        group(Step::ChooseClustering)?,
        &snn_graph_cluster,
        &kmeans_cluster,
    )?;
    let normalized: [&dyn NormalizedSource; 3] =
        [&rna_normalization, &adt_normalization, &crispr_normalization];
    let marker_detection = MarkerDetection::unserialize(
        group(Step::MarkerDetection)?,
        &cell_filtering,
        &normalized,
        &choose_clustering,
        &permuter,
    )?;
    let cell_labelling =
        CellLabelling::unserialize(group(Step::CellLabelling)?, &marker_detection)?;
    let feature_set_enrichment = FeatureSetEnrichment::unserialize(
        group(Step::FeatureSetEnrichment)?,
        &marker_detection,
        &rna_normalization,
        &permuter,
    )?;
    let custom_selections = CustomSelections::unserialize(
        group(Step::CustomSelections)?,
        &cell_filtering,
        &normalized,
        &permuter,
    )?;

    Ok(Analysis {
        session,
        reloaded: true,
        inputs,
        rna_quality_control,
        adt_quality_control,
        crispr_quality_control,
        cell_filtering,
        rna_normalization,
        adt_normalization,
        crispr_normalization,
        feature_selection,
        rna_pca,
        adt_pca,
        crispr_pca,
        combine_embeddings,
        batch_correction,
        neighbor_index,
        tsne,
        umap,
        kmeans_cluster,
        snn_graph_cluster,
        choose_clustering,
        marker_detection,
        cell_labelling,
        feature_set_enrichment,
        custom_selections,
    })
}

/// Per-step overview of a container, without restoring it.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerSummary {
    pub version: u64,
    pub embedded: bool,
    /// `(step, has results)` in dependency order.
    pub steps: Vec<(String, bool)>,
}

pub fn inspect_container(path: &Path) -> Result<ContainerSummary> {
    let container = read_container(path)?;
    let version = container.preamble.version;
    let doc = upgrade(version, container.document)?;
    let steps = sc_store::names::ALL_STEPS
        .iter()
        .map(|name| {
            let has_results = doc
                .group_opt(name)
                .map_or(false, |g| g.contains(RESULTS));
            (name.to_string(), has_results)
        })
        .collect();
    Ok(ContainerSummary {
        version,
        embedded: container.embedded.is_some(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_dataset, NUM_CLUSTERS};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn session() -> Arc<Session> {
        Arc::new(Session::builder().num_threads(2).build().unwrap())
    }

    fn small_params(num_features: usize) -> AnalysisParameters {
        let mut params = AnalysisParameters::default();
        params.rna_pca.num_hvgs = num_features;
        params.rna_pca.num_pcs = 5;
        params.tsne.iterations = 50;
        params.tsne.perplexity = 5.0;
        params.umap.num_epochs = 50;
        params.kmeans_cluster.k = NUM_CLUSTERS;
        params
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(Step, Option<bool>)>>,
        fail_on: Option<Step>,
    }

    impl RunObserver for Recorder {
        fn started(&self, step: Step) -> Result<()> {
            self.events.lock().unwrap().push((step, None));
            if self.fail_on == Some(step) {
                anyhow::bail!("stopped at {step}");
            }
            Ok(())
        }

        fn finished(&self, step: Step, changed: bool) -> Result<()> {
            self.events.lock().unwrap().push((step, Some(changed)));
            Ok(())
        }
    }

    #[test]
    fn test_run_and_rerun() -> Result<()> {
        let mut analysis = create_analysis(session())?;
        let datasets = single_dataset(30, 45, 71);
        let params = small_params(30);
        let recorder = Recorder::default();
        run_analysis(&mut analysis, Some(&datasets), &params, &recorder)?;

        let events = recorder.events.into_inner().unwrap();
        assert_eq!(events.len(), 2 * 24);
        assert!(events.iter().all(|(_, c)| c.map_or(true, |c| c)));
        assert_eq!(analysis.changed_steps().len(), 24);
        assert_eq!(retrieve_parameters(&analysis), params);
        assert!(analysis.choose_clustering.num_clusters() >= 1);
        // k-means was not chosen
        assert!(analysis.kmeans_cluster.fetch_clusters().is_none());

        run_analysis(&mut analysis, None, &params, &NoopObserver)?;
        assert_eq!(analysis.changed_steps(), Vec::<Step>::new());

        let mut umap_only = params.clone();
        umap_only.umap.min_dist = 0.3;
        run_analysis(&mut analysis, None, &umap_only, &NoopObserver)?;
        assert_eq!(analysis.changed_steps(), vec![Step::Umap]);
        free_analysis(analysis);
        Ok(())
    }

    #[test]
    fn test_observer_error_aborts() -> Result<()> {
        let mut analysis = create_analysis(session())?;
        let recorder = Recorder {
            fail_on: Some(Step::CellFiltering),
            ..Default::default()
        };
        let err = run_analysis(
            &mut analysis,
            Some(&single_dataset(20, 30, 72)),
            &small_params(20),
            &recorder,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cell_filtering"));
        assert!(analysis.rna_quality_control.fetch_discards().is_some());
        assert!(analysis.cell_filtering.fetch_discards().is_none());
        Ok(())
    }

    #[test]
    fn test_needs_workers() {
        let session = session();
        session.kill_all_workers();
        assert!(create_analysis(session).is_err());
    }
}
