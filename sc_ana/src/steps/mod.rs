//! Step state objects, one module per step of the analysis graph.
//!
//! Every step follows the same protocol: `compute` takes its upstream steps
//! and parameters and recomputes only when one of them changed; `serialize`
//! writes the `parameters` and `results` groups; `unserialize` rebuilds a
//! current step from them. Upstream steps are passed by reference on every
//! call, so the graph itself lives in [`crate::analysis::Analysis`].

use anyhow::Result;
use ndarray::Array2;
use sc_store::Group;
use sc_types::error::check_length;
use sc_types::{CountMatrix, Deferred, Modality, Shared, View};

use crate::step::StepState;

pub mod batch_correction;
pub mod cell_filtering;
pub mod cell_labelling;
pub mod choose_clustering;
pub mod combine_embeddings;
pub mod custom_selections;
pub mod feature_selection;
pub mod feature_set_enrichment;
pub mod inputs;
pub mod kmeans_cluster;
pub mod marker_detection;
pub mod neighbor_index;
pub mod normalization;
pub mod pca;
pub mod quality_control;
pub mod snn_graph_cluster;
pub mod tsne;
pub mod umap;

pub use batch_correction::{BatchCorrection, BatchCorrectionParams, CorrectionMethod};
pub use cell_filtering::{CellFiltering, CellFilteringParams};
pub use cell_labelling::{CellLabelling, CellLabellingParams, ReferenceLabels};
pub use choose_clustering::{ChooseClustering, ChooseClusteringParams, ClusterMethod};
pub use combine_embeddings::{CombineEmbeddings, CombineEmbeddingsParams};
pub use custom_selections::{CustomSelections, CustomSelectionsParams};
pub use feature_selection::{FeatureSelection, FeatureSelectionParams};
pub use feature_set_enrichment::{
    ClusterEnrichment, CollectionEnrichment, FeatureSetEnrichment, FeatureSetEnrichmentParams,
};
pub use inputs::{CellSubset, DatasetMap, Inputs, InputsParams};
pub use kmeans_cluster::{KmeansCluster, KmeansClusterParams};
pub use marker_detection::{MarkerDetection, MarkerDetectionParams};
pub use neighbor_index::{NeighborIndexParams, NeighborIndexStep};
pub use normalization::{
    AdtNormalization, AdtNormalizationParams, CrisprNormalization, CrisprNormalizationParams,
    Normalization, RnaNormalization, RnaNormalizationParams,
};
pub use pca::{AdtPca, AdtPcaParams, CrisprPca, CrisprPcaParams, Pca, RnaPca, RnaPcaParams};
pub use quality_control::{
    AdtQcParams, AdtQualityControl, CrisprQcParams, CrisprQualityControl, QualityControl,
    RnaQcParams, RnaQualityControl,
};
pub use snn_graph_cluster::{SnnGraphCluster, SnnGraphClusterParams};
pub use tsne::{Tsne, TsneParams};
pub use umap::{Umap, UmapParams};

/// A per-modality matrix built on first access and shared with downstream
/// steps.
pub type LazyMatrix = Deferred<Shared<CountMatrix>>;

/// A step that provides one modality's log-normalized matrix.
pub trait NormalizedSource: StepState {
    fn modality(&self) -> Modality;

    /// The lazily built matrix, or `None` when the modality is absent.
    fn fetch_lazy(&self) -> Option<LazyMatrix>;

    fn fetch_normalized(&self) -> Result<Option<View<CountMatrix>>> {
        match self.fetch_lazy() {
            Some(lazy) => Ok(Some(lazy.get()?.view())),
            None => Ok(None),
        }
    }
}

/// A step that provides one modality's principal components
/// (components × cells).
pub trait EmbeddingSource: StepState {
    fn modality(&self) -> Modality;

    fn fetch_pcs(&self) -> Option<View<Array2<f64>>>;

    fn fetch_variance_explained(&self) -> Option<&[f64]>;
}

/// Normalized matrices of every modality that has one, in modality order.
pub(crate) fn normalized_matrices(
    sources: &[&dyn NormalizedSource],
) -> Vec<(Modality, LazyMatrix)> {
    sources
        .iter()
        .filter_map(|s| s.fetch_lazy().map(|lazy| (s.modality(), lazy)))
        .collect()
}

/// Two-dimensional coordinates of every cell.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Coordinates {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Coordinates {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub(crate) fn write(&self, group: &mut Group) {
        group.write("x", &self.x[..]);
        group.write("y", &self.y[..]);
    }

    pub(crate) fn read(group: &Group) -> Result<Self> {
        let coords = Coordinates {
            x: group.read("x")?,
            y: group.read("y")?,
        };
        check_length("y coordinates", coords.y.len(), coords.x.len())?;
        Ok(coords)
    }
}
