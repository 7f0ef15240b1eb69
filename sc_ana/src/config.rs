//! Analysis parameters, one table per step, read from TOML.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::steps::*;

/// Parameters of every step, keyed by the step's canonical name. Missing
/// tables and fields take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParameters {
    pub inputs: InputsParams,
    pub rna_quality_control: RnaQcParams,
    pub adt_quality_control: AdtQcParams,
    pub crispr_quality_control: CrisprQcParams,
    pub cell_filtering: CellFilteringParams,
    pub rna_normalization: RnaNormalizationParams,
    pub adt_normalization: AdtNormalizationParams,
    pub crispr_normalization: CrisprNormalizationParams,
    pub feature_selection: FeatureSelectionParams,
    pub rna_pca: RnaPcaParams,
    pub adt_pca: AdtPcaParams,
    pub crispr_pca: CrisprPcaParams,
    pub combine_embeddings: CombineEmbeddingsParams,
    pub batch_correction: BatchCorrectionParams,
    pub neighbor_index: NeighborIndexParams,
    pub tsne: TsneParams,
    pub umap: UmapParams,
    pub kmeans_cluster: KmeansClusterParams,
    pub snn_graph_cluster: SnnGraphClusterParams,
    pub choose_clustering: ChooseClusteringParams,
    pub marker_detection: MarkerDetectionParams,
    pub cell_labelling: CellLabellingParams,
    pub feature_set_enrichment: FeatureSetEnrichmentParams,
    pub custom_selections: CustomSelectionsParams,
}

impl AnalysisParameters {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        Self::from_toml_str(&s).with_context(|| path.display().to_string())
    }

    /// Read `path`, or fall back to the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                warn!("no parameter file given, falling back to defaults");
                Ok(AnalysisParameters::default())
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}
