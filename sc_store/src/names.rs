//! Canonical group names of the persisted steps.

pub const INPUTS: &str = "inputs";
pub const RNA_QUALITY_CONTROL: &str = "rna_quality_control";
pub const ADT_QUALITY_CONTROL: &str = "adt_quality_control";
pub const CRISPR_QUALITY_CONTROL: &str = "crispr_quality_control";
pub const CELL_FILTERING: &str = "cell_filtering";
pub const RNA_NORMALIZATION: &str = "rna_normalization";
pub const ADT_NORMALIZATION: &str = "adt_normalization";
pub const CRISPR_NORMALIZATION: &str = "crispr_normalization";
pub const FEATURE_SELECTION: &str = "feature_selection";
pub const RNA_PCA: &str = "rna_pca";
pub const ADT_PCA: &str = "adt_pca";
pub const CRISPR_PCA: &str = "crispr_pca";
pub const COMBINE_EMBEDDINGS: &str = "combine_embeddings";
pub const BATCH_CORRECTION: &str = "batch_correction";
pub const NEIGHBOR_INDEX: &str = "neighbor_index";
pub const TSNE: &str = "tsne";
pub const UMAP: &str = "umap";
pub const KMEANS_CLUSTER: &str = "kmeans_cluster";
pub const SNN_GRAPH_CLUSTER: &str = "snn_graph_cluster";
pub const CHOOSE_CLUSTERING: &str = "choose_clustering";
pub const MARKER_DETECTION: &str = "marker_detection";
pub const CELL_LABELLING: &str = "cell_labelling";
pub const FEATURE_SET_ENRICHMENT: &str = "feature_set_enrichment";
pub const CUSTOM_SELECTIONS: &str = "custom_selections";

/// Every step group, in dependency order.
pub const ALL_STEPS: [&str; 24] = [
    INPUTS,
    RNA_QUALITY_CONTROL,
    ADT_QUALITY_CONTROL,
    CRISPR_QUALITY_CONTROL,
    CELL_FILTERING,
    RNA_NORMALIZATION,
    ADT_NORMALIZATION,
    CRISPR_NORMALIZATION,
    FEATURE_SELECTION,
    RNA_PCA,
    ADT_PCA,
    CRISPR_PCA,
    COMBINE_EMBEDDINGS,
    BATCH_CORRECTION,
    NEIGHBOR_INDEX,
    TSNE,
    UMAP,
    KMEANS_CLUSTER,
    SNN_GRAPH_CLUSTER,
    CHOOSE_CLUSTERING,
    MARKER_DETECTION,
    CELL_LABELLING,
    FEATURE_SET_ENRICHMENT,
    CUSTOM_SELECTIONS,
];

pub const PARAMETERS: &str = "parameters";
pub const RESULTS: &str = "results";
