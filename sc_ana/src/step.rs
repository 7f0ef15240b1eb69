//! Step identities and the change tracking every step object shares.

use log::{debug, info};
use sc_store::names;
use std::fmt;
use strum::EnumIter;

/// A node of the analysis graph. Variants are declared in dependency order.
#[derive(Clone, Copy, Debug, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Step {
    Inputs,
    RnaQualityControl,
    AdtQualityControl,
    CrisprQualityControl,
    CellFiltering,
    RnaNormalization,
    AdtNormalization,
    CrisprNormalization,
    FeatureSelection,
    RnaPca,
    AdtPca,
    CrisprPca,
    CombineEmbeddings,
    BatchCorrection,
    NeighborIndex,
    Tsne,
    Umap,
    KmeansCluster,
    SnnGraphCluster,
    ChooseClustering,
    MarkerDetection,
    CellLabelling,
    FeatureSetEnrichment,
    CustomSelections,
}

impl Step {
    /// Canonical name, also used for the persisted group.
    pub fn name(self) -> &'static str {
        #[allow(clippy::enum_glob_use)]
        use Step::*;
        match self {
            Inputs => names::INPUTS,
            RnaQualityControl => names::RNA_QUALITY_CONTROL,
            AdtQualityControl => names::ADT_QUALITY_CONTROL,
            CrisprQualityControl => names::CRISPR_QUALITY_CONTROL,
            CellFiltering => names::CELL_FILTERING,
            RnaNormalization => names::RNA_NORMALIZATION,
            AdtNormalization => names::ADT_NORMALIZATION,
            CrisprNormalization => names::CRISPR_NORMALIZATION,
            FeatureSelection => names::FEATURE_SELECTION,
            RnaPca => names::RNA_PCA,
            AdtPca => names::ADT_PCA,
            CrisprPca => names::CRISPR_PCA,
            CombineEmbeddings => names::COMBINE_EMBEDDINGS,
            BatchCorrection => names::BATCH_CORRECTION,
            NeighborIndex => names::NEIGHBOR_INDEX,
            Tsne => names::TSNE,
            Umap => names::UMAP,
            KmeansCluster => names::KMEANS_CLUSTER,
            SnnGraphCluster => names::SNN_GRAPH_CLUSTER,
            ChooseClustering => names::CHOOSE_CLUSTERING,
            MarkerDetection => names::MARKER_DETECTION,
            CellLabelling => names::CELL_LABELLING,
            FeatureSetEnrichment => names::FEATURE_SET_ENRICHMENT,
            CustomSelections => names::CUSTOM_SELECTIONS,
        }
    }

    /// Steps whose results this step consumes.
    pub fn upstream(self) -> &'static [Step] {
        #[allow(clippy::enum_glob_use)]
        use Step::*;
        match self {
            Inputs => &[],
            RnaQualityControl | AdtQualityControl | CrisprQualityControl => &[Inputs],
            CellFiltering => &[
                Inputs,
                RnaQualityControl,
                AdtQualityControl,
                CrisprQualityControl,
            ],
            RnaNormalization => &[RnaQualityControl, CellFiltering],
            AdtNormalization => &[AdtQualityControl, CellFiltering],
            CrisprNormalization => &[CrisprQualityControl, CellFiltering],
            FeatureSelection => &[CellFiltering, RnaNormalization],
            RnaPca => &[FeatureSelection, RnaNormalization, CellFiltering],
            AdtPca => &[AdtNormalization, CellFiltering],
            CrisprPca => &[CrisprNormalization, CellFiltering],
            CombineEmbeddings => &[RnaPca, AdtPca, CrisprPca],
            BatchCorrection => &[CellFiltering, CombineEmbeddings],
            NeighborIndex => &[BatchCorrection],
            Tsne | Umap => &[NeighborIndex],
            KmeansCluster => &[BatchCorrection],
            SnnGraphCluster => &[NeighborIndex],
            ChooseClustering => &[SnnGraphCluster, KmeansCluster],
            MarkerDetection => &[
                CellFiltering,
                RnaNormalization,
                AdtNormalization,
                CrisprNormalization,
                ChooseClustering,
            ],
            CellLabelling => &[Inputs, MarkerDetection],
            FeatureSetEnrichment => &[Inputs, MarkerDetection, CellFiltering, RnaNormalization],
            CustomSelections => &[
                CellFiltering,
                RnaNormalization,
                AdtNormalization,
                CrisprNormalization,
            ],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Behavior shared by every step object.
pub trait StepState: Send + Sync {
    fn step(&self) -> Step;

    /// Whether the most recent `compute` produced new results. Only meaningful
    /// right after `compute`.
    fn changed(&self) -> bool;

    /// Release every owned buffer. The step is stale afterwards. Idempotent.
    fn free(&mut self);
}

/// Change tracking of one step.
///
/// A step is stale until a `compute` completes; a failed `compute` leaves it
/// stale, so the next call retries even if nothing else changed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Status {
    changed: bool,
    stale: bool,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            changed: false,
            stale: true,
        }
    }
}

impl Status {
    /// State of a step restored from persisted results.
    pub(crate) fn restored() -> Self {
        Status {
            changed: false,
            stale: false,
        }
    }

    /// Start a `compute` call. Returns true when the step has to recompute.
    pub(crate) fn begin(&mut self, step: Step, needed: bool) -> bool {
        self.changed = false;
        if needed || self.stale {
            info!("{step}: computing");
            self.stale = true;
            true
        } else {
            debug!("{step}: up to date");
            false
        }
    }

    /// Mark a successful recompute.
    pub(crate) fn finish(&mut self) {
        self.stale = false;
        self.changed = true;
    }

    pub(crate) fn changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub(crate) fn invalidate(&mut self) {
        self.stale = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_upstreams_precede() {
        for step in Step::iter() {
            for up in step.upstream() {
                assert!(*up < step, "{up} must come before {step}");
            }
        }
        assert_eq!(Step::iter().count(), names::ALL_STEPS.len());
        for (step, name) in Step::iter().zip(names::ALL_STEPS) {
            assert_eq!(step.name(), name);
        }
    }

    #[test]
    fn test_status_retries_after_failure() {
        let mut status = Status::default();
        assert!(status.begin(Step::Tsne, false));
        // compute failed: finish() never called
        assert!(!status.changed());
        assert!(status.begin(Step::Tsne, false));
        status.finish();
        assert!(status.changed());
        assert!(!status.begin(Step::Tsne, false));
        assert!(!status.changed());
        status.invalidate();
        assert!(status.begin(Step::Tsne, false));
    }
}
