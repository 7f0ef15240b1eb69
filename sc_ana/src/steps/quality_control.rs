//! Per-modality quality control.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::error::check_length;
use sc_types::{BlockFactor, CountMatrix, DataFrame, Modality, Owned, PipelineError, View};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::qc::{adt_qc, crispr_qc, igg_rows, mito_rows, rna_qc, QcResults};
use crate::step::{Status, Step, StepState};
use crate::steps::inputs::Inputs;

/// Parameters of one modality's QC, and how they are applied.
pub trait QcSettings:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync
{
    const STEP: Step;
    const MODALITY: Modality;

    fn run(
        &self,
        matrix: &CountMatrix,
        features: &DataFrame,
        block: Option<&BlockFactor>,
    ) -> Result<QcResults>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnaQcParams {
    /// Use the built-in list of mitochondrial genes instead of a prefix.
    pub use_mito_default: bool,
    pub mito_prefix: String,
    pub nmads: f64,
}

impl Default for RnaQcParams {
    fn default() -> Self {
        RnaQcParams {
            use_mito_default: true,
            mito_prefix: "mt-".to_string(),
            nmads: 3.0,
        }
    }
}

impl QcSettings for RnaQcParams {
    const STEP: Step = Step::RnaQualityControl;
    const MODALITY: Modality = Modality::Rna;

    fn run(
        &self,
        matrix: &CountMatrix,
        features: &DataFrame,
        block: Option<&BlockFactor>,
    ) -> Result<QcResults> {
        let mito = mito_rows(features, self.use_mito_default, &self.mito_prefix);
        if mito.is_empty() {
            warn!("no mitochondrial genes found, the mitochondrial proportion is zero");
        }
        rna_qc(matrix, &mito, block, self.nmads)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdtQcParams {
    pub igg_prefix: String,
    pub nmads: f64,
    /// Largest tolerated drop in detected features relative to the median.
    pub min_detected_drop: f64,
}

impl Default for AdtQcParams {
    fn default() -> Self {
        AdtQcParams {
            igg_prefix: "IgG".to_string(),
            nmads: 3.0,
            min_detected_drop: 0.1,
        }
    }
}

impl QcSettings for AdtQcParams {
    const STEP: Step = Step::AdtQualityControl;
    const MODALITY: Modality = Modality::Adt;

    fn run(
        &self,
        matrix: &CountMatrix,
        features: &DataFrame,
        block: Option<&BlockFactor>,
    ) -> Result<QcResults> {
        let igg = igg_rows(features, &self.igg_prefix);
        adt_qc(matrix, &igg, block, self.nmads, self.min_detected_drop)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrisprQcParams {
    pub nmads: f64,
}

impl Default for CrisprQcParams {
    fn default() -> Self {
        CrisprQcParams { nmads: 3.0 }
    }
}

impl QcSettings for CrisprQcParams {
    const STEP: Step = Step::CrisprQualityControl;
    const MODALITY: Modality = Modality::Crispr;

    fn run(
        &self,
        matrix: &CountMatrix,
        _features: &DataFrame,
        block: Option<&BlockFactor>,
    ) -> Result<QcResults> {
        crispr_qc(matrix, block, self.nmads)
    }
}

#[derive(Debug)]
struct Computed {
    /// Metrics and thresholds; the discards live in `discards`.
    results: QcResults,
    discards: Owned<Vec<bool>>,
}

#[derive(Debug)]
pub struct QualityControl<P> {
    status: Status,
    params: Option<P>,
    /// `Some(None)` once computed for a dataset without this modality.
    cache: Option<Option<Computed>>,
}

pub type RnaQualityControl = QualityControl<RnaQcParams>;
pub type AdtQualityControl = QualityControl<AdtQcParams>;
pub type CrisprQualityControl = QualityControl<CrisprQcParams>;

impl<P> Default for QualityControl<P> {
    fn default() -> Self {
        QualityControl {
            status: Status::default(),
            params: None,
            cache: None,
        }
    }
}

fn split_discards(mut results: QcResults) -> Computed {
    let discards = Owned::new(std::mem::take(&mut results.discards));
    Computed { results, discards }
}

impl<P: QcSettings> QualityControl<P> {
    pub fn new() -> Self {
        QualityControl::default()
    }

    pub fn compute(&mut self, inputs: &Inputs, params: P) -> Result<()> {
        let needed = inputs.changed() || self.params.as_ref() != Some(&params);
        if !self.status.begin(P::STEP, needed) {
            return Ok(());
        }
        let computed = match inputs.fetch_matrix(P::MODALITY) {
            None => {
                info!("{}: no {} data, skipping", P::STEP, P::MODALITY);
                None
            }
            Some(matrix) => {
                let features = inputs.fetch_features(P::MODALITY).ok_or_else(|| {
                    PipelineError::reference(format!("no {} feature annotations", P::MODALITY))
                })?;
                let results = params
                    .run(&matrix, features, inputs.fetch_block())
                    .with_context(|| format!("{} failed", P::STEP))?;
                info!(
                    "{}: discarding {} of {} cells",
                    P::STEP,
                    results.num_discarded(),
                    results.discards.len()
                );
                Some(split_discards(results))
            }
        };
        self.cache = Some(computed);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> P {
        self.params.clone().unwrap_or_default()
    }

    /// True if the step has data for its modality.
    pub fn is_valid(&self) -> bool {
        matches!(self.cache, Some(Some(_)))
    }

    fn computed(&self) -> Option<&Computed> {
        self.cache.as_ref()?.as_ref()
    }

    pub fn fetch_discards(&self) -> Option<View<Vec<bool>>> {
        self.computed().map(|c| c.discards.view())
    }

    pub fn fetch_metric(&self, name: &str) -> Option<&[f64]> {
        self.computed()?
            .results
            .metrics
            .get(name)
            .map(Vec::as_slice)
    }

    /// Threshold of a metric, one value per block level.
    pub fn fetch_threshold(&self, name: &str) -> Option<&[f64]> {
        self.computed()?
            .results
            .thresholds
            .get(name)
            .map(Vec::as_slice)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(computed) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(c) = computed {
                c.results.write(out);
                out.write("discards", &c.discards[..]);
            }
        }
        Ok(())
    }

    pub fn unserialize(group: &Group, inputs: &Inputs) -> Result<Self> {
        let mut step = QualityControl::<P>::new();
        step.params = Some(read_step_parameters(group)?);
        let Some(saved) = results(group) else {
            return Ok(step);
        };
        if !saved.contains("discards") {
            if inputs.has_modality(P::MODALITY) {
                warn!("{}: no saved results for {} data, will recompute", P::STEP, P::MODALITY);
                return Ok(step);
            }
            step.cache = Some(None);
        } else {
            let results = QcResults::read(saved)
                .with_context(|| format!("failed to read {} results", P::STEP))?;
            check_length(
                &format!("{} discards", P::STEP),
                results.discards.len(),
                inputs.num_cells(),
            )?;
            step.cache = Some(Some(split_discards(results)));
        }
        step.status = Status::restored();
        Ok(step)
    }
}

impl<P: QcSettings> StepState for QualityControl<P> {
    fn step(&self) -> Step {
        P::STEP
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
