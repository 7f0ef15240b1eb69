//! Highly variable gene modelling on the RNA data.

use anyhow::Result;
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Modality, Owned, View};
use serde::{Deserialize, Serialize};

use crate::permute::Permuter;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::normalization::RnaNormalization;
use crate::steps::NormalizedSource;
use crate::variance::{model_variances, top_features, VarianceResults};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSelectionParams {
    /// LOWESS span of the mean-variance trend.
    pub span: f64,
}

impl Default for FeatureSelectionParams {
    fn default() -> Self {
        FeatureSelectionParams { span: 0.3 }
    }
}

#[derive(Debug, Default)]
pub struct FeatureSelection {
    status: Status,
    params: Option<FeatureSelectionParams>,
    /// `Some(None)` once computed for a dataset without RNA.
    cache: Option<Option<Owned<VarianceResults>>>,
}

impl FeatureSelection {
    pub fn new() -> Self {
        FeatureSelection::default()
    }

    pub fn compute(
        &mut self,
        filtering: &CellFiltering,
        normalization: &RnaNormalization,
        params: FeatureSelectionParams,
    ) -> Result<()> {
        let needed = filtering.changed()
            || normalization.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::FeatureSelection, needed) {
            return Ok(());
        }
        let modelled = match normalization.fetch_normalized()? {
            None => None,
            Some(matrix) => {
                let results =
                    model_variances(&matrix, filtering.fetch_filtered_block(), params.span)?;
                info!(
                    "feature selection: modelled {} features",
                    results.means.len()
                );
                Some(Owned::new(results))
            }
        };
        self.cache = Some(modelled);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> FeatureSelectionParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_results(&self) -> Option<View<VarianceResults>> {
        self.cache.as_ref()?.as_ref().map(Owned::view)
    }

    /// Rows of the `n` most variable features, in row order.
    pub fn fetch_top_features(&self, n: usize) -> Option<Vec<usize>> {
        self.fetch_results().map(|r| top_features(&r.residuals, n))
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(modelled) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(r) = modelled {
                out.write("means", &r.means[..]);
                out.write("vars", &r.variances[..]);
                out.write("fitted", &r.fitted[..]);
                out.write("resids", &r.residuals[..]);
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        normalization: &RnaNormalization,
        permuter: &Permuter,
    ) -> Result<Self> {
        let mut step = FeatureSelection::new();
        step.params = Some(read_step_parameters(group)?);
        let Some(saved) = results(group) else {
            return Ok(step);
        };
        if !saved.contains("means") {
            if normalization.fetch_lazy().is_some() {
                warn!("feature selection: no saved results for RNA data, will recompute");
                return Ok(step);
            }
            step.cache = Some(None);
        } else {
            let read = |name: &str| -> Result<Vec<f64>> {
                permuter.permute(Modality::Rna, saved.read(name)?)
            };
            step.cache = Some(Some(Owned::new(VarianceResults {
                means: read("means")?,
                variances: read("vars")?,
                fitted: read("fitted")?,
                residuals: read("resids")?,
            })));
        }
        step.status = Status::restored();
        Ok(step)
    }
}

impl StepState for FeatureSelection {
    fn step(&self) -> Step {
        Step::FeatureSelection
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
