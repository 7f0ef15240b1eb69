//! Merging of the per-modality discards and removal of the flagged cells.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::error::check_length;
use sc_types::{BlockFactor, CountMatrix, Deferred, Modality, Owned, Shared, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::inputs::Inputs;
use crate::steps::quality_control::{AdtQualityControl, CrisprQualityControl, RnaQualityControl};
use crate::steps::LazyMatrix;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellFilteringParams {
    pub use_rna: bool,
    pub use_adt: bool,
    pub use_crispr: bool,
}

impl Default for CellFilteringParams {
    fn default() -> Self {
        CellFilteringParams {
            use_rna: true,
            use_adt: true,
            use_crispr: true,
        }
    }
}

#[derive(Debug)]
struct FilteringCache {
    discard: Option<Shared<Vec<bool>>>,
    matrices: BTreeMap<Modality, LazyMatrix>,
    block: Option<BlockFactor>,
    num_retained: usize,
}

#[derive(Debug, Default)]
pub struct CellFiltering {
    status: Status,
    params: Option<CellFilteringParams>,
    cache: Option<FilteringCache>,
}

/// Discards of the QC steps in use, in modality order.
fn used_discards(
    params: &CellFilteringParams,
    rna: &RnaQualityControl,
    adt: &AdtQualityControl,
    crispr: &CrisprQualityControl,
) -> Vec<(Modality, View<Vec<bool>>)> {
    [
        (params.use_rna, Modality::Rna, rna.fetch_discards()),
        (params.use_adt, Modality::Adt, adt.fetch_discards()),
        (params.use_crispr, Modality::Crispr, crispr.fetch_discards()),
    ]
    .into_iter()
    .filter_map(|(used, modality, discards)| match (used, discards) {
        (true, Some(d)) => Some((modality, d)),
        _ => None,
    })
    .collect()
}

/// OR the discards together. A single vector is aliased rather than copied.
fn merge_discards(
    used: Vec<(Modality, View<Vec<bool>>)>,
    num_cells: usize,
) -> Result<Option<Shared<Vec<bool>>>> {
    for (modality, discards) in &used {
        check_length(&format!("{modality} discards"), discards.len(), num_cells)?;
    }
    if used.len() <= 1 {
        return Ok(used.into_iter().next().map(|(_, d)| Shared::View(d)));
    }
    let mut merged = vec![false; num_cells];
    for (_, discards) in &used {
        for (out, &d) in merged.iter_mut().zip(discards.iter()) {
            *out |= d;
        }
    }
    Ok(Some(Shared::Owned(Owned::new(merged))))
}

fn filtered_block(inputs: &Inputs, discard: Option<&[bool]>) -> Result<Option<BlockFactor>> {
    match (inputs.fetch_block(), discard) {
        (Some(block), Some(d)) => Ok(Some(block.filter(d)?)),
        (Some(block), None) => Ok(Some(block.clone())),
        (None, _) => Ok(None),
    }
}

fn lazy_filter(matrix: View<CountMatrix>, discard: View<Vec<bool>>) -> LazyMatrix {
    Deferred::new(move || {
        Ok(Shared::Owned(Owned::new(matrix.filter_columns(&discard)?)))
    })
}

impl CellFiltering {
    pub fn new() -> Self {
        CellFiltering::default()
    }

    pub fn compute(
        &mut self,
        inputs: &Inputs,
        rna: &RnaQualityControl,
        adt: &AdtQualityControl,
        crispr: &CrisprQualityControl,
        params: CellFilteringParams,
    ) -> Result<()> {
        let needed = inputs.changed()
            || rna.changed()
            || adt.changed()
            || crispr.changed()
            || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::CellFiltering, needed) {
            return Ok(());
        }

        let used = used_discards(&params, rna, adt, crispr);
        let num_cells = inputs.num_cells();
        let discard = merge_discards(used, num_cells)?;
        let mut matrices = BTreeMap::new();
        for modality in inputs.modalities() {
            let Some(matrix) = inputs.fetch_matrix(modality) else {
                continue;
            };
            let filtered = match &discard {
                None => Shared::View(matrix),
                Some(d) => Shared::Owned(Owned::new(
                    matrix
                        .filter_columns(d)
                        .with_context(|| format!("failed to filter {modality} cells"))?,
                )),
            };
            matrices.insert(modality, Deferred::ready(filtered));
        }
        let block = filtered_block(inputs, discard.as_deref().map(Vec::as_slice))?;
        let num_retained = discard
            .as_deref()
            .map_or(num_cells, |d| d.iter().filter(|&&x| !x).count());
        info!("cell filtering: retaining {num_retained} of {num_cells} cells");

        self.cache = Some(FilteringCache {
            discard,
            matrices,
            block,
            num_retained,
        });
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> CellFilteringParams {
        self.params.clone().unwrap_or_default()
    }

    /// Merged discards; `None` when no modality is in use.
    pub fn fetch_discards(&self) -> Option<View<Vec<bool>>> {
        self.cache.as_ref()?.discard.as_ref().map(Shared::view)
    }

    /// True if the discards alias a QC step's vector.
    pub fn discards_are_aliased(&self) -> bool {
        self.cache
            .as_ref()
            .and_then(|c| c.discard.as_ref())
            .map_or(false, Shared::is_view)
    }

    pub fn fetch_filtered_matrix(&self, modality: Modality) -> Option<LazyMatrix> {
        self.cache.as_ref()?.matrices.get(&modality).cloned()
    }

    pub fn fetch_filtered_block(&self) -> Option<&BlockFactor> {
        self.cache.as_ref()?.block.as_ref()
    }

    pub fn num_retained(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.num_retained)
    }

    /// Positions of the retained cells among the inputs' cells.
    pub fn retained_indices(&self) -> Option<Vec<usize>> {
        let cache = self.cache.as_ref()?;
        Some(match &cache.discard {
            Some(d) => (0..d.len()).filter(|&c| !d[c]).collect(),
            None => (0..cache.num_retained).collect(),
        })
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(cache) = &self.cache {
            let out = group.create_group(RESULTS);
            // an aliased vector is rebuilt from its QC step on load
            if let Some(owned) = cache.discard.as_ref().and_then(Shared::as_owned) {
                out.write("discard", &owned[..]);
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        inputs: &Inputs,
        rna: &RnaQualityControl,
        adt: &AdtQualityControl,
        crispr: &CrisprQualityControl,
    ) -> Result<Self> {
        let params: CellFilteringParams = read_step_parameters(group)?;
        let mut step = CellFiltering::new();
        let Some(saved) = results(group) else {
            step.params = Some(params);
            return Ok(step);
        };
        let num_cells = inputs.num_cells();
        let discard = match saved.read_opt::<Vec<bool>>("discard")? {
            Some(d) => {
                check_length("saved discards", d.len(), num_cells)?;
                Some(Shared::Owned(Owned::new(d)))
            }
            None => {
                let used = used_discards(&params, rna, adt, crispr);
                let unavailable = [
                    (params.use_rna, Modality::Rna),
                    (params.use_adt, Modality::Adt),
                    (params.use_crispr, Modality::Crispr),
                ]
                .into_iter()
                .find(|&(in_use, modality)| {
                    in_use && inputs.has_modality(modality) && !used.iter().any(|(m, _)| *m == modality)
                });
                if let Some((_, modality)) = unavailable {
                    warn!("cell filtering: no {modality} discards to rebuild from, will recompute");
                    step.params = Some(params);
                    return Ok(step);
                }
                merge_discards(used, num_cells)?
            }
        };

        let mut matrices = BTreeMap::new();
        for modality in inputs.modalities() {
            let Some(matrix) = inputs.fetch_matrix(modality) else {
                continue;
            };
            let lazy = match &discard {
                None => Deferred::ready(Shared::View(matrix)),
                Some(d) => lazy_filter(matrix, d.view()),
            };
            matrices.insert(modality, lazy);
        }
        let block = filtered_block(inputs, discard.as_deref().map(Vec::as_slice))?;
        let num_retained = discard
            .as_deref()
            .map_or(num_cells, |d| d.iter().filter(|&&x| !x).count());
        step.cache = Some(FilteringCache {
            discard,
            matrices,
            block,
            num_retained,
        });
        step.params = Some(params);
        step.status = Status::restored();
        Ok(step)
    }
}

impl StepState for CellFiltering {
    fn step(&self) -> Step {
        Step::CellFiltering
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}
