//! Markers of user-defined cell selections.

use anyhow::{Context, Result};
use log::info;
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{BlockFactor, Modality, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::markers::{score_markers, GroupMarkers};
use crate::permute::Permuter;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::cell_filtering::CellFiltering;
use crate::steps::marker_detection::VersusScorer;
use crate::steps::{normalized_matrices, NormalizedSource};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomSelectionsParams {
    /// Selections by name, as indices of filtered cells.
    pub selections: BTreeMap<String, Vec<usize>>,
    pub lfc_threshold: f64,
    pub compute_auc: bool,
}

impl Default for CustomSelectionsParams {
    fn default() -> Self {
        CustomSelectionsParams {
            selections: BTreeMap::new(),
            lfc_threshold: 0.0,
            compute_auc: true,
        }
    }
}

impl CustomSelectionsParams {
    fn same_scoring(&self, other: &CustomSelectionsParams) -> bool {
        self.lfc_threshold == other.lfc_threshold && self.compute_auc == other.compute_auc
    }
}

type SelectionMarkers = BTreeMap<Modality, GroupMarkers>;

#[derive(Debug)]
struct SelectionCache {
    results: BTreeMap<String, SelectionMarkers>,
    num_cells: usize,
    versus: VersusScorer<(String, String)>,
}

#[derive(Debug, Default)]
pub struct CustomSelections {
    status: Status,
    params: Option<CustomSelectionsParams>,
    cache: Option<SelectionCache>,
}

/// Group 0 for the selected cells, group 1 for the rest.
fn selection_groups(name: &str, selection: &[usize], num_cells: usize) -> Result<Vec<usize>> {
    let mut groups = vec![1; num_cells];
    for &c in selection {
        *groups.get_mut(c).ok_or_else(|| {
            PipelineError::consistency(format!(
                "selection {name:?} refers to cell {c} of {num_cells}"
            ))
        })? = 0;
    }
    Ok(groups)
}

fn score_selection(
    name: &str,
    selection: &[usize],
    normalized: &[&dyn NormalizedSource],
    block: Option<&BlockFactor>,
    params: &CustomSelectionsParams,
) -> Result<SelectionMarkers> {
    let mut out = BTreeMap::new();
    for (modality, lazy) in normalized_matrices(normalized) {
        let matrix = lazy.get()?;
        let groups = selection_groups(name, selection, matrix.num_columns())?;
        let mut scored = score_markers(
            matrix,
            &groups,
            2,
            block,
            params.lfc_threshold,
            params.compute_auc,
        )
        .with_context(|| format!("failed to score {modality} markers of selection {name:?}"))?;
        out.insert(modality, scored.swap_remove(0));
    }
    Ok(out)
}

impl CustomSelections {
    pub fn new() -> Self {
        CustomSelections::default()
    }

    /// Only selections that are new or whose cells changed are scored, unless
    /// the upstream data or the scoring settings changed.
    pub fn compute(
        &mut self,
        filtering: &CellFiltering,
        normalized: &[&dyn NormalizedSource],
        params: CustomSelectionsParams,
    ) -> Result<()> {
        let upstream = filtering.changed() || normalized.iter().any(|n| n.changed());
        let rescore_all = upstream
            || self.cache.is_none()
            || self.params.as_ref().map_or(true, |p| !p.same_scoring(&params));
        let needed = rescore_all || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::CustomSelections, needed) {
            return Ok(());
        }

        let previous = if rescore_all {
            BTreeMap::new()
        } else {
            self.cache.take().map(|c| c.results).unwrap_or_default()
        };
        let old_selections = self.params.as_ref().map(|p| &p.selections);
        let block = filtering.fetch_filtered_block();
        let mut results = BTreeMap::new();
        let mut rescored = 0;
        for (name, selection) in &params.selections {
            let unchanged = old_selections.and_then(|s| s.get(name)) == Some(selection);
            let kept = if unchanged { previous.get(name).cloned() } else { None };
            let markers = match kept {
                Some(m) => m,
                None => {
                    rescored += 1;
                    score_selection(name, selection, normalized, block, &params)?
                }
            };
            results.insert(name.clone(), markers);
        }
        info!(
            "custom selections: scored {rescored} of {} selections",
            params.selections.len()
        );
        self.cache = Some(SelectionCache {
            results,
            num_cells: filtering.num_retained(),
            versus: VersusScorer::new(normalized, block, params.lfc_threshold, params.compute_auc),
        });
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> CustomSelectionsParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_results(&self, selection: &str, modality: Modality) -> Option<&GroupMarkers> {
        self.cache.as_ref()?.results.get(selection)?.get(&modality)
    }

    /// Markers of one selection against another. Cells in both count for
    /// `left`.
    pub fn fetch_versus(
        &self,
        modality: Modality,
        left: &str,
        right: &str,
    ) -> Result<Arc<GroupMarkers>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| PipelineError::state("custom selections have not been computed"))?;
        let params = self.params.as_ref().ok_or_else(|| {
            PipelineError::state("custom selections have no parameters")
        })?;
        let lookup = |name: &str| {
            params.selections.get(name).ok_or_else(|| {
                PipelineError::reference(format!("no selection named {name:?}"))
            })
        };
        let (l, r) = (lookup(left)?, lookup(right)?);
        let mut groups = vec![2; cache.num_cells];
        for (selection, label) in [(r, 1), (l, 0)] {
            for &c in selection {
                if let Some(g) = groups.get_mut(c) {
                    *g = label;
                }
            }
        }
        cache
            .versus
            .score(modality, (left.to_string(), right.to_string()), &groups, 0, 1)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(cache) = &self.cache {
            let per = group.create_group(RESULTS).create_group("per_selection");
            for (name, markers) in &cache.results {
                let g = per.create_group(name);
                for (modality, m) in markers {
                    m.write(g.create_group(modality.as_str()));
                }
            }
        }
        Ok(())
    }

    pub fn unserialize(
        group: &Group,
        filtering: &CellFiltering,
        normalized: &[&dyn NormalizedSource],
        permuter: &Permuter,
    ) -> Result<Self> {
        let params: CustomSelectionsParams = read_step_parameters(group)?;
        let mut step = CustomSelections::new();
        if let Some(saved) = results(group) {
            let mut results = BTreeMap::new();
            if let Some(per) = saved.group_opt("per_selection") {
                for name in per.names() {
                    let g = per.group(name)?;
                    let mut markers = BTreeMap::new();
                    for m in g.names() {
                        let modality: Modality = m.parse()?;
                        let reorder = |v: Vec<f64>| permuter.permute(modality, v);
                        let read = GroupMarkers::read(g.group(m)?, &reorder)
                            .with_context(|| format!("failed to read selection {name:?}"))?;
                        markers.insert(modality, read);
                    }
                    results.insert(name.to_string(), markers);
                }
            }
            step.cache = Some(SelectionCache {
                results,
                num_cells: filtering.num_retained(),
                versus: VersusScorer::new(
                    normalized,
                    filtering.fetch_filtered_block(),
                    params.lfc_threshold,
                    params.compute_auc,
                ),
            });
            step.status = Status::restored();
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for CustomSelections {
    fn step(&self) -> Step {
        Step::CustomSelections
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        self.cache = None;
        self.status.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    fn selections(pairs: &[(&str, Vec<usize>)]) -> CustomSelectionsParams {
        CustomSelectionsParams {
            selections: pairs
                .iter()
                .map(|(n, s)| (n.to_string(), s.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_incremental_selections() -> Result<()> {
        let mut p = Pipeline::multimodal(50, 43)?;
        let mut custom = CustomSelections::new();
        let first = selections(&[("a", vec![0, 1, 2, 3]), ("b", vec![10, 11, 12])]);
        custom.compute(&p.filtering, &p.normalized(), first)?;
        assert!(custom.changed());
        let a = custom.fetch_results("a", Modality::Adt).unwrap().clone();
        assert_eq!(a.num_features(), p.inputs.fetch_matrix(Modality::Adt).unwrap().num_rows());

        // adding a selection keeps the other results
        p.rerun()?;
        let second = selections(&[
            ("a", vec![0, 1, 2, 3]),
            ("b", vec![10, 11, 12]),
            ("c", vec![20, 21]),
        ]);
        custom.compute(&p.filtering, &p.normalized(), second.clone())?;
        assert!(custom.changed());
        assert_eq!(custom.fetch_results("a", Modality::Adt).unwrap().means, a.means);
        assert!(custom.fetch_results("c", Modality::Crispr).is_some());

        custom.compute(&p.filtering, &p.normalized(), second.clone())?;
        assert!(!custom.changed());

        let versus = custom.fetch_versus(Modality::Rna, "a", "b")?;
        assert!(Arc::ptr_eq(&versus, &custom.fetch_versus(Modality::Rna, "a", "b")?));
        assert!(custom.fetch_versus(Modality::Rna, "a", "zzz").is_err());

        let mut g = Group::new();
        custom.serialize(&mut g)?;
        let back = CustomSelections::unserialize(
            &g,
            &p.filtering,
            &p.normalized(),
            &Permuter::identity(),
        )?;
        assert_eq!(back.fetch_parameters(), second);
        assert_eq!(back.fetch_results("a", Modality::Adt).unwrap().means, a.means);
        Ok(())
    }

    #[test]
    fn test_out_of_range_selection() -> Result<()> {
        let p = Pipeline::rna_only(20, 30, 47)?;
        let mut custom = CustomSelections::new();
        let err = custom
            .compute(
                &p.filtering,
                &p.normalized(),
                selections(&[("big", vec![10_000])]),
            )
            .unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::Consistency(_))
        ));
        Ok(())
    }
}
