//! Reordering of per-feature results after a reload.
//!
//! Feature-indexed results are persisted in the feature order of the saved
//! matrices. A reloaded dataset may present the same features in another
//! order; the permuter maps stored vectors onto the current order.

use anyhow::Result;
use sc_types::error::check_length;
use sc_types::{Modality, PipelineError};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Permuter {
    /// For each current row, its position in the saved order. `None` means
    /// the orders agree.
    maps: BTreeMap<Modality, Option<Vec<usize>>>,
}

impl Permuter {
    /// Compare the saved row ids of each modality with the current ones.
    pub fn new(
        saved: &BTreeMap<Modality, Vec<usize>>,
        current: &BTreeMap<Modality, Vec<usize>>,
    ) -> Result<Self> {
        let mut maps = BTreeMap::new();
        for (modality, now) in current {
            let before = saved.get(modality).ok_or_else(|| {
                PipelineError::consistency(format!(
                    "modality {modality} was not present when the analysis was saved"
                ))
            })?;
            check_length(&format!("{modality} row ids"), now.len(), before.len())?;
            if before == now {
                maps.insert(*modality, None);
                continue;
            }
            let position: HashMap<usize, usize> =
                before.iter().enumerate().map(|(i, &id)| (id, i)).collect();
            let map = now
                .iter()
                .map(|id| {
                    position.get(id).copied().ok_or_else(|| {
                        PipelineError::consistency(format!(
                            "{modality} feature {id} was not present when the analysis was saved"
                        ))
                        .into()
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            maps.insert(*modality, Some(map));
        }
        if let Some(missing) = saved.keys().find(|m| !current.contains_key(m)) {
            return Err(PipelineError::consistency(format!(
                "modality {missing} is missing from the reloaded data"
            ))
            .into());
        }
        Ok(Permuter { maps })
    }

    /// A permuter that leaves every modality unchanged.
    pub fn identity() -> Self {
        Permuter::default()
    }

    /// True if no modality needs reordering.
    pub fn is_identity(&self) -> bool {
        self.maps.values().all(Option::is_none)
    }

    /// Reorder a saved per-feature vector into the current feature order.
    pub fn permute<T: Clone>(&self, modality: Modality, values: Vec<T>) -> Result<Vec<T>> {
        match self.maps.get(&modality) {
            Some(Some(map)) => {
                check_length(&format!("{modality} feature vector"), values.len(), map.len())?;
                Ok(map.iter().map(|&i| values[i].clone()).collect())
            }
            _ => Ok(values),
        }
    }

    /// Translate saved feature positions into current positions.
    pub fn remap_indices(&self, modality: Modality, indices: &[usize]) -> Result<Vec<usize>> {
        match self.maps.get(&modality) {
            Some(Some(map)) => {
                let mut inverse = vec![usize::MAX; map.len()];
                for (now, &before) in map.iter().enumerate() {
                    inverse[before] = now;
                }
                indices
                    .iter()
                    .map(|&i| {
                        inverse.get(i).copied().ok_or_else(|| {
                            PipelineError::consistency(format!(
                                "{modality} feature position {i} is out of range"
                            ))
                            .into()
                        })
                    })
                    .collect()
            }
            _ => Ok(indices.to_vec()),
        }
    }
}
