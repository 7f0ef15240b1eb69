use anyhow::Result;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{check_length, PipelineError};

/// Per-cell batch assignments, as integer codes into a list of level names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFactor {
    ids: Vec<u32>,
    levels: Vec<String>,
}

impl BlockFactor {
    pub fn new(ids: Vec<u32>, levels: Vec<String>) -> Result<Self> {
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= levels.len()) {
            return Err(PipelineError::consistency(format!(
                "block code {bad} has no level among {} levels",
                levels.len()
            ))
            .into());
        }
        Ok(BlockFactor { ids, levels })
    }

    /// Factorize labels; levels are the sorted unique labels.
    pub fn from_labels(labels: &[String]) -> Self {
        let levels: Vec<String> = labels.iter().cloned().sorted().dedup().collect();
        let ids = labels
            .iter()
            .map(|l| levels.binary_search(l).unwrap_or_default() as u32)
            .collect();
        BlockFactor { ids, levels }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Cell indices belonging to each level.
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.levels.len()];
        for (cell, &id) in self.ids.iter().enumerate() {
            groups[id as usize].push(cell);
        }
        groups
    }

    /// Restrict to the listed cells; levels without cells are dropped.
    pub fn subset(&self, cells: &[usize]) -> Result<Self> {
        if let Some(&bad) = cells.iter().find(|&&c| c >= self.ids.len()) {
            return Err(PipelineError::consistency(format!(
                "cell {bad} is out of range for a block factor of length {}",
                self.ids.len()
            ))
            .into());
        }
        let labels: Vec<String> = cells
            .iter()
            .map(|&c| self.levels[self.ids[c] as usize].clone())
            .collect();
        let sub = Self::from_labels(&labels);
        // keep the original level order
        let levels: Vec<String> = self
            .levels
            .iter()
            .filter(|l| sub.levels.contains(l))
            .cloned()
            .collect();
        let ids = labels
            .iter()
            .map(|l| levels.iter().position(|x| x == l).unwrap_or_default() as u32)
            .collect();
        Ok(BlockFactor { ids, levels })
    }

    /// Drop the cells flagged in `discard`.
    pub fn filter(&self, discard: &[bool]) -> Result<Self> {
        check_length("discard vector", discard.len(), self.ids.len())?;
        let keep: Vec<usize> = (0..discard.len()).filter(|&c| !discard[c]).collect();
        self.subset(&keep)
    }
}

/// Cell indices per block level, or a single group of every cell.
pub fn block_groups(block: Option<&BlockFactor>, num_cells: usize) -> Vec<Vec<usize>> {
    match block {
        Some(b) => b.groups(),
        None => vec![(0..num_cells).collect()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_labels() {
        let b = BlockFactor::from_labels(&labels(&["y", "x", "y", "z"]));
        assert_eq!(b.levels(), &["x", "y", "z"]);
        assert_eq!(b.ids(), &[1, 0, 1, 2]);
        assert_eq!(b.groups(), vec![vec![1], vec![0, 2], vec![3]]);
    }

    #[test]
    fn test_subset_drops_empty_levels() -> Result<()> {
        let b = BlockFactor::new(vec![2, 0, 2, 1], labels(&["b", "a", "c"]))?;
        let sub = b.subset(&[0, 3, 2])?;
        assert_eq!(sub.levels(), &["a", "c"]);
        assert_eq!(sub.ids(), &[1, 0, 1]);

        let filtered = b.filter(&[false, true, false, false])?;
        assert_eq!(filtered.levels(), &["a", "c"]);
        assert!(b.filter(&[true]).is_err());
        Ok(())
    }

    #[test]
    fn test_bad_codes() {
        assert!(BlockFactor::new(vec![0, 3], labels(&["a", "b"])).is_err());
    }

    #[test]
    fn test_block_groups_default() {
        assert_eq!(block_groups(None, 3), vec![vec![0, 1, 2]]);
    }
}
