//! Dataset formats routed by registered tag.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dataset::{Dataset, DatasetFile};
use crate::error::PipelineError;
use crate::mtx::{self, MatrixMarketDataset};

/// Rebuilds a dataset from its serialized file list.
pub type DatasetConstructor = fn(&[DatasetFile]) -> Result<Arc<dyn Dataset>>;

/// Format tags that name known formats without a bundled reader.
pub const RESERVED_FORMATS: [&str; 4] = ["10X", "H5AD", "SummarizedExperiment", "ArtifactDB"];

/// Maps format tags to constructors.
#[derive(Clone)]
pub struct DatasetRegistry {
    constructors: BTreeMap<String, DatasetConstructor>,
}

fn matrix_market(files: &[DatasetFile]) -> Result<Arc<dyn Dataset>> {
    Ok(Arc::new(MatrixMarketDataset::unserialize(files)?))
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        let mut registry = DatasetRegistry::empty();
        registry.register(mtx::FORMAT, matrix_market);
        registry
    }
}

impl DatasetRegistry {
    /// A registry with no formats.
    pub fn empty() -> Self {
        DatasetRegistry {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, format: &str, constructor: DatasetConstructor) {
        self.constructors.insert(format.to_string(), constructor);
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Rebuild a dataset of the given format.
    pub fn unserialize(&self, format: &str, files: &[DatasetFile]) -> Result<Arc<dyn Dataset>> {
        let constructor = self.constructors.get(format).ok_or_else(|| {
            let reason = if RESERVED_FORMATS.contains(&format) {
                "has no registered reader"
            } else {
                "is not a known format"
            };
            PipelineError::reference(format!("dataset format {format:?} {reason}"))
        })?;
        constructor(files).with_context(|| format!("failed to rebuild a {format} dataset"))
    }
}

impl std::fmt::Debug for DatasetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_pipeline_error;

    #[test]
    fn test_unknown_format() {
        let registry = DatasetRegistry::default();
        assert_eq!(registry.formats().collect::<Vec<_>>(), vec![mtx::FORMAT]);
        for tag in ["H5AD", "Loom"] {
            let err = registry.unserialize(tag, &[]).unwrap_err();
            assert!(matches!(
                find_pipeline_error(&err),
                Some(PipelineError::Reference(_))
            ));
        }
    }

    #[test]
    fn test_routes_by_tag() -> Result<()> {
        let registry = DatasetRegistry::default();
        let files = [DatasetFile::new("mtx", "/data/matrix.mtx.gz")];
        let dataset = registry.unserialize(mtx::FORMAT, &files)?;
        assert_eq!(dataset.format(), mtx::FORMAT);
        assert_eq!(dataset.serialize()?, files.to_vec());
        Ok(())
    }
}
