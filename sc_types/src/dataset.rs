//! The contract every input format implements.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::check_length;
use crate::feature_type::Modality;
use crate::frame::DataFrame;
use crate::matrix::CountMatrix;

/// A file backing a dataset, with the role it plays for its format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetFile {
    pub kind: String,
    pub path: PathBuf,
}

impl DatasetFile {
    pub fn new(kind: &str, path: impl Into<PathBuf>) -> Self {
        DatasetFile {
            kind: kind.to_string(),
            path: path.into(),
        }
    }

    /// The file name, used when the file is stored in a container.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)
            .with_context(|| format!("unable to stat {:?}", self.path))?
            .len())
    }
}

/// Cheap identity of a dataset, used to decide whether inputs changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSummary {
    pub format: String,
    /// `(kind, name, size)` per file.
    pub files: Vec<(String, String, u64)>,
}

impl DatasetSummary {
    pub fn from_files(format: &str, files: &[DatasetFile]) -> Result<Self> {
        Ok(DatasetSummary {
            format: format.to_string(),
            files: files
                .iter()
                .map(|f| Ok((f.kind.clone(), f.name(), f.size()?)))
                .collect::<Result<_>>()?,
        })
    }
}

/// Metadata available without reading the matrix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatasetPreflight {
    pub features: BTreeMap<Modality, DataFrame>,
    pub cells: DataFrame,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Keep parsed annotations around for later calls.
    pub cache: bool,
}

/// Materialized matrices and annotations of one dataset.
#[derive(Debug, Default)]
pub struct LoadedDataset {
    pub matrices: BTreeMap<Modality, CountMatrix>,
    pub row_ids: BTreeMap<Modality, Vec<usize>>,
    pub features: BTreeMap<Modality, DataFrame>,
    pub cells: DataFrame,
}

impl LoadedDataset {
    pub fn num_cells(&self) -> usize {
        self.cells.num_rows()
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.matrices.keys().copied()
    }

    /// Check that matrices, row ids and annotations agree with each other.
    pub fn validate(&self) -> Result<()> {
        for (modality, matrix) in &self.matrices {
            check_length(
                &format!("{modality} cells"),
                matrix.num_columns(),
                self.num_cells(),
            )?;
            let rows = self.row_ids.get(modality).map_or(0, Vec::len);
            check_length(&format!("{modality} row ids"), rows, matrix.num_rows())?;
            let annotated = self.features.get(modality).map_or(0, DataFrame::num_rows);
            check_length(
                &format!("{modality} feature annotations"),
                annotated,
                matrix.num_rows(),
            )?;
        }
        Ok(())
    }
}

/// A source of count data in some on-disk format.
///
/// Implementations are registered by format tag in a
/// [`DatasetRegistry`](crate::registry::DatasetRegistry) so persisted
/// analyses can rebuild them from their file list.
pub trait Dataset: Debug + Send + Sync {
    /// Registered format tag.
    fn format(&self) -> &'static str;

    /// Identity of the dataset, from file metadata only.
    fn abbreviate(&self) -> Result<DatasetSummary>;

    /// Feature and cell annotations, without reading the matrix.
    fn preflight(&self) -> Result<DatasetPreflight>;

    /// Read everything. Internal caches are released unless `options.cache`.
    fn load(&self, options: LoadOptions) -> Result<LoadedDataset>;

    /// Files sufficient to rebuild this dataset.
    fn serialize(&self) -> Result<Vec<DatasetFile>>;

    /// Release internal caches.
    fn clear(&self);
}

/// Find a file of the given kind in a serialized file list.
pub fn find_file<'a>(files: &'a [DatasetFile], kind: &str) -> Option<&'a Path> {
    files
        .iter()
        .find(|f| f.kind == kind)
        .map(|f| f.path.as_path())
}
