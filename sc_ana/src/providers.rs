//! Sources of labelled references and feature set collections.

use anyhow::{Context, Result};
use itertools::Itertools;
use ndarray::Array2;
use sc_types::mtx::open_maybe_gz;
use sc_types::PipelineError;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Expression profiles of labelled reference samples.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelReference {
    pub features: Vec<String>,
    /// Label of each sample.
    pub labels: Vec<String>,
    /// features × samples.
    pub profiles: Array2<f64>,
}

impl LabelReference {
    pub fn new(features: Vec<String>, labels: Vec<String>, profiles: Array2<f64>) -> Result<Self> {
        if profiles.dim() != (features.len(), labels.len()) {
            return Err(PipelineError::consistency(format!(
                "reference profiles have shape {:?}, expected ({}, {})",
                profiles.dim(),
                features.len(),
                labels.len()
            ))
            .into());
        }
        Ok(LabelReference {
            features,
            labels,
            profiles,
        })
    }
}

pub trait ReferenceProvider: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Arc<LabelReference>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSet {
    pub name: String,
    pub description: String,
    pub features: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSetCollection {
    pub name: String,
    pub sets: Vec<FeatureSet>,
}

impl FeatureSetCollection {
    /// Every feature mentioned by some set, sorted and unique.
    pub fn features(&self) -> Vec<String> {
        self.sets
            .iter()
            .flat_map(|s| s.features.iter().cloned())
            .sorted()
            .dedup()
            .collect()
    }
}

pub trait FeatureSetProvider: Send + Sync {
    fn fetch(&self, name: &str) -> Result<Arc<FeatureSetCollection>>;
}

fn find_with_extension(dir: &Path, name: &str, extension: &str) -> Result<PathBuf> {
    [
        dir.join(format!("{name}.{extension}")),
        dir.join(format!("{name}.{extension}.gz")),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        PipelineError::reference(format!(
            "no {name}.{extension}[.gz] in {}",
            dir.display()
        ))
        .into()
    })
}

/// References stored as `<dir>/<name>.tsv[.gz]`: a header `feature` followed
/// by one label per sample, then one row of values per feature.
#[derive(Clone, Debug)]
pub struct DirectoryReferences {
    dir: PathBuf,
}

impl DirectoryReferences {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectoryReferences { dir: dir.into() }
    }
}

pub(crate) fn read_reference(path: &Path) -> Result<LabelReference> {
    let bad = |msg: String| PipelineError::format(format!("{}: {msg}", path.display()));
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_maybe_gz(path)?);
    let header = reader.headers()?.clone();
    if header.get(0) != Some("feature") {
        return Err(bad("header must start with \"feature\"".into()).into());
    }
    let labels: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let mut features = Vec::new();
    let mut values = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;
        let mut fields = record.iter();
        features.push(fields.next().unwrap_or_default().to_string());
        for field in fields {
            values.push(
                field
                    .parse::<f64>()
                    .map_err(|_| bad(format!("non-numeric value {field:?} on line {}", line + 2)))?,
            );
        }
    }
    let profiles = Array2::from_shape_vec((features.len(), labels.len()), values)
        .map_err(|e| bad(format!("ragged table: {e}")))?;
    LabelReference::new(features, labels, profiles)
}

impl ReferenceProvider for DirectoryReferences {
    fn fetch(&self, name: &str) -> Result<Arc<LabelReference>> {
        let path = find_with_extension(&self.dir, name, "tsv")?;
        Ok(Arc::new(read_reference(&path).with_context(|| {
            format!("failed to load reference {name:?}")
        })?))
    }
}

/// Collections stored as `<dir>/<name>.gmt[.gz]`.
#[derive(Clone, Debug)]
pub struct GmtDirectory {
    dir: PathBuf,
}

impl GmtDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        GmtDirectory { dir: dir.into() }
    }
}

pub(crate) fn read_gmt(name: &str, path: &Path) -> Result<FeatureSetCollection> {
    let mut sets = Vec::new();
    for (i, line) in open_maybe_gz(path)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(set), Some(description)) = (fields.next(), fields.next()) else {
            return Err(PipelineError::format(format!(
                "{}: line {} needs a name and a description",
                path.display(),
                i + 1
            ))
            .into());
        };
        sets.push(FeatureSet {
            name: set.to_string(),
            description: description.to_string(),
            features: fields
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(FeatureSetCollection {
        name: name.to_string(),
        sets,
    })
}

impl FeatureSetProvider for GmtDirectory {
    fn fetch(&self, name: &str) -> Result<Arc<FeatureSetCollection>> {
        let path = find_with_extension(&self.dir, name, "gmt")?;
        Ok(Arc::new(read_gmt(name, &path)?))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryReferences {
    references: BTreeMap<String, Arc<LabelReference>>,
}

impl InMemoryReferences {
    pub fn insert(&mut self, name: &str, reference: LabelReference) {
        self.references.insert(name.to_string(), Arc::new(reference));
    }
}

impl ReferenceProvider for InMemoryReferences {
    fn fetch(&self, name: &str) -> Result<Arc<LabelReference>> {
        self.references
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::reference(format!("unknown reference {name:?}")).into())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryFeatureSets {
    collections: BTreeMap<String, Arc<FeatureSetCollection>>,
}

impl InMemoryFeatureSets {
    pub fn insert(&mut self, collection: FeatureSetCollection) {
        self.collections
            .insert(collection.name.clone(), Arc::new(collection));
    }
}

impl FeatureSetProvider for InMemoryFeatureSets {
    fn fetch(&self, name: &str) -> Result<Arc<FeatureSetCollection>> {
        self.collections.get(name).cloned().ok_or_else(|| {
            PipelineError::reference(format!("unknown feature set collection {name:?}")).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_directory_reference() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("immune.tsv"),
            "feature\tT\tT\tB\nCD3E\t5\t4\t0\nMS4A1\t0\t1\t6\n",
        )?;
        let reference = DirectoryReferences::new(dir.path()).fetch("immune")?;
        assert_eq!(reference.features, vec!["CD3E", "MS4A1"]);
        assert_eq!(reference.labels, vec!["T", "T", "B"]);
        assert_eq!(reference.profiles, array![[5.0, 4.0, 0.0], [0.0, 1.0, 6.0]]);

        let err = DirectoryReferences::new(dir.path()).fetch("absent").unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::Reference(_))
        ));
        Ok(())
    }

    #[test]
    fn test_bad_reference_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("bad.tsv"), "gene\tT\nCD3E\t1\n")?;
        assert!(DirectoryReferences::new(dir.path()).fetch("bad").is_err());
        std::fs::write(dir.path().join("text.tsv"), "feature\tT\nCD3E\thigh\n")?;
        assert!(DirectoryReferences::new(dir.path()).fetch("text").is_err());
        Ok(())
    }

    #[test]
    fn test_gmt_collection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("hallmark.gmt"),
            "T_CELL\tT cell genes\tCD3E\tCD3D\n\nB_CELL\tB cell genes\tMS4A1\tCD3E\n",
        )?;
        let collection = GmtDirectory::new(dir.path()).fetch("hallmark")?;
        assert_eq!(collection.sets.len(), 2);
        assert_eq!(collection.sets[1].features, vec!["MS4A1", "CD3E"]);
        assert_eq!(collection.features(), vec!["CD3D", "CD3E", "MS4A1"]);
        Ok(())
    }
}
