//! 10X-style Matrix Market datasets: `matrix.mtx[.gz]` with optional
//! `features.tsv[.gz]` and cell annotation tables.

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use log::info;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dataset::{
    find_file, Dataset, DatasetFile, DatasetPreflight, DatasetSummary, LoadOptions, LoadedDataset,
};
use crate::error::PipelineError;
use crate::feature_type::{FeatureType, Modality};
use crate::frame::{Column, DataFrame};
use crate::matrix::CountMatrix;
use crate::split::{default_mapping, split_by_feature_type};

/// Registered format tag.
pub const FORMAT: &str = "MatrixMarket";

const MATRIX_KIND: &str = "mtx";
const FEATURES_KIND: &str = "genes";
const ANNOTATIONS_KIND: &str = "annotations";
const TYPE_COLUMN: &str = "type";
const GZ_BUF_SIZE: usize = 1 << 20;
const GZ_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Open a possibly gzipped file, detected from its leading bytes.
pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let f = File::open(path).with_context(|| path.display().to_string())?;
    let mut reader = BufReader::with_capacity(32 * 1024, f);
    let gzipped = reader.fill_buf()?.starts_with(&GZ_MAGIC);
    if gzipped {
        Ok(Box::new(BufReader::with_capacity(
            GZ_BUF_SIZE,
            MultiGzDecoder::new(reader),
        )))
    } else {
        Ok(Box::new(reader))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MatrixHeader {
    num_rows: usize,
    num_columns: usize,
    nnz: usize,
}

fn format_error(path: &Path, msg: &str) -> anyhow::Error {
    PipelineError::format(format!("{}: {msg}", path.display())).into()
}

/// Parse the banner and size line, leaving `lines` at the first entry.
fn read_header(
    path: &Path,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<MatrixHeader> {
    let banner = lines
        .next()
        .transpose()?
        .ok_or_else(|| format_error(path, "empty file"))?;
    let tokens: Vec<String> = banner
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect();
    if tokens.first().map(String::as_str) != Some("%%matrixmarket")
        || tokens.get(1).map(String::as_str) != Some("matrix")
    {
        return Err(format_error(path, "missing %%MatrixMarket matrix banner"));
    }
    if tokens.get(2).map(String::as_str) != Some("coordinate") {
        return Err(format_error(path, "only coordinate matrices are supported"));
    }
    match tokens.get(3).map(String::as_str) {
        Some("integer") | Some("real") => {}
        other => {
            return Err(format_error(
                path,
                &format!("unsupported field type {:?}", other.unwrap_or("")),
            ))
        }
    }

    for line in lines.by_ref() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let dims: Vec<usize> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| format_error(path, &format!("malformed size line {line:?}")))?;
        if let [num_rows, num_columns, nnz] = dims[..] {
            return Ok(MatrixHeader {
                num_rows,
                num_columns,
                nnz,
            });
        }
        return Err(format_error(path, &format!("malformed size line {line:?}")));
    }
    Err(format_error(path, "missing size line"))
}

fn read_matrix_header(path: &Path) -> Result<MatrixHeader> {
    let mut lines = open_maybe_gz(path)?.lines();
    read_header(path, &mut lines)
}

fn read_matrix(path: &Path) -> Result<CountMatrix> {
    let mut lines = open_maybe_gz(path)?.lines();
    let header = read_header(path, &mut lines)?;
    let mut triplets = Vec::with_capacity(header.nnz);
    for line in lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let entry = (|| -> Option<(usize, usize, f64)> {
            let r: usize = fields.next()?.parse().ok()?;
            let c: usize = fields.next()?.parse().ok()?;
            let v: f64 = fields.next()?.parse().ok()?;
            if r == 0 || c == 0 || r > header.num_rows || c > header.num_columns {
                return None;
            }
            Some((r - 1, c - 1, v))
        })()
        .ok_or_else(|| format_error(path, &format!("malformed entry {line:?}")))?;
        triplets.push(entry);
    }
    if triplets.len() != header.nnz {
        return Err(format_error(
            path,
            &format!(
                "expected {} entries, found {}",
                header.nnz,
                triplets.len()
            ),
        ));
    }
    CountMatrix::from_triplets(header.num_rows, header.num_columns, triplets)
}

fn read_tsv(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(open_maybe_gz(path)?);
    reader
        .records()
        .map(|r| {
            Ok(r.with_context(|| path.display().to_string())?
                .iter()
                .map(str::to_string)
                .collect())
        })
        .collect()
}

fn columns_to_frame(num_rows: usize, names: &[String], records: &[Vec<String>]) -> Result<DataFrame> {
    let mut frame = DataFrame::new(num_rows);
    for (j, name) in names.iter().enumerate() {
        let values = records
            .iter()
            .map(|rec| rec.get(j).cloned().unwrap_or_default())
            .collect();
        frame.add_column(name, Column::infer(values))?;
    }
    Ok(frame)
}

/// Read a features file with one row per matrix row: id, name, type.
fn read_features(path: &Path, num_rows: usize) -> Result<DataFrame> {
    let records = read_tsv(path)?;
    if records.len() != num_rows {
        return Err(PipelineError::consistency(format!(
            "{} has {} lines for a matrix with {num_rows} rows",
            path.display(),
            records.len()
        ))
        .into());
    }
    let width = records.iter().map(Vec::len).max().unwrap_or(0);
    let names: Vec<String> = (0..width)
        .map(|j| match j {
            0 => "id".to_string(),
            1 => "name".to_string(),
            2 => TYPE_COLUMN.to_string(),
            _ => format!("V{}", j + 1),
        })
        .collect();
    let mut frame = DataFrame::new(num_rows);
    for (j, name) in names.iter().enumerate() {
        let values = records
            .iter()
            .map(|rec| rec.get(j).cloned().unwrap_or_default())
            .collect();
        frame.add_column(name, Column::Str(values))?;
    }
    Ok(frame)
}

/// Read a cell annotation table; a header line is present when the file has
/// one more line than there are cells.
fn read_annotations(path: &Path, num_columns: usize) -> Result<DataFrame> {
    let mut records = read_tsv(path)?;
    if records.len() == num_columns + 1 {
        let names = records.remove(0);
        return columns_to_frame(num_columns, &names, &records);
    }
    if records.len() == num_columns {
        let width = records.iter().map(Vec::len).max().unwrap_or(0);
        let names: Vec<String> = (0..width)
            .map(|j| {
                if j == 0 {
                    "barcode".to_string()
                } else {
                    format!("V{}", j + 1)
                }
            })
            .collect();
        return columns_to_frame(num_columns, &names, &records);
    }
    Err(PipelineError::consistency(format!(
        "{} has {} lines for a matrix with {num_columns} columns",
        path.display(),
        records.len()
    ))
    .into())
}

#[derive(Debug)]
struct Annotations {
    header: MatrixHeader,
    features: DataFrame,
    cells: DataFrame,
}

/// A Matrix Market dataset on disk.
#[derive(Debug)]
pub struct MatrixMarketDataset {
    matrix: PathBuf,
    features: Option<PathBuf>,
    annotations: Option<PathBuf>,
    mapping: BTreeMap<FeatureType, Modality>,
    default_modality: Modality,
    cache: Mutex<Option<Arc<Annotations>>>,
}

impl MatrixMarketDataset {
    pub fn new(matrix: impl Into<PathBuf>) -> Self {
        MatrixMarketDataset {
            matrix: matrix.into(),
            features: None,
            annotations: None,
            mapping: default_mapping(),
            default_modality: Modality::Rna,
            cache: Mutex::new(None),
        }
    }

    pub fn with_features(mut self, path: impl Into<PathBuf>) -> Self {
        self.features = Some(path.into());
        self
    }

    pub fn with_annotations(mut self, path: impl Into<PathBuf>) -> Self {
        self.annotations = Some(path.into());
        self
    }

    /// Override the feature type to modality mapping.
    pub fn with_mapping(mut self, mapping: BTreeMap<FeatureType, Modality>) -> Self {
        self.mapping = mapping;
        self
    }

    /// Modality used when the features file has no type column.
    pub fn with_default_modality(mut self, modality: Modality) -> Self {
        self.default_modality = modality;
        self
    }

    /// Rebuild from a serialized file list.
    pub fn unserialize(files: &[DatasetFile]) -> Result<Self> {
        let matrix = find_file(files, MATRIX_KIND).ok_or_else(|| {
            PipelineError::format(format!("{FORMAT} dataset without a {MATRIX_KIND:?} file"))
        })?;
        let mut dataset = MatrixMarketDataset::new(matrix);
        dataset.features = find_file(files, FEATURES_KIND).map(Path::to_path_buf);
        dataset.annotations = find_file(files, ANNOTATIONS_KIND).map(Path::to_path_buf);
        Ok(dataset)
    }

    fn annotations(&self) -> Result<Arc<Annotations>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("annotation cache lock poisoned"))?;
        if let Some(cached) = cache.as_ref() {
            return Ok(Arc::clone(cached));
        }
        let header = read_matrix_header(&self.matrix)?;
        let features = match &self.features {
            Some(path) => read_features(path, header.num_rows)?,
            None => DataFrame::new(header.num_rows),
        };
        let cells = match &self.annotations {
            Some(path) => read_annotations(path, header.num_columns)?,
            None => DataFrame::new(header.num_columns),
        };
        let loaded = Arc::new(Annotations {
            header,
            features,
            cells,
        });
        *cache = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    fn type_column(features: &DataFrame) -> Option<&'static str> {
        features.column(TYPE_COLUMN).map(|_| TYPE_COLUMN)
    }
}

impl Dataset for MatrixMarketDataset {
    fn format(&self) -> &'static str {
        FORMAT
    }

    fn abbreviate(&self) -> Result<DatasetSummary> {
        DatasetSummary::from_files(FORMAT, &self.serialize()?)
    }

    fn preflight(&self) -> Result<DatasetPreflight> {
        let annotations = self.annotations()?;
        // split annotations only, against an empty placeholder matrix
        let placeholder =
            CountMatrix::from_rows(0, vec![Vec::new(); annotations.header.num_rows])?;
        let split = split_by_feature_type(
            placeholder,
            annotations.features.clone(),
            Self::type_column(&annotations.features),
            &self.mapping,
            self.default_modality,
        )?;
        Ok(DatasetPreflight {
            features: split.features,
            cells: annotations.cells.clone(),
        })
    }

    fn load(&self, options: LoadOptions) -> Result<LoadedDataset> {
        let annotations = self
            .annotations()
            .with_context(|| format!("failed to read annotations for {:?}", self.matrix))?;
        let matrix = read_matrix(&self.matrix)?;
        info!(
            "loaded {} x {} matrix from {:?}",
            matrix.num_rows(),
            matrix.num_columns(),
            self.matrix
        );
        let split = split_by_feature_type(
            matrix,
            annotations.features.clone(),
            Self::type_column(&annotations.features),
            &self.mapping,
            self.default_modality,
        )?;
        if !options.cache {
            self.clear();
        }
        let loaded = LoadedDataset {
            matrices: split.matrices,
            row_ids: split.row_ids,
            features: split.features,
            cells: annotations.cells.clone(),
        };
        loaded.validate()?;
        Ok(loaded)
    }

    fn serialize(&self) -> Result<Vec<DatasetFile>> {
        let mut files = vec![DatasetFile::new(MATRIX_KIND, &self.matrix)];
        if let Some(path) = &self.features {
            files.push(DatasetFile::new(FEATURES_KIND, path));
        }
        if let Some(path) = &self.annotations {
            files.push(DatasetFile::new(ANNOTATIONS_KIND, path));
        }
        Ok(files)
    }

    fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}
