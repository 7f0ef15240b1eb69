//! Loading and combining the input datasets.

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{info, warn};
use sc_store::names::{PARAMETERS, RESULTS};
use sc_store::{EmbeddedSection, FileRecord, FileResolver, FileSink, Group};
use sc_types::{
    BlockFactor, CountMatrix, DataFrame, Dataset, DatasetFile, DatasetRegistry, DatasetSummary,
    LoadOptions, LoadedDataset, Modality, Owned, PipelineError, Shared, View,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::permute::Permuter;
use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::step::{Status, Step, StepState};

/// Cells kept by [`Inputs::subset`], stored beside the parameters.
const DIRECT_SUBSET: &str = "direct_subset";

/// Named datasets supplied to a run.
pub type DatasetMap = BTreeMap<String, Arc<dyn Dataset>>;

/// Cells to keep from the loaded data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellSubset {
    /// Cell positions in the loaded data.
    Indices(Vec<usize>),
    /// Cells whose annotation `field` takes one of `values`.
    Field { field: String, values: Vec<String> },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputsParams {
    /// Cell annotation holding the batch of each cell.
    pub block_factor: Option<String>,
    pub subset: Option<CellSubset>,
}

/// Everything read from the datasets, before subsetting.
#[derive(Debug)]
struct LoadedInputs {
    summaries: BTreeMap<String, DatasetSummary>,
    matrices: BTreeMap<Modality, Owned<CountMatrix>>,
    row_ids: BTreeMap<Modality, Vec<usize>>,
    features: BTreeMap<Modality, DataFrame>,
    cells: DataFrame,
    /// Dataset of origin of each cell when several datasets were combined.
    origin: Option<BlockFactor>,
}

#[derive(Debug)]
struct InputsCache {
    datasets: DatasetMap,
    original: Arc<LoadedInputs>,
    matrices: BTreeMap<Modality, Shared<CountMatrix>>,
    cells: DataFrame,
    block: Option<BlockFactor>,
    /// Positions of the current cells in the loaded data; `None` keeps all.
    cell_indices: Option<Vec<usize>>,
}

#[derive(Debug, Default)]
pub struct Inputs {
    status: Status,
    params: Option<InputsParams>,
    /// Subset applied by [`Inputs::subset`], taking precedence over the
    /// `subset` parameter.
    direct_subset: Option<Vec<usize>>,
    cache: Option<InputsCache>,
}

fn summarize(datasets: &DatasetMap) -> Result<BTreeMap<String, DatasetSummary>> {
    datasets
        .iter()
        .map(|(name, dataset)| {
            let summary = dataset
                .abbreviate()
                .with_context(|| format!("failed to summarize dataset {name:?}"))?;
            Ok((name.clone(), summary))
        })
        .collect()
}

fn modality_parts(
    data: &LoadedDataset,
    modality: Modality,
) -> Result<(&CountMatrix, &[usize], &DataFrame)> {
    let missing = || PipelineError::reference(format!("dataset has no {modality} data"));
    Ok((
        data.matrices.get(&modality).ok_or_else(missing)?,
        data.row_ids.get(&modality).ok_or_else(missing)?,
        data.features.get(&modality).ok_or_else(missing)?,
    ))
}

/// Feature identifiers: the first annotation column, or the row position.
fn feature_ids(features: &DataFrame, num_rows: usize) -> Vec<String> {
    match features.first_column() {
        Some(column) => column.to_strings(),
        None => (0..num_rows).map(|i| i.to_string()).collect(),
    }
}

fn load_datasets(
    datasets: &DatasetMap,
    summaries: BTreeMap<String, DatasetSummary>,
) -> Result<LoadedInputs> {
    if datasets.is_empty() {
        return Err(PipelineError::state("no datasets were supplied").into());
    }
    let mut loaded = Vec::with_capacity(datasets.len());
    for (name, dataset) in datasets {
        let data = dataset
            .load(LoadOptions { cache: false })
            .with_context(|| format!("failed to load dataset {name:?}"))?;
        data.validate()
            .with_context(|| format!("dataset {name:?} is inconsistent"))?;
        info!(
            "loaded dataset {name:?} ({}): {} cells, modalities {}",
            dataset.format(),
            data.num_cells(),
            data.modalities().join(", ")
        );
        loaded.push((name.clone(), data));
    }
    if loaded.len() == 1 {
        if let Some((_, data)) = loaded.pop() {
            return Ok(LoadedInputs {
                summaries,
                matrices: data
                    .matrices
                    .into_iter()
                    .map(|(m, x)| (m, Owned::new(x)))
                    .collect(),
                row_ids: data.row_ids,
                features: data.features,
                cells: data.cells,
                origin: None,
            });
        }
    }
    combine(summaries, &loaded)
}

/// Intersect features and concatenate cells of several datasets.
fn combine(
    summaries: BTreeMap<String, DatasetSummary>,
    loaded: &[(String, LoadedDataset)],
) -> Result<LoadedInputs> {
    let modalities: Vec<Modality> = Modality::ALL
        .into_iter()
        .filter(|m| loaded.iter().all(|(_, d)| d.matrices.contains_key(m)))
        .collect();
    for (name, data) in loaded {
        for m in data.modalities().filter(|m| !modalities.contains(m)) {
            warn!("ignoring {m} data of dataset {name:?}, it is not present in every dataset");
        }
    }
    if modalities.is_empty() {
        return Err(PipelineError::consistency("the datasets have no modality in common").into());
    }

    let mut matrices = BTreeMap::new();
    let mut row_ids = BTreeMap::new();
    let mut features = BTreeMap::new();
    for m in modalities {
        let parts = loaded
            .iter()
            .map(|(_, d)| modality_parts(d, m))
            .collect::<Result<Vec<_>>>()?;
        let ids: Vec<Vec<String>> = parts
            .iter()
            .map(|(matrix, _, frame)| feature_ids(frame, matrix.num_rows()))
            .collect();
        // first occurrence of each id
        let positions: Vec<HashMap<&str, usize>> = ids
            .iter()
            .map(|ids| {
                ids.iter()
                    .enumerate()
                    .rev()
                    .map(|(i, id)| (id.as_str(), i))
                    .collect()
            })
            .collect();
        let shared: Vec<usize> = (0..ids[0].len())
            .filter(|&r| {
                let id = ids[0][r].as_str();
                positions[0].get(id) == Some(&r) && positions[1..].iter().all(|p| p.contains_key(id))
            })
            .collect();
        info!(
            "{m}: {} features shared by {} datasets",
            shared.len(),
            loaded.len()
        );

        let mut subsets = Vec::with_capacity(parts.len());
        for ((matrix, _, _), position) in parts.iter().zip(&positions) {
            let rows: Vec<usize> = shared
                .iter()
                .filter_map(|&r| position.get(ids[0][r].as_str()).copied())
                .collect();
            subsets.push(matrix.subset_rows(&rows)?);
        }
        let refs: Vec<&CountMatrix> = subsets.iter().collect();
        matrices.insert(m, Owned::new(CountMatrix::cbind(&refs)?));
        let (_, first_ids, first_features) = parts[0];
        row_ids.insert(m, shared.iter().map(|&r| first_ids[r]).collect());
        features.insert(m, first_features.subset_rows(&shared)?);
    }

    let frames: Vec<&DataFrame> = loaded.iter().map(|(_, d)| &d.cells).collect();
    let labels: Vec<String> = loaded
        .iter()
        .flat_map(|(name, d)| std::iter::repeat(name.clone()).take(d.num_cells()))
        .collect();
    Ok(LoadedInputs {
        summaries,
        matrices,
        row_ids,
        features,
        cells: DataFrame::concat(&frames),
        origin: Some(BlockFactor::from_labels(&labels)),
    })
}

fn resolve_subset(original: &LoadedInputs, subset: &CellSubset) -> Result<Vec<usize>> {
    let num_cells = original.cells.num_rows();
    match subset {
        CellSubset::Indices(indices) => {
            if let Some(&bad) = indices.iter().find(|&&i| i >= num_cells) {
                return Err(PipelineError::consistency(format!(
                    "subset index {bad} is out of range for {num_cells} cells"
                ))
                .into());
            }
            Ok(indices.clone())
        }
        CellSubset::Field { field, values } => {
            let column = original.cells.column(field).ok_or_else(|| {
                PipelineError::reference(format!("no cell annotation named {field:?}"))
            })?;
            Ok(column
                .to_strings()
                .iter()
                .enumerate()
                .filter(|(_, v)| values.contains(v))
                .map(|(i, _)| i)
                .collect())
        }
    }
}

fn resolve_block(original: &LoadedInputs, name: Option<&str>) -> Result<Option<BlockFactor>> {
    Ok(match (&original.origin, name) {
        (Some(origin), Some(name)) => {
            warn!("ignoring block factor {name:?}, cells are blocked by dataset");
            Some(origin.clone())
        }
        (Some(origin), None) => Some(origin.clone()),
        (None, Some(name)) => {
            let column = original.cells.column(name).ok_or_else(|| {
                PipelineError::reference(format!("no cell annotation named {name:?}"))
            })?;
            Some(BlockFactor::from_labels(&column.to_strings()))
        }
        (None, None) => None,
    })
}

fn build_cache(
    datasets: DatasetMap,
    original: Arc<LoadedInputs>,
    params: &InputsParams,
    direct_subset: Option<&[usize]>,
) -> Result<InputsCache> {
    let subset = match direct_subset {
        Some(indices) => Some(CellSubset::Indices(indices.to_vec())),
        None => params.subset.clone(),
    };
    let cell_indices = subset
        .map(|s| resolve_subset(&original, &s))
        .transpose()?;
    let block = resolve_block(&original, params.block_factor.as_deref())?;

    let mut matrices = BTreeMap::new();
    for (modality, matrix) in &original.matrices {
        let current = match &cell_indices {
            None => Shared::View(matrix.view()),
            Some(indices) => Shared::Owned(Owned::new(matrix.subset_columns(indices)?)),
        };
        matrices.insert(*modality, current);
    }
    let (cells, block) = match &cell_indices {
        None => (original.cells.clone(), block),
        Some(indices) => {
            info!("keeping {} of {} cells", indices.len(), original.cells.num_rows());
            (
                original.cells.subset_rows(indices)?,
                block.map(|b| b.subset(indices)).transpose()?,
            )
        }
    };
    Ok(InputsCache {
        datasets,
        original,
        matrices,
        cells,
        block,
        cell_indices,
    })
}

impl Inputs {
    pub fn new() -> Self {
        Inputs::default()
    }

    /// Load the datasets, or reuse the loaded data when their summaries are
    /// unchanged. `datasets` may be omitted after the first run.
    pub fn compute(&mut self, datasets: Option<&DatasetMap>, params: InputsParams) -> Result<()> {
        let summaries = datasets.map(summarize).transpose()?;
        let reload = match (&summaries, &self.cache) {
            (None, None) => {
                return Err(
                    PipelineError::state("no datasets were supplied for the first run").into(),
                )
            }
            (None, Some(_)) => false,
            (Some(_), None) => true,
            (Some(s), Some(cache)) => *s != cache.original.summaries,
        };
        let needed = reload || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::Inputs, needed) {
            return Ok(());
        }

        let (datasets, original) = match (datasets, summaries, &self.cache) {
            (Some(d), Some(s), _) if reload => (d.clone(), Arc::new(load_datasets(d, s)?)),
            (_, _, Some(cache)) => (cache.datasets.clone(), Arc::clone(&cache.original)),
            _ => return Err(PipelineError::state("inputs have no data to reuse").into()),
        };
        let cache = build_cache(datasets, original, &params, self.direct_subset.as_deref())?;
        info!(
            "inputs: {} cells, modalities {}",
            cache.cells.num_rows(),
            cache.matrices.keys().join(", ")
        );
        self.cache = Some(cache);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    /// Mark the inputs as changed so every downstream step recomputes.
    pub(crate) fn force_changed(&mut self) {
        self.status.set_changed(true);
    }

    /// A new step holding a subset of the loaded cells, without reading the
    /// datasets again. `indices` refer to the current cells, or to the loaded
    /// data when `on_original` is set.
    pub fn subset(&self, indices: &[usize], on_original: bool) -> Result<Inputs> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| PipelineError::state("inputs have not been loaded"))?;
        let composed: Vec<usize> = match (&cache.cell_indices, on_original) {
            (Some(current), false) => indices
                .iter()
                .map(|&i| {
                    current.get(i).copied().ok_or_else(|| {
                        PipelineError::consistency(format!(
                            "subset index {i} is out of range for {} cells",
                            current.len()
                        ))
                        .into()
                    })
                })
                .collect::<Result<_>>()?,
            _ => indices.to_vec(),
        };
        let params = self.fetch_parameters();
        let subset_cache = build_cache(
            cache.datasets.clone(),
            Arc::clone(&cache.original),
            &params,
            Some(&composed),
        )?;
        Ok(Inputs {
            status: Status::default(),
            params: Some(params),
            direct_subset: Some(composed),
            cache: Some(subset_cache),
        })
    }

    pub fn fetch_parameters(&self) -> InputsParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn modalities(&self) -> Vec<Modality> {
        self.cache
            .as_ref()
            .map(|c| c.matrices.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_modality(&self, modality: Modality) -> bool {
        self.cache
            .as_ref()
            .map_or(false, |c| c.matrices.contains_key(&modality))
    }

    pub fn fetch_matrix(&self, modality: Modality) -> Option<View<CountMatrix>> {
        self.cache.as_ref()?.matrices.get(&modality).map(Shared::view)
    }

    /// The matrix as loaded, before any subsetting.
    pub fn fetch_original_matrix(&self, modality: Modality) -> Option<View<CountMatrix>> {
        self.cache
            .as_ref()?
            .original
            .matrices
            .get(&modality)
            .map(Owned::view)
    }

    pub fn fetch_features(&self, modality: Modality) -> Option<&DataFrame> {
        self.cache.as_ref()?.original.features.get(&modality)
    }

    pub fn fetch_row_ids(&self, modality: Modality) -> Option<&[usize]> {
        self.cache
            .as_ref()?
            .original
            .row_ids
            .get(&modality)
            .map(Vec::as_slice)
    }

    pub fn fetch_cells(&self) -> Option<&DataFrame> {
        self.cache.as_ref().map(|c| &c.cells)
    }

    pub fn fetch_block(&self) -> Option<&BlockFactor> {
        self.cache.as_ref()?.block.as_ref()
    }

    pub fn fetch_cell_indices(&self) -> Option<&[usize]> {
        self.cache.as_ref()?.cell_indices.as_deref()
    }

    pub fn fetch_datasets(&self) -> Option<&DatasetMap> {
        self.cache.as_ref().map(|c| &c.datasets)
    }

    pub fn num_cells(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.cells.num_rows())
    }

    /// Write parameters, the dataset file table and the loaded dimensions.
    /// Raw files are registered with `sink`.
    pub fn serialize(&self, group: &mut Group, sink: &mut FileSink) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(indices) = &self.direct_subset {
            group.write(DIRECT_SUBSET, &indices[..]);
        }
        let Some(cache) = &self.cache else {
            return Ok(());
        };

        let table = group.create_group(PARAMETERS).create_group("datasets");
        for (i, (name, dataset)) in cache.datasets.iter().enumerate() {
            let entry = table.create_group(&i.to_string());
            entry.write("name", name.as_str());
            entry.write("format", dataset.format());
            let files = entry.create_group("files");
            let serialized = dataset
                .serialize()
                .with_context(|| format!("failed to serialize dataset {name:?}"))?;
            for (j, file) in serialized.iter().enumerate() {
                let f = files.create_group(&j.to_string());
                f.write("kind", file.kind.as_str());
                f.write("name", file.name());
                sink.add(&file.path)?.write(f);
            }
        }

        let results = group.create_group(RESULTS);
        results.write("num_cells", self.num_cells());
        let num_features = results.create_group("num_features");
        for (modality, matrix) in &cache.matrices {
            num_features.write(modality.as_str(), matrix.num_rows());
        }
        let row_ids = results.create_group("row_ids");
        for (modality, ids) in &cache.original.row_ids {
            row_ids.write(modality.as_str(), &ids[..]);
        }
        Ok(())
    }

    /// Rebuild the datasets from the file table, load them, and compare the
    /// loaded features with the saved ones.
    pub fn unserialize(
        group: &Group,
        registry: &DatasetRegistry,
        resolver: &mut dyn FileResolver,
        embedded: Option<&EmbeddedSection>,
    ) -> Result<(Inputs, Permuter)> {
        let params: InputsParams = read_step_parameters(group)?;
        let table = group
            .group(PARAMETERS)
            .and_then(|p| p.group("datasets"))
            .context("saved inputs do not list their datasets")?;

        let mut datasets: DatasetMap = BTreeMap::new();
        for i in 0.. {
            let Some(entry) = table.group_opt(&i.to_string()) else {
                break;
            };
            let name: String = entry.read("name")?;
            let format: String = entry.read("format")?;
            let file_table = entry.group("files")?;
            let mut files = Vec::new();
            for j in 0.. {
                let Some(f) = file_table.group_opt(&j.to_string()) else {
                    break;
                };
                let kind: String = f.read("kind")?;
                let file_name: String = f.read("name")?;
                let record = FileRecord::read(f)
                    .with_context(|| format!("failed to read file record {file_name:?}"))?;
                let path = resolver.resolve(&file_name, &record, embedded)?;
                files.push(DatasetFile::new(&kind, path));
            }
            let dataset = registry
                .unserialize(&format, &files)
                .with_context(|| format!("failed to rebuild dataset {name:?}"))?;
            datasets.insert(name, dataset);
        }

        let mut inputs = Inputs::new();
        inputs.direct_subset = group.read_opt(DIRECT_SUBSET)?;
        inputs.compute(Some(&datasets), params)?;
        inputs.status = Status::restored();

        let permuter = match results(group) {
            None => Permuter::identity(),
            Some(saved) => {
                if let Some(num_cells) = saved.read_opt::<usize>("num_cells")? {
                    sc_types::error::check_length("reloaded cells", inputs.num_cells(), num_cells)?;
                }
                match saved.group_opt("row_ids") {
                    None => Permuter::identity(),
                    Some(ids) => {
                        let mut before = BTreeMap::new();
                        for name in ids.names() {
                            before.insert(name.parse::<Modality>()?, ids.read::<Vec<usize>>(name)?);
                        }
                        let now: BTreeMap<Modality, Vec<usize>> = inputs
                            .cache
                            .as_ref()
                            .map(|c| c.original.row_ids.clone())
                            .unwrap_or_default();
                        Permuter::new(&before, &now)?
                    }
                }
            }
        };
        Ok((inputs, permuter))
    }
}

impl StepState for Inputs {
    fn step(&self) -> Step {
        Step::Inputs
    }

    fn changed(&self) -> bool {
        self.status.changed()
    }

    fn free(&mut self) {
        if let Some(cache) = self.cache.take() {
            for dataset in cache.datasets.values() {
                dataset.clear();
            }
        }
        self.status.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_dataset, MemoryDataset};
    use pretty_assertions::assert_eq;

    fn datasets(entries: Vec<(&str, MemoryDataset)>) -> DatasetMap {
        entries
            .into_iter()
            .map(|(name, d)| (name.to_string(), Arc::new(d) as Arc<dyn Dataset>))
            .collect()
    }

    #[test]
    fn test_unchanged_inputs_are_not_reloaded() -> Result<()> {
        let dataset = memory_dataset(20, 30, 1);
        let loads = dataset.load_counter();
        let map = datasets(vec![("main", dataset)]);
        let mut inputs = Inputs::new();
        inputs.compute(Some(&map), InputsParams::default())?;
        assert!(inputs.changed());
        let before = inputs.fetch_matrix(Modality::Rna).map(|m| m.as_ptr());

        inputs.compute(Some(&map), InputsParams::default())?;
        assert!(!inputs.changed());
        inputs.compute(None, InputsParams::default())?;
        assert!(!inputs.changed());
        assert_eq!(inputs.fetch_matrix(Modality::Rna).map(|m| m.as_ptr()), before);
        assert_eq!(loads.get(), 1);
        Ok(())
    }

    #[test]
    fn test_subset_parameter_does_not_reload() -> Result<()> {
        let dataset = memory_dataset(10, 12, 2);
        let loads = dataset.load_counter();
        let map = datasets(vec![("main", dataset)]);
        let mut inputs = Inputs::new();
        inputs.compute(Some(&map), InputsParams::default())?;
        let params = InputsParams {
            subset: Some(CellSubset::Indices(vec![0, 2, 4])),
            ..Default::default()
        };
        inputs.compute(Some(&map), params)?;
        assert!(inputs.changed());
        assert_eq!(inputs.num_cells(), 3);
        assert_eq!(inputs.fetch_matrix(Modality::Rna).map(|m| m.num_columns()), Some(3));
        assert_eq!(loads.get(), 1);
        Ok(())
    }

    #[test]
    fn test_first_run_needs_datasets() {
        let err = Inputs::new()
            .compute(None, InputsParams::default())
            .unwrap_err();
        assert!(matches!(
            sc_types::error::find_pipeline_error(&err),
            Some(PipelineError::State(_))
        ));
    }

    #[test]
    fn test_multiple_datasets_intersect_features() -> Result<()> {
        let first = memory_dataset(6, 4, 3).with_feature_ids(&["a", "b", "c", "d", "e", "f"]);
        let second = memory_dataset(4, 5, 4).with_feature_ids(&["f", "x", "b", "d"]);
        let map = datasets(vec![("first", first), ("second", second)]);
        let mut inputs = Inputs::new();
        let params = InputsParams {
            block_factor: Some("ignored".into()),
            ..Default::default()
        };
        inputs.compute(Some(&map), params)?;
        assert_eq!(inputs.num_cells(), 9);
        assert_eq!(inputs.fetch_row_ids(Modality::Rna), Some(&[1usize, 3, 5][..]));
        let block = inputs.fetch_block().cloned().unwrap();
        assert_eq!(block.levels(), &["first".to_string(), "second".to_string()]);
        assert_eq!(block.ids(), &[0, 0, 0, 0, 1, 1, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_subset_of_subset() -> Result<()> {
        let dataset = memory_dataset(5, 10, 5);
        let loads = dataset.load_counter();
        let map = datasets(vec![("main", dataset)]);
        let mut inputs = Inputs::new();
        inputs.compute(Some(&map), InputsParams::default())?;

        let first = inputs.subset(&[1, 3, 5, 7], false)?;
        assert_eq!(first.fetch_cell_indices(), Some(&[1usize, 3, 5, 7][..]));
        let second = first.subset(&[0, 3], false)?;
        assert_eq!(second.fetch_cell_indices(), Some(&[1usize, 7][..]));
        let third = first.subset(&[0, 3], true)?;
        assert_eq!(third.fetch_cell_indices(), Some(&[0usize, 3][..]));
        // the source state is untouched
        assert_eq!(inputs.num_cells(), 10);
        assert_eq!(loads.get(), 1);
        Ok(())
    }
}
