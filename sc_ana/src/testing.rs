//! Simulated datasets and pre-built pipelines for unit tests.

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sc_types::dataset::DatasetPreflight;
use sc_types::mtx::MatrixMarketDataset;
use sc_types::{
    Column, CountMatrix, DataFrame, Dataset, DatasetFile, DatasetSummary, LoadOptions,
    LoadedDataset, Modality,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::steps::*;

pub(crate) const NUM_CLUSTERS: usize = 3;

/// Counts with `NUM_CLUSTERS` groups of cells, each with its own up-regulated
/// features. `scale` multiplies every mean.
fn clustered_counts(
    num_features: usize,
    num_cells: usize,
    scale: f64,
    rng: &mut Pcg64,
) -> Result<CountMatrix> {
    let mut rows = Vec::with_capacity(num_features);
    for r in 0..num_features {
        let row = (0..num_cells)
            .map(|c| {
                let mean = if r % NUM_CLUSTERS == c % NUM_CLUSTERS {
                    12.0
                } else {
                    3.0
                };
                (mean * scale * rng.gen_range(0.3..1.7)).round()
            })
            .collect();
        rows.push(row);
    }
    CountMatrix::from_dense(num_cells, &rows)
}

/// One dominant guide per cell.
fn guide_counts(num_guides: usize, num_cells: usize, rng: &mut Pcg64) -> Result<CountMatrix> {
    let rows: Vec<Vec<f64>> = (0..num_guides)
        .map(|g| {
            (0..num_cells)
                .map(|c| {
                    if c % num_guides == g {
                        rng.gen_range(20.0_f64..40.0).round()
                    } else {
                        rng.gen_range(0.0_f64..3.0).round()
                    }
                })
                .collect()
        })
        .collect();
    CountMatrix::from_dense(num_cells, &rows)
}

fn feature_frame(prefix: &str, n: usize) -> Result<DataFrame> {
    let mut frame = DataFrame::new(n);
    frame.add_column("id", Column::Str((0..n).map(|i| format!("{prefix}-{i}")).collect()))?;
    frame.add_column(
        "name",
        Column::Str((0..n).map(|i| format!("{}-{i}", prefix.to_uppercase())).collect()),
    )?;
    Ok(frame)
}

fn cell_frame(prefix: &str, n: usize) -> Result<DataFrame> {
    let mut frame = DataFrame::new(n);
    frame.add_column(
        "barcode",
        Column::Str((0..n).map(|i| format!("{prefix}{i}")).collect()),
    )?;
    frame.add_column(
        "sample",
        Column::Str((0..n).map(|i| format!("s{}", i % 2)).collect()),
    )?;
    Ok(frame)
}

/// Number of times a dataset was loaded.
#[derive(Clone, Debug, Default)]
pub(crate) struct LoadCounter(Arc<AtomicUsize>);

impl LoadCounter {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A dataset held in memory. It has no files, so it cannot be persisted.
#[derive(Debug)]
pub(crate) struct MemoryDataset {
    tag: String,
    matrices: BTreeMap<Modality, CountMatrix>,
    features: BTreeMap<Modality, DataFrame>,
    cells: DataFrame,
    loads: LoadCounter,
}

impl MemoryDataset {
    fn new(tag: String, cells: DataFrame) -> Self {
        MemoryDataset {
            tag,
            matrices: BTreeMap::new(),
            features: BTreeMap::new(),
            cells,
            loads: LoadCounter::default(),
        }
    }

    fn with_modality(mut self, modality: Modality, matrix: CountMatrix, features: DataFrame) -> Self {
        self.matrices.insert(modality, matrix);
        self.features.insert(modality, features);
        self
    }

    pub(crate) fn load_counter(&self) -> LoadCounter {
        self.loads.clone()
    }

    /// Replace the RNA feature identifiers.
    pub(crate) fn with_feature_ids(mut self, ids: &[&str]) -> Self {
        let mut frame = DataFrame::new(ids.len());
        frame
            .add_column("id", Column::Str(ids.iter().map(|s| s.to_string()).collect()))
            .unwrap();
        self.features.insert(Modality::Rna, frame);
        self
    }

    pub(crate) fn num_cells(&self) -> usize {
        self.cells.num_rows()
    }
}

impl Dataset for MemoryDataset {
    fn format(&self) -> &'static str {
        "Memory"
    }

    fn abbreviate(&self) -> Result<DatasetSummary> {
        Ok(DatasetSummary {
            format: "Memory".into(),
            files: self
                .matrices
                .iter()
                .map(|(m, x)| (m.to_string(), self.tag.clone(), x.nnz() as u64))
                .collect(),
        })
    }

    fn preflight(&self) -> Result<DatasetPreflight> {
        Ok(DatasetPreflight {
            features: self.features.clone(),
            cells: self.cells.clone(),
        })
    }

    fn load(&self, _options: LoadOptions) -> Result<LoadedDataset> {
        self.loads.0.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedDataset {
            matrices: self.matrices.clone(),
            row_ids: self
                .matrices
                .iter()
                .map(|(m, x)| (*m, (0..x.num_rows()).collect()))
                .collect(),
            features: self.features.clone(),
            cells: self.cells.clone(),
        })
    }

    fn serialize(&self) -> Result<Vec<DatasetFile>> {
        Ok(Vec::new())
    }

    fn clear(&self) {}
}

/// RNA-only dataset with clustered counts.
pub(crate) fn memory_dataset(num_features: usize, num_cells: usize, seed: u64) -> MemoryDataset {
    scaled_dataset("cell", num_features, num_cells, 1.0, seed)
}

fn scaled_dataset(
    prefix: &str,
    num_features: usize,
    num_cells: usize,
    scale: f64,
    seed: u64,
) -> MemoryDataset {
    let mut rng = Pcg64::seed_from_u64(seed);
    let counts = clustered_counts(num_features, num_cells, scale, &mut rng).unwrap();
    MemoryDataset::new(format!("{prefix}-{seed}"), cell_frame(prefix, num_cells).unwrap())
        .with_modality(Modality::Rna, counts, feature_frame("gene", num_features).unwrap())
}

/// RNA, ADT and CRISPR data for the same cells.
pub(crate) fn multimodal_memory_dataset(num_cells: usize, seed: u64) -> MemoryDataset {
    let mut rng = Pcg64::seed_from_u64(seed);
    let rna = clustered_counts(30, num_cells, 1.0, &mut rng).unwrap();
    let adt = clustered_counts(8, num_cells, 4.0, &mut rng).unwrap();
    let crispr = guide_counts(4, num_cells, &mut rng).unwrap();
    MemoryDataset::new(format!("multi-{seed}"), cell_frame("cell", num_cells).unwrap())
        .with_modality(Modality::Rna, rna, feature_frame("gene", 30).unwrap())
        .with_modality(Modality::Adt, adt, feature_frame("adt", 8).unwrap())
        .with_modality(Modality::Crispr, crispr, feature_frame("guide", 4).unwrap())
}

fn as_map(entries: Vec<(&str, MemoryDataset)>) -> DatasetMap {
    entries
        .into_iter()
        .map(|(name, d)| (name.to_string(), Arc::new(d) as Arc<dyn Dataset>))
        .collect()
}

pub(crate) fn single_dataset(num_features: usize, num_cells: usize, seed: u64) -> DatasetMap {
    as_map(vec![("main", memory_dataset(num_features, num_cells, seed))])
}

pub(crate) fn multimodal_dataset(num_cells: usize, seed: u64) -> DatasetMap {
    as_map(vec![("main", multimodal_memory_dataset(num_cells, seed))])
}

/// Two datasets sharing their features, the second with doubled counts.
pub(crate) fn batched_dataset(num_features: usize, num_cells: usize, seed: u64) -> DatasetMap {
    as_map(vec![
        ("first", scaled_dataset("a", num_features, num_cells, 1.0, seed)),
        ("second", scaled_dataset("b", num_features, num_cells, 2.0, seed + 1)),
    ])
}

fn feature_type(modality: Modality) -> &'static str {
    match modality {
        Modality::Rna => "Gene Expression",
        Modality::Adt => "Antibody Capture",
        Modality::Crispr => "CRISPR Guide Capture",
    }
}

/// Write `dataset` as a typed Matrix Market dataset under `dir`, with
/// modalities stacked in row order.
pub(crate) fn write_matrix_market(
    dataset: &MemoryDataset,
    dir: &Path,
    prefix: &str,
) -> Result<MatrixMarketDataset> {
    let num_cells = dataset.num_cells();
    let mut entries = String::new();
    let mut features = String::new();
    let mut offset = 0;
    let mut nnz = 0;
    for (modality, matrix) in &dataset.matrices {
        let ids = dataset.features[modality].first_column().map(Column::to_strings);
        for (r, (indices, values)) in matrix.rows().enumerate() {
            for (&c, &v) in indices.iter().zip(values) {
                writeln!(entries, "{} {} {}", offset + r + 1, c + 1, v)?;
                nnz += 1;
            }
            let id = ids
                .as_ref()
                .and_then(|ids| ids.get(r).cloned())
                .unwrap_or_else(|| format!("{modality}-{r}"));
            writeln!(features, "{id}\t{}\t{}", id.to_uppercase(), feature_type(*modality))?;
        }
        offset += matrix.num_rows();
    }
    let mtx = format!(
        "%%MatrixMarket matrix coordinate integer general\n{offset} {num_cells} {nnz}\n{entries}"
    );

    let mut cells = String::from("barcode\tsample\n");
    let barcodes = dataset.cells.column("barcode").map(Column::to_strings);
    let samples = dataset.cells.column("sample").map(Column::to_strings);
    for c in 0..num_cells {
        let get = |col: &Option<Vec<String>>| col.as_ref().and_then(|v| v.get(c).cloned());
        writeln!(
            cells,
            "{}\t{}",
            get(&barcodes).unwrap_or_else(|| format!("cell{c}")),
            get(&samples).unwrap_or_default()
        )?;
    }

    let matrix_path = dir.join(format!("{prefix}.mtx"));
    let features_path = dir.join(format!("{prefix}_features.tsv"));
    let cells_path = dir.join(format!("{prefix}_barcodes.tsv"));
    std::fs::write(&matrix_path, mtx)?;
    std::fs::write(&features_path, features)?;
    std::fs::write(&cells_path, cells)?;
    Ok(MatrixMarketDataset::new(matrix_path)
        .with_features(features_path)
        .with_annotations(cells_path))
}

/// Steps up to normalization, computed with default parameters.
pub(crate) struct Pipeline {
    pub inputs: Inputs,
    pub rna_qc: RnaQualityControl,
    pub adt_qc: AdtQualityControl,
    pub crispr_qc: CrisprQualityControl,
    pub filtering: CellFiltering,
    pub rna_norm: RnaNormalization,
    pub adt_norm: AdtNormalization,
    pub crispr_norm: CrisprNormalization,
}

impl Pipeline {
    fn from_datasets(datasets: &DatasetMap) -> Result<Pipeline> {
        let mut inputs = Inputs::new();
        inputs.compute(Some(datasets), InputsParams::default())?;
        let mut p = Pipeline {
            inputs,
            rna_qc: RnaQualityControl::new(),
            adt_qc: AdtQualityControl::new(),
            crispr_qc: CrisprQualityControl::new(),
            filtering: CellFiltering::new(),
            rna_norm: RnaNormalization::new(),
            adt_norm: AdtNormalization::new(),
            crispr_norm: CrisprNormalization::new(),
        };
        p.run_downstream()?;
        Ok(p)
    }

    pub fn rna_only(num_features: usize, num_cells: usize, seed: u64) -> Result<Pipeline> {
        Self::from_datasets(&single_dataset(num_features, num_cells, seed))
    }

    pub fn multimodal(num_cells: usize, seed: u64) -> Result<Pipeline> {
        Self::from_datasets(&multimodal_dataset(num_cells, seed))
    }

    /// Two batches of `num_cells` cells each.
    pub fn batched(num_features: usize, num_cells: usize, seed: u64) -> Result<Pipeline> {
        Self::from_datasets(&batched_dataset(num_features, num_cells, seed))
    }

    fn run_downstream(&mut self) -> Result<()> {
        self.rna_qc.compute(&self.inputs, self.rna_qc.fetch_parameters())?;
        self.adt_qc.compute(&self.inputs, self.adt_qc.fetch_parameters())?;
        self.crispr_qc
            .compute(&self.inputs, self.crispr_qc.fetch_parameters())?;
        self.filtering.compute(
            &self.inputs,
            &self.rna_qc,
            &self.adt_qc,
            &self.crispr_qc,
            self.filtering.fetch_parameters(),
        )?;
        self.rna_norm
            .compute(&self.rna_qc, &self.filtering, self.rna_norm.fetch_parameters())?;
        self.adt_norm
            .compute(&self.adt_qc, &self.filtering, self.adt_norm.fetch_parameters())?;
        self.crispr_norm.compute(
            &self.crispr_qc,
            &self.filtering,
            self.crispr_norm.fetch_parameters(),
        )?;
        Ok(())
    }

    /// Recompute with unchanged parameters, so no step reports a change.
    pub fn rerun(&mut self) -> Result<()> {
        self.inputs.compute(None, self.inputs.fetch_parameters())?;
        self.run_downstream()
    }

    pub fn normalized(&self) -> [&dyn NormalizedSource; 3] {
        [&self.rna_norm, &self.adt_norm, &self.crispr_norm]
    }

    /// Run every step up to the chosen clustering, with small embeddings.
    pub fn embed(self) -> Result<Embedded> {
        let num_features = self
            .inputs
            .fetch_matrix(Modality::Rna)
            .map_or(0, |m| m.num_rows());
        let mut e = Embedded {
            pipeline: self,
            selection: FeatureSelection::new(),
            rna_pca: RnaPca::new(),
            adt_pca: AdtPca::new(),
            crispr_pca: CrisprPca::new(),
            combined: CombineEmbeddings::new(),
            corrected: BatchCorrection::new(),
            index: NeighborIndexStep::new(),
            snn: SnnGraphCluster::new(),
            kmeans: KmeansCluster::new(),
            choose: ChooseClustering::new(),
        };
        e.compute(
            RnaPcaParams {
                num_hvgs: num_features,
                num_pcs: 5,
                ..Default::default()
            },
            AdtPcaParams {
                num_pcs: 5,
                ..Default::default()
            },
            CrisprPcaParams {
                num_pcs: 3,
                ..Default::default()
            },
        )?;
        Ok(e)
    }
}

/// A [`Pipeline`] carried through to clustering.
pub(crate) struct Embedded {
    pub pipeline: Pipeline,
    pub selection: FeatureSelection,
    pub rna_pca: RnaPca,
    pub adt_pca: AdtPca,
    pub crispr_pca: CrisprPca,
    pub combined: CombineEmbeddings,
    pub corrected: BatchCorrection,
    pub index: NeighborIndexStep,
    pub snn: SnnGraphCluster,
    pub kmeans: KmeansCluster,
    pub choose: ChooseClustering,
}

impl Embedded {
    fn compute(
        &mut self,
        rna_pca: RnaPcaParams,
        adt_pca: AdtPcaParams,
        crispr_pca: CrisprPcaParams,
    ) -> Result<()> {
        let p = &self.pipeline;
        self.selection
            .compute(&p.filtering, &p.rna_norm, self.selection.fetch_parameters())?;
        self.rna_pca
            .compute(&self.selection, &p.rna_norm, &p.filtering, rna_pca)?;
        self.adt_pca
            .compute(&self.selection, &p.adt_norm, &p.filtering, adt_pca)?;
        self.crispr_pca
            .compute(&self.selection, &p.crispr_norm, &p.filtering, crispr_pca)?;
        self.combined.compute(
            &[&self.rna_pca, &self.adt_pca, &self.crispr_pca],
            self.combined.fetch_parameters(),
        )?;
        self.corrected.compute(
            &p.filtering,
            &self.combined,
            self.corrected.fetch_parameters(),
        )?;
        self.index
            .compute(&self.corrected, self.index.fetch_parameters())?;
        self.snn
            .compute(&self.index, self.snn.fetch_parameters(), true)?;
        self.kmeans
            .compute(&self.corrected, self.kmeans.fetch_parameters(), false)?;
        self.choose
            .compute(&self.snn, &self.kmeans, self.choose.fetch_parameters())?;
        Ok(())
    }

    /// Recompute everything with unchanged parameters.
    pub fn rerun(&mut self) -> Result<()> {
        self.pipeline.rerun()?;
        self.compute(
            self.rna_pca.fetch_parameters(),
            self.adt_pca.fetch_parameters(),
            self.crispr_pca.fetch_parameters(),
        )
    }
}
