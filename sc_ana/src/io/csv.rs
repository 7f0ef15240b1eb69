//! CSV export of embeddings, clusters, markers and labels

use anyhow::{Context, Result};
use log::info;
use sc_types::{DataFrame, Modality, PipelineError};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::analysis::Analysis;
use crate::markers::{GroupMarkers, Summary};
use crate::steps::Coordinates;

/// Barcodes of the cells that survived filtering, falling back to positions
/// when the cells carry no annotation.
fn retained_barcodes(analysis: &Analysis) -> Result<Vec<String>> {
    let retained = analysis
        .cell_filtering
        .retained_indices()
        .ok_or_else(|| PipelineError::state("cell filtering has not been computed"))?;
    let names = analysis
        .inputs
        .fetch_cells()
        .and_then(DataFrame::first_column)
        .map(|c| c.to_strings());
    Ok(retained
        .into_iter()
        .map(|c| match &names {
            Some(names) => names[c].clone(),
            None => format!("cell-{c}"),
        })
        .collect())
}

fn feature_labels(analysis: &Analysis, modality: Modality, n: usize) -> (Vec<String>, Vec<String>) {
    let frame = analysis.inputs.fetch_features(modality);
    let ids = frame
        .and_then(DataFrame::first_column)
        .map(|c| c.to_strings())
        .unwrap_or_else(|| (0..n).map(|i| format!("feature-{i}")).collect());
    let names = frame
        .and_then(|f| f.column("name"))
        .map(|c| c.to_strings())
        .unwrap_or_else(|| ids.clone());
    (ids, names)
}

pub(crate) fn save_embedding(
    path: &Path,
    key: &str,
    coordinates: &Coordinates,
    barcodes: &[String],
) -> Result<()> {
    if coordinates.len() != barcodes.len() {
        return Err(PipelineError::consistency(format!(
            "{key} has {} cells, expected {}",
            coordinates.len(),
            barcodes.len()
        ))
        .into());
    }
    let component_dir = path.join(format!("{key}_components"));
    create_dir_all(&component_dir)?;
    let upper = key.to_uppercase();
    let mut file = BufWriter::new(File::create(component_dir.join("projection.csv"))?);
    writeln!(file, "Barcode,{upper}-1,{upper}-2")?;
    for (i, barcode) in barcodes.iter().enumerate() {
        writeln!(file, "{barcode},{},{}", coordinates.x[i], coordinates.y[i])?;
    }
    file.flush()?;
    Ok(())
}

/// Clusters are written 1-based.
pub(crate) fn save_clustering(
    path: &Path,
    key: &str,
    labels: &[usize],
    barcodes: &[String],
) -> Result<()> {
    let clustering_dir = path.join(key);
    create_dir_all(&clustering_dir)?;
    let mut file = BufWriter::new(File::create(clustering_dir.join("clusters.csv"))?);
    writeln!(file, "Barcode,Cluster")?;
    for (barcode, label) in barcodes.iter().zip(labels) {
        writeln!(file, "{barcode},{}", label + 1)?;
    }
    file.flush()?;
    Ok(())
}

/// One row per feature, five columns per cluster. Effect sizes are the mean
/// over pairwise comparisons; AUC is left empty when it was not computed.
pub(crate) fn save_markers(
    path: &Path,
    modality: Modality,
    feature_ids: &[String],
    feature_names: &[String],
    markers: &[GroupMarkers],
) -> Result<()> {
    let marker_dir = path.join("markers");
    create_dir_all(&marker_dir)?;
    let path = marker_dir.join(format!("{}.csv", modality.as_str()));
    let mut file = BufWriter::new(File::create(path)?);
    write!(file, "Feature ID,Feature Name")?;
    for j in 1..=markers.len() {
        write!(
            file,
            ",Cluster {j} Mean,Cluster {j} Detected,Cluster {j} Cohen,Cluster {j} Log2 fold change,Cluster {j} AUC"
        )?;
    }
    writeln!(file)?;
    for (i, (id, name)) in feature_ids.iter().zip(feature_names).enumerate() {
        write!(file, "{id},{name}")?;
        for m in markers {
            write!(
                file,
                ",{},{},{},{},",
                m.means[i],
                m.detected[i],
                m.cohen.get(Summary::Mean)[i],
                m.lfc.get(Summary::Mean)[i]
            )?;
            if let Some(auc) = &m.auc {
                write!(file, "{}", auc.get(Summary::Mean)[i])?;
            }
        }
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

pub(crate) fn save_labels(
    path: &Path,
    reference: &str,
    labels: &[String],
    scores: &[f64],
) -> Result<()> {
    let label_dir = path.join("labels");
    create_dir_all(&label_dir)?;
    let mut file = BufWriter::new(File::create(label_dir.join(format!("{reference}.csv")))?);
    writeln!(file, "Cluster,Label,Score")?;
    for (j, (label, score)) in labels.iter().zip(scores).enumerate() {
        writeln!(file, "{},{label},{score}", j + 1)?;
    }
    file.flush()?;
    Ok(())
}

/// Write every available result of `analysis` under `path`. Steps without
/// results are skipped.
pub fn export_analysis(analysis: &Analysis, path: &Path) -> Result<()> {
    create_dir_all(path).with_context(|| format!("unable to create {}", path.display()))?;
    let barcodes = retained_barcodes(analysis)?;

    for (key, coordinates) in [
        ("tsne", analysis.tsne.fetch_coordinates()),
        ("umap", analysis.umap.fetch_coordinates()),
    ] {
        if let Some(coordinates) = coordinates {
            save_embedding(path, key, &coordinates, &barcodes)?;
        }
    }

    let clusterings = [
        ("chosen", analysis.choose_clustering.fetch_clusters()),
        ("kmeans", analysis.kmeans_cluster.fetch_clusters()),
        ("snn_graph", analysis.snn_graph_cluster.fetch_clusters()),
    ];
    for (key, labels) in clusterings {
        if let Some(labels) = labels {
            save_clustering(&path.join("clustering"), key, &labels, &barcodes)?;
        }
    }

    for modality in Modality::ALL {
        if let Some(markers) = analysis.marker_detection.fetch_results(modality) {
            let n = markers.first().map_or(0, GroupMarkers::num_features);
            let (ids, names) = feature_labels(analysis, modality, n);
            save_markers(path, modality, &ids, &names, markers)?;
        }
    }

    for reference in &analysis.cell_labelling.fetch_parameters().references {
        if let Some(labels) = analysis.cell_labelling.fetch_labels(reference) {
            save_labels(path, reference, &labels.labels, &labels.scores)?;
        }
    }
    info!("exported {} cells to {}", barcodes.len(), path.display());
    Ok(())
}
