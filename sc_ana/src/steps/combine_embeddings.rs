//! Weighted concatenation of the per-modality embeddings.

use anyhow::Result;
use log::info;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Modality, Owned, PipelineError, Shared, View};
use serde::{Deserialize, Serialize};

use crate::pca::total_variance;
use crate::persist::{read_array2, read_step_parameters, results, write_array2, write_step_parameters};
use crate::step::{Status, Step, StepState};
use crate::steps::EmbeddingSource;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineEmbeddingsParams {
    pub rna_weight: f64,
    pub adt_weight: f64,
    pub crispr_weight: f64,
    pub approximate: bool,
}

impl Default for CombineEmbeddingsParams {
    fn default() -> Self {
        CombineEmbeddingsParams {
            rna_weight: 1.0,
            adt_weight: 1.0,
            crispr_weight: 0.0,
            approximate: true,
        }
    }
}

impl CombineEmbeddingsParams {
    pub fn weight(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Rna => self.rna_weight,
            Modality::Adt => self.adt_weight,
            Modality::Crispr => self.crispr_weight,
        }
    }
}

#[derive(Debug, Default)]
pub struct CombineEmbeddings {
    status: Status,
    params: Option<CombineEmbeddingsParams>,
    cache: Option<Shared<Array2<f64>>>,
}

/// Pass a lone embedding through, or scale each one to unit total variance
/// times its weight and stack them.
fn combine(
    embeddings: &[&dyn EmbeddingSource],
    params: &CombineEmbeddingsParams,
) -> Result<Shared<Array2<f64>>> {
    let available: Vec<(Modality, View<Array2<f64>>)> = embeddings
        .iter()
        .filter_map(|e| e.fetch_pcs().map(|pcs| (e.modality(), pcs)))
        .collect();
    if let [(modality, pcs)] = &available[..] {
        info!("combine embeddings: using the {modality} components directly");
        return Ok(Shared::View(pcs.clone()));
    }
    let weighted: Vec<(Modality, View<Array2<f64>>, f64)> = available
        .into_iter()
        .map(|(m, pcs)| {
            let w = params.weight(m);
            (m, pcs, w)
        })
        .filter(|(_, _, w)| *w > 0.0)
        .collect();
    match &weighted[..] {
        [] => Err(PipelineError::state("no embedding with a positive weight to combine").into()),
        [(modality, pcs, _)] => {
            info!("combine embeddings: only {modality} has a positive weight");
            Ok(Shared::View(pcs.clone()))
        }
        _ => {
            let num_cells = weighted[0].1.ncols();
            for (m, pcs, _) in &weighted {
                sc_types::error::check_length(&format!("{m} embedding cells"), pcs.ncols(), num_cells)?;
            }
            let scaled: Vec<Array2<f64>> = weighted
                .iter()
                .map(|(_, pcs, w)| {
                    let total = total_variance(pcs);
                    let scale = if total > 0.0 { w / total.sqrt() } else { 0.0 };
                    pcs.mapv(|v| v * scale)
                })
                .collect();
            let views: Vec<ArrayView2<'_, f64>> = scaled.iter().map(Array2::view).collect();
            let combined = concatenate(Axis(0), &views)
                .map_err(|e| PipelineError::consistency(format!("cannot stack embeddings: {e}")))?;
            info!(
                "combine embeddings: {} dimensions from {}",
                combined.nrows(),
                weighted.iter().map(|(m, _, _)| m.as_str()).collect::<Vec<_>>().join(", ")
            );
            Ok(Shared::Owned(Owned::new(combined)))
        }
    }
}

impl CombineEmbeddings {
    pub fn new() -> Self {
        CombineEmbeddings::default()
    }

    pub fn compute(
        &mut self,
        embeddings: &[&dyn EmbeddingSource],
        params: CombineEmbeddingsParams,
    ) -> Result<()> {
        let needed =
            embeddings.iter().any(|e| e.changed()) || self.params.as_ref() != Some(&params);
        if !self.status.begin(Step::CombineEmbeddings, needed) {
            return Ok(());
        }
        self.cache = Some(combine(embeddings, &params)?);
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> CombineEmbeddingsParams {
        self.params.clone().unwrap_or_default()
    }

    /// Combined embedding, components × cells.
    pub fn fetch_combined(&self) -> Option<View<Array2<f64>>> {
        self.cache.as_ref().map(Shared::view)
    }

    /// True if the embedding is one modality's components, passed through.
    pub fn is_passthrough(&self) -> bool {
        self.cache.as_ref().map_or(false, Shared::is_view)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(cache) = &self.cache {
            let out = group.create_group(RESULTS);
            if let Some(owned) = cache.as_owned() {
                write_array2(out, "combined", owned);
            }
        }
        Ok(())
    }

    pub fn unserialize(group: &Group, embeddings: &[&dyn EmbeddingSource]) -> Result<Self> {
        let params: CombineEmbeddingsParams = read_step_parameters(group)?;
        let mut step = CombineEmbeddings::new();
        if let Some(saved) = results(group) {
            step.cache = Some(if saved.contains("combined") {
                Shared::Owned(Owned::new(read_array2(saved, "combined")?))
            } else {
                combine(embeddings, &params)?
            });
            step.status = Status::restored();
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for CombineEmbeddings {
    fn step(&self) -> Step {
        Step::CombineEmbeddings
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
    use ndarray::array;
    use pretty_assertions::assert_eq;

    /// An embedding source with fixed components.
    struct Fixed {
        modality: Modality,
        pcs: Option<Owned<Array2<f64>>>,
        changed: bool,
    }

    impl StepState for Fixed {
        fn step(&self) -> Step {
            Step::RnaPca
        }
        fn changed(&self) -> bool {
            self.changed
        }
        fn free(&mut self) {}
    }

    impl EmbeddingSource for Fixed {
        fn modality(&self) -> Modality {
            self.modality
        }
        fn fetch_pcs(&self) -> Option<View<Array2<f64>>> {
            self.pcs.as_ref().map(Owned::view)
        }
        fn fetch_variance_explained(&self) -> Option<&[f64]> {
            None
        }
    }

    fn fixed(modality: Modality, pcs: Option<Array2<f64>>) -> Fixed {
        Fixed {
            modality,
            pcs: pcs.map(Owned::new),
            changed: true,
        }
    }

    #[test]
    fn test_single_modality_passes_through() -> Result<()> {
        let rna = fixed(Modality::Rna, Some(array![[1.0, -1.0, 0.0]]));
        let adt = fixed(Modality::Adt, None);
        let mut step = CombineEmbeddings::new();
        step.compute(&[&rna, &adt], CombineEmbeddingsParams::default())?;
        assert!(step.is_passthrough());
        let combined = step.fetch_combined().unwrap();
        assert!(rna.pcs.as_ref().unwrap().is_viewed_by(&combined));

        let mut g = Group::new();
        step.serialize(&mut g)?;
        assert!(g.group(RESULTS)?.is_empty());
        let back = CombineEmbeddings::unserialize(&g, &[&rna, &adt])?;
        assert!(back.is_passthrough());
        Ok(())
    }

    #[test]
    fn test_weighted_stack() -> Result<()> {
        let rna = fixed(Modality::Rna, Some(array![[2.0, -2.0, 0.0], [0.0, 0.0, 0.0]]));
        let adt = fixed(Modality::Adt, Some(array![[10.0, -10.0, 0.0]]));
        let crispr = fixed(Modality::Crispr, Some(array![[5.0, 5.0, -10.0]]));
        let mut step = CombineEmbeddings::new();
        step.compute(&[&rna, &adt, &crispr], CombineEmbeddingsParams::default())?;
        assert!(!step.is_passthrough());
        let combined = step.fetch_combined().unwrap();
        // crispr has zero weight; both others are scaled to unit total variance
        assert_eq!(combined.dim(), (3, 3));
        assert!((combined[[0, 0]] - combined[[2, 0]]).abs() < 1e-12);
        assert!((total_variance(&combined) - 2.0).abs() < 1e-9);

        let mut g = Group::new();
        step.serialize(&mut g)?;
        let back = CombineEmbeddings::unserialize(&g, &[&rna, &adt, &crispr])?;
        assert_eq!(*back.fetch_combined().unwrap(), *combined);
        Ok(())
    }

    #[test]
    fn test_unchanged_inputs() -> Result<()> {
        let mut rna = fixed(Modality::Rna, Some(array![[1.0, 0.0]]));
        let mut step = CombineEmbeddings::new();
        step.compute(&[&rna], CombineEmbeddingsParams::default())?;
        rna.changed = false;
        step.compute(&[&rna], CombineEmbeddingsParams::default())?;
        assert!(!step.changed());
        step.compute(
            &[&rna],
            CombineEmbeddingsParams {
                rna_weight: 2.0,
                ..Default::default()
            },
        )?;
        assert!(step.changed());
        Ok(())
    }
}
