//! UMAP visualization of the corrected embedding.

use anyhow::{Context, Result};
use log::{info, warn};
use sc_store::names::RESULTS;
use sc_store::Group;
use sc_types::{Owned, View};
use serde::{Deserialize, Serialize};

use crate::persist::{read_step_parameters, results, write_step_parameters};
use crate::session::{AnimationFrame, Session};
use crate::step::{Status, Step, StepState};
use crate::steps::neighbor_index::NeighborIndexStep;
use crate::steps::Coordinates;
use crate::umap::run_umap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapParams {
    pub num_neighbors: usize,
    pub num_epochs: usize,
    pub min_dist: f64,
    pub animate: bool,
}

impl Default for UmapParams {
    fn default() -> Self {
        UmapParams {
            num_neighbors: 15,
            num_epochs: 500,
            min_dist: 0.1,
            animate: false,
        }
    }
}

impl UmapParams {
    fn same_layout(&self, other: &UmapParams) -> bool {
        self.num_neighbors == other.num_neighbors
            && self.num_epochs == other.num_epochs
            && self.min_dist == other.min_dist
    }
}

#[derive(Debug, Default)]
pub struct Umap {
    status: Status,
    params: Option<UmapParams>,
    cache: Option<Owned<Coordinates>>,
}

impl Umap {
    pub fn new() -> Self {
        Umap::default()
    }

    pub fn compute(
        &mut self,
        index: &NeighborIndexStep,
        params: UmapParams,
        session: &Session,
    ) -> Result<()> {
        let needed = index.changed()
            || self.params.as_ref().map_or(true, |p| !p.same_layout(&params));
        if !self.status.begin(Step::Umap, needed) {
            return Ok(());
        }
        let neighbors = index.fetch_neighbors(params.num_neighbors)?;
        let report = |iteration: usize, x: &[f64], y: &[f64]| {
            session.animate(&AnimationFrame {
                step: Step::Umap,
                iteration,
                x: x.to_vec(),
                y: y.to_vec(),
            });
        };
        let frame: Option<&(dyn Fn(usize, &[f64], &[f64]) + Sync)> =
            if params.animate { Some(&report) } else { None };
        let (x, y) = session
            .install(|| {
                run_umap(
                    &neighbors,
                    params.num_neighbors,
                    params.num_epochs,
                    params.min_dist,
                    frame,
                )
            })
            .context("failed to run UMAP")?;
        info!("umap: {} epochs over {} cells", params.num_epochs, x.len());
        self.cache = Some(Owned::new(Coordinates { x, y }));
        self.params = Some(params);
        self.status.finish();
        Ok(())
    }

    pub fn fetch_parameters(&self) -> UmapParams {
        self.params.clone().unwrap_or_default()
    }

    pub fn fetch_coordinates(&self) -> Option<View<Coordinates>> {
        self.cache.as_ref().map(Owned::view)
    }

    pub fn serialize(&self, group: &mut Group) -> Result<()> {
        write_step_parameters(group, &self.fetch_parameters())?;
        if let Some(coords) = &self.cache {
            coords.write(group.create_group(RESULTS));
        }
        Ok(())
    }

    pub fn unserialize(group: &Group) -> Result<Self> {
        let params: UmapParams = read_step_parameters(group)?;
        let mut step = Umap::new();
        match results(group) {
            Some(saved) if saved.contains("x") => {
                step.cache = Some(Owned::new(Coordinates::read(saved)?));
                step.status = Status::restored();
            }
            Some(_) => warn!("umap: no saved coordinates, will recompute"),
            None => {}
        }
        step.params = Some(params);
        Ok(step)
    }
}

impl StepState for Umap {
    fn step(&self) -> Step {
        Step::Umap
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
    use crate::testing::Pipeline;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_umap_recomputes_on_new_parameters() -> Result<()> {
        let session = Session::builder().num_threads(2).build()?;
        let mut e = Pipeline::rna_only(40, 30, 12)?.embed()?;
        let params = UmapParams {
            num_neighbors: 8,
            num_epochs: 50,
            ..Default::default()
        };
        let mut umap = Umap::new();
        umap.compute(&e.index, params.clone(), &session)?;
        let first = umap.fetch_coordinates().unwrap();
        assert_eq!(first.y.len(), e.pipeline.filtering.num_retained());

        e.rerun()?;
        umap.compute(&e.index, params.clone(), &session)?;
        assert!(!umap.changed());

        umap.compute(
            &e.index,
            UmapParams {
                min_dist: 0.5,
                ..params
            },
            &session,
        )?;
        assert!(umap.changed());
        assert!(!first.same_buffer(&umap.fetch_coordinates().unwrap()));

        let mut g = Group::new();
        umap.serialize(&mut g)?;
        let back = Umap::unserialize(&g)?;
        assert_eq!(back.fetch_parameters().min_dist, 0.5);
        assert_eq!(*back.fetch_coordinates().unwrap(), *umap.fetch_coordinates().unwrap());
        Ok(())
    }
}
