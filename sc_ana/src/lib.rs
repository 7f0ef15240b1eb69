//! sc_ana
//!
//! Incremental single-cell analysis: a fixed graph of step objects that
//! recompute only when their inputs or parameters change, persist to a
//! versioned container, and restore from it.

pub mod analysis;
pub mod config;
pub mod io;
mod kmeans;
mod louvain;
pub mod markers;
mod mnn;
pub mod nn;
mod normalize;
mod pca;
mod permute;
mod persist;
pub mod providers;
mod qc;
pub mod session;
mod singler;
pub mod step;
pub mod steps;
#[cfg(test)]
mod test_pipeline;
#[cfg(test)]
mod testing;
mod tsne;
mod umap;
mod variance;

pub use analysis::{
    create_analysis, free_analysis, inspect_container, load_analysis, retrieve_parameters,
    run_analysis, save_analysis, subset_inputs, Analysis, ContainerSummary, NoopObserver,
    RunObserver,
};
pub use config::AnalysisParameters;
pub use louvain::{Algorithm, Scheme};
pub use pca::BlockMethod;
pub use permute::Permuter;
pub use session::{AnimationFrame, Session, SessionBuilder};
pub use step::{Step, StepState};
