//! sc_types
//!
//! Shared building blocks of the single-cell analysis pipeline: the error
//! taxonomy, buffer ownership helpers, feature types, sparse count matrices,
//! annotation tables and the `Dataset` contract with its format registry.

pub mod block;
pub mod buffer;
pub mod dataset;
pub mod error;
pub mod feature_type;
pub mod frame;
pub mod matrix;
pub mod mtx;
pub mod registry;
pub mod split;

pub use block::BlockFactor;
pub use buffer::{Deferred, Owned, Shared, View};
pub use dataset::{Dataset, DatasetFile, DatasetSummary, LoadOptions, LoadedDataset};
pub use error::PipelineError;
pub use feature_type::{FeatureType, Modality};
pub use frame::{Column, DataFrame};
pub use matrix::CountMatrix;
pub use registry::DatasetRegistry;
