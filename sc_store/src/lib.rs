//! sc_store
//!
//! Persisted analysis state: a tree of named groups holding typed values,
//! framed in a versioned container with an optional embedded-file section.

pub mod container;
pub mod document;
pub mod files;
pub mod names;
pub mod params;
pub mod upgrade;

pub use container::{
    read_container, write_container, Container, Preamble, Storage, CURRENT_VERSION,
};
pub use document::{FromValue, Group, Node, Value};
pub use files::{EmbeddedSection, ExtractToDirectory, FileRecord, FileResolver, FileSink};
pub use params::{read_parameters, write_parameters};
