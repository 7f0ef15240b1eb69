//! Export of analysis results.

pub mod csv;

pub use self::csv::export_analysis;
