//! Dasymetric population redistribution.
//!
//! Takes the intersection of population source units with an ancillary
//! categorical layer and estimates population per intersection, using class
//! densities that are preset, sampled from representative source units, or
//! derived by intelligent areal weighting. Totals per source unit are
//! preserved exactly.

pub mod classifier;
pub mod config;
pub mod density;
pub mod error;
pub mod pipeline;
pub mod redistribute;
pub mod results;
pub mod sampler;
pub mod table;

pub use config::{Config, RunConfig, TableSchema};
pub use density::{ClassDensitySummary, DensityMethod, TargetEstimate};
pub use error::{DasyError, Result};
pub use pipeline::{check_conservation, ConservationReport, DasyResult, Dasymetric};
pub use results::OutputTables;
pub use table::{SourceRecord, Table, TargetUnit};
