//! # koop-data
//!
//! Experiment datasets for Koopweave: the JSON dataset bundle shared by the
//! search workers, raw CSV episode loading, and assembly of open- and
//! closed-loop training matrices from raw episodes.

pub mod assembly;
pub mod dataset;
pub mod loaders;
pub mod storage;

pub use assembly::*;
pub use dataset::*;
pub use loaders::*;
pub use storage::*;
