//! # koop-optimizer
//!
//! Hyperparameter search for Koopweave.
//!
//! Provides the search space definition, TPE and random samplers, threshold
//! pruning, explicit trial state machines, and a [`StudyStorage`] trait with
//! DuckDB and in-memory backends so that independent worker processes can
//! share one persistent study.

mod error;
mod pruner;
mod sampler;
mod search;
pub mod storage;
mod study;
mod trial;

pub use error::{OptimizerError, OptimizerResult};
pub use pruner::{NopPruner, Pruner, PrunerConfig, ThresholdPruner};
pub use sampler::{RandomSampler, Sampler, SamplerConfig, TpeSampler};
pub use search::{ParameterDef, ParameterKind, SearchSpace};
pub use storage::{DuckDbStorage, InMemoryStorage, StorageUrl, StoredStudy, StudyStorage};
pub use study::{OptimizeSummary, Study, TrialContext};
pub use trial::{
    FrozenTrial, ObjectiveDirection, PruneDecision, StudyConfig, TrialOutcome, TrialState,
};
