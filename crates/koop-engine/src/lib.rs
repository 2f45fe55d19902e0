//! # koop-engine
//!
//! Regularization search for Koopweave: grouped cross-validation scored trial
//! by trial with pruning at fold boundaries, a fork/join pool of worker
//! processes sharing one study, and the final evaluation at the best `alpha`
//! of each study.

pub mod config;
pub mod cv;
pub mod driver;
pub mod error;
pub mod evaluation;
pub mod orchestrator;
pub mod worker;

#[cfg(test)]
mod fixtures;

pub use config::{SearchConfig, StudyKind, ALPHA};
pub use cv::{CrossValidation, Fold, GroupShuffleSplit};
pub use driver::{best_alphas, prepare_studies, run_evaluation, run_search, worker_args, write_lifting};
pub use error::{EngineError, EngineResult, WorkerFailure};
pub use evaluation::{evaluate, BestAlphas, EvaluationReport, TrajectoryRecord};
pub use orchestrator::{run_workers, worker_executable, WorkerCommand, WORKER_BIN_ENV, WORKER_INDEX_ENV};
pub use worker::{run_worker, WorkerOptions};
