//! One search worker: join the study and run trials until done.

use koop_data::{load_lifting_set, ExperimentDataset};
use koop_optimizer::{OptimizeSummary, StorageUrl, Study};
use std::path::PathBuf;
use tracing::info;

use crate::config::StudyKind;
use crate::cv::{CrossValidation, GroupShuffleSplit};
use crate::error::EngineResult;

/// Arguments of the `koop-worker` process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub experiment_path: PathBuf,
    pub lifting_functions_path: PathBuf,
    pub storage_url: String,
    pub n_trials: usize,
    pub split_seed: u64,
    pub kind: StudyKind,
    /// Defaults to the only study in the store.
    pub study_name: Option<String>,
    pub n_splits: usize,
    pub test_size: f64,
}

pub fn run_worker(options: &WorkerOptions) -> EngineResult<OptimizeSummary> {
    let dataset = ExperimentDataset::load(&options.experiment_path)?;
    let lifting = load_lifting_set(&options.lifting_functions_path)?;
    let splitter = GroupShuffleSplit::new(options.n_splits, options.test_size, options.split_seed)?;
    let cv = CrossValidation::new(&dataset, &lifting, options.kind, &splitter)?;

    let storage = StorageUrl::parse(&options.storage_url)?.open()?;
    let study = Study::load(storage, options.study_name.as_deref())?;
    info!(
        study = study.name(),
        kind = %options.kind,
        n_trials = options.n_trials,
        folds = cv.folds().len(),
        "worker joined study"
    );

    let summary = study.optimize(options.n_trials, |trial| cv.objective(trial))?;
    info!(
        study = study.name(),
        completed = summary.completed,
        pruned = summary.pruned,
        failed = summary.failed,
        "worker finished"
    );
    Ok(summary)
}
