//! The study driver: ask for a trial, run the objective, record the outcome.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{OptimizerError, OptimizerResult};
use crate::pruner::Pruner;
use crate::sampler::Sampler;
use crate::storage::{StoredStudy, StudyStorage};
use crate::trial::{FrozenTrial, ObjectiveDirection, PruneDecision, StudyConfig, TrialOutcome, TrialState};

/// Counts of how the trials of one `optimize` call ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeSummary {
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
}

impl OptimizeSummary {
    pub fn total(&self) -> usize {
        self.completed + self.pruned + self.failed
    }
}

/// One worker's handle on a shared study.
pub struct Study {
    storage: Arc<dyn StudyStorage>,
    study_id: i64,
    config: StudyConfig,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    worker_id: String,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("study_id", &self.study_id)
            .field("name", &self.config.name)
            .field("sampler", &self.sampler.name())
            .field("pruner", &self.pruner.name())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl Study {
    /// Register a new study in `storage`.
    pub fn create(storage: Arc<dyn StudyStorage>, config: StudyConfig) -> OptimizerResult<Self> {
        config.search_space.validate()?;
        let study_id = storage.create_study(&config)?;
        Ok(Self::from_stored(storage, StoredStudy { id: study_id, config }))
    }

    /// Join an existing study; `name` may be omitted when it is the only one.
    pub fn load(storage: Arc<dyn StudyStorage>, name: Option<&str>) -> OptimizerResult<Self> {
        let stored = storage.load_study(name)?;
        Ok(Self::from_stored(storage, stored))
    }

    fn from_stored(storage: Arc<dyn StudyStorage>, stored: StoredStudy) -> Self {
        let sampler = stored.config.sampler.build();
        let pruner = stored.config.pruner.build();
        Self {
            storage,
            study_id: stored.id,
            config: stored.config,
            sampler,
            pruner,
            worker_id: format!("pid-{}", std::process::id()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn id(&self) -> i64 {
        self.study_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.config.direction
    }

    pub fn trials(&self) -> OptimizerResult<Vec<FrozenTrial>> {
        self.storage.trials(self.study_id)
    }

    pub fn best_trial(&self) -> OptimizerResult<FrozenTrial> {
        self.storage.best_trial(self.study_id, self.config.direction)
    }

    pub fn best_params(&self) -> OptimizerResult<BTreeMap<String, f64>> {
        Ok(self.best_trial()?.params)
    }

    /// Start a new trial. The sampler sees the history as of this call.
    pub fn ask(&self) -> OptimizerResult<TrialContext<'_>> {
        let history = self.storage.trials(self.study_id)?;
        let number = self.storage.create_trial(self.study_id, &self.worker_id)?;
        debug!(study = %self.config.name, trial = number, "trial started");
        Ok(TrialContext {
            study: self,
            trial: FrozenTrial::new(number, Some(self.worker_id.clone())),
            history,
        })
    }

    /// Record how a trial ended.
    pub fn tell(&self, number: usize, outcome: TrialOutcome) -> OptimizerResult<TrialState> {
        match outcome {
            TrialOutcome::Completed(value) if value.is_nan() => {
                self.fail(number, "objective returned NaN")?;
                Ok(TrialState::Failed)
            }
            TrialOutcome::Completed(value) => {
                self.storage
                    .finalize_trial(self.study_id, number, TrialState::Completed, Some(value), None)?;
                Ok(TrialState::Completed)
            }
            TrialOutcome::Pruned => {
                self.storage
                    .finalize_trial(self.study_id, number, TrialState::Pruned, None, None)?;
                Ok(TrialState::Pruned)
            }
        }
    }

    pub fn fail(&self, number: usize, message: &str) -> OptimizerResult<()> {
        self.storage
            .finalize_trial(self.study_id, number, TrialState::Failed, None, Some(message))
    }

    /// Run `n_trials` trials one after another.
    ///
    /// A pruned trial is a normal outcome. An objective error marks the trial
    /// failed and stops the loop with that error.
    pub fn optimize<F, E>(&self, n_trials: usize, mut objective: F) -> Result<OptimizeSummary, E>
    where
        F: FnMut(&mut TrialContext<'_>) -> Result<TrialOutcome, E>,
        E: From<OptimizerError> + Display,
    {
        let mut summary = OptimizeSummary::default();
        for _ in 0..n_trials {
            let mut ctx = self.ask()?;
            let number = ctx.number();
            match objective(&mut ctx) {
                Ok(outcome) => match (self.tell(number, outcome)?, outcome) {
                    (TrialState::Completed, TrialOutcome::Completed(value)) => {
                        summary.completed += 1;
                        info!(
                            study = %self.config.name,
                            trial = number,
                            value,
                            params = ?ctx.params(),
                            "trial completed"
                        );
                    }
                    (TrialState::Pruned, _) => {
                        summary.pruned += 1;
                        info!(
                            study = %self.config.name,
                            trial = number,
                            step = ?ctx.trial.last_step(),
                            "trial pruned"
                        );
                    }
                    _ => {
                        summary.failed += 1;
                        warn!(study = %self.config.name, trial = number, "trial failed: objective returned NaN");
                    }
                },
                Err(err) => {
                    let message = err.to_string();
                    error!(study = %self.config.name, trial = number, error = %message, "trial failed");
                    self.fail(number, &message)?;
                    return Err(err);
                }
            }
        }
        Ok(summary)
    }
}

/// The running trial handed to an objective.
pub struct TrialContext<'a> {
    study: &'a Study,
    trial: FrozenTrial,
    history: Vec<FrozenTrial>,
}

impl<'a> TrialContext<'a> {
    pub fn number(&self) -> usize {
        self.trial.number
    }

    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.trial.params
    }

    /// Suggest a value for a parameter of the search space. Asking twice in
    /// the same trial returns the same value.
    pub fn suggest_float(&mut self, name: &str) -> OptimizerResult<f64> {
        if let Some(value) = self.trial.params.get(name) {
            return Ok(*value);
        }
        let study = self.study;
        let param = study.config.search_space.get(name)?;
        let value = study
            .sampler
            .sample(param, self.trial.number, &self.history, study.config.direction);
        study
            .storage
            .set_trial_param(study.study_id, self.trial.number, name, value)?;
        self.trial.params.insert(name.to_string(), value);
        debug!(trial = self.trial.number, param = name, value, "suggested");
        Ok(value)
    }

    /// Record an intermediate score and ask the pruner whether to stop.
    pub fn report(&mut self, step: usize, value: f64) -> OptimizerResult<PruneDecision> {
        let study = self.study;
        study
            .storage
            .report_intermediate(study.study_id, self.trial.number, step, value)?;
        self.trial.intermediate_values.insert(step, value);
        if study.pruner.should_prune(&self.trial, step) {
            debug!(trial = self.trial.number, step, value, "pruner requested stop");
            Ok(PruneDecision::Prune)
        } else {
            Ok(PruneDecision::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruner::PrunerConfig;
    use crate::sampler::SamplerConfig;
    use crate::search::SearchSpace;
    use crate::storage::{DuckDbStorage, InMemoryStorage};
    use tempfile::TempDir;

    fn alpha_study(storage: Arc<dyn StudyStorage>) -> Study {
        let config = StudyConfig::new("closed_loop", SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12));
        Study::create(storage, config).unwrap()
    }

    #[test]
    fn failing_first_fold_prunes_before_second_fold() {
        let study = alpha_study(Arc::new(InMemoryStorage::new()));
        let mut folds_run = 0;
        let summary = study
            .optimize(1, |trial| -> Result<TrialOutcome, OptimizerError> {
                trial.suggest_float("alpha")?;
                for (step, score) in [-25.0, 0.9, 0.9].into_iter().enumerate() {
                    folds_run += 1;
                    if trial.report(step, score)?.should_prune() {
                        return Ok(TrialOutcome::Pruned);
                    }
                }
                Ok(TrialOutcome::Completed(0.9))
            })
            .unwrap();

        assert_eq!(summary, OptimizeSummary { completed: 0, pruned: 1, failed: 0 });
        assert_eq!(folds_run, 1);
        let trial = &study.trials().unwrap()[0];
        assert_eq!(trial.state, TrialState::Pruned);
        assert_eq!(trial.intermediate_values.len(), 1);
        assert!(!trial.intermediate_values.contains_key(&1));
        assert_eq!(trial.value, Some(-25.0));
    }

    #[test]
    fn suggestions_are_cached_and_validated() {
        let study = alpha_study(Arc::new(InMemoryStorage::new()));
        let mut ctx = study.ask().unwrap();
        let a = ctx.suggest_float("alpha").unwrap();
        assert_eq!(ctx.suggest_float("alpha").unwrap(), a);
        assert!((1e-12..=1e12).contains(&a));
        assert!(matches!(
            ctx.suggest_float("beta"),
            Err(OptimizerError::UnknownParameter { .. })
        ));
        let stored = study.trials().unwrap();
        assert_eq!(stored[0].params["alpha"], a);
    }

    #[test]
    fn objective_error_fails_trial_and_stops() {
        let study = alpha_study(Arc::new(InMemoryStorage::new()));
        let mut calls = 0;
        let result = study.optimize(5, |_| -> Result<TrialOutcome, OptimizerError> {
            calls += 1;
            if calls == 2 {
                Err(OptimizerError::InvalidSearchSpace {
                    message: "boom".into(),
                })
            } else {
                Ok(TrialOutcome::Completed(1.0))
            }
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
        let trials = study.trials().unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[1].state, TrialState::Failed);
        assert!(trials[1].error.as_deref().unwrap_or_default().contains("boom"));
    }

    #[test]
    fn nan_objective_is_recorded_as_failed() {
        let study = alpha_study(Arc::new(InMemoryStorage::new()));
        let summary = study
            .optimize(2, |_| -> Result<TrialOutcome, OptimizerError> { Ok(TrialOutcome::Completed(f64::NAN)) })
            .unwrap();
        assert_eq!(summary.failed, 2);
        assert!(matches!(study.best_trial(), Err(OptimizerError::NoCompletedTrials)));
    }

    #[test]
    fn tpe_search_finds_good_alpha() {
        let study = alpha_study(Arc::new(InMemoryStorage::new()));
        let summary = study
            .optimize(40, |trial| -> Result<TrialOutcome, OptimizerError> {
                let alpha = trial.suggest_float("alpha")?;
                Ok(TrialOutcome::Completed(-(alpha.log10() - 3.0).powi(2)))
            })
            .unwrap();
        assert_eq!(summary.completed, 40);
        let best = study.best_trial().unwrap();
        assert!(best.value.unwrap() > -4.0, "best {best:?}");
        assert!((best.params["alpha"].log10() - 3.0).abs() < 2.0);
    }

    #[test]
    fn workers_share_a_duckdb_study() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("study.db");
        let storage: Arc<dyn StudyStorage> = Arc::new(DuckDbStorage::recreate(&path).unwrap());
        let config = StudyConfig::new("open_loop", SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12))
            .with_sampler(SamplerConfig::Random { seed: 9 })
            .with_pruner(PrunerConfig::Nop);
        Study::create(Arc::clone(&storage), config).unwrap();

        for worker in 0..2 {
            let study = Study::load(Arc::clone(&storage), None).unwrap().with_worker_id(format!("w{worker}"));
            study
                .optimize(3, |trial| -> Result<TrialOutcome, OptimizerError> {
                    let alpha = trial.suggest_float("alpha")?;
                    trial.report(0, alpha.log10())?;
                    Ok(TrialOutcome::Completed(alpha.log10()))
                })
                .unwrap();
        }

        let reopened = Study::load(Arc::new(DuckDbStorage::open(&path).unwrap()), Some("open_loop")).unwrap();
        let trials = reopened.trials().unwrap();
        assert_eq!(trials.iter().map(|t| t.number).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        assert!(trials.iter().all(|t| t.state == TrialState::Completed));
        let best = reopened.best_trial().unwrap();
        assert!(trials.iter().all(|t| t.value <= best.value));
    }
}
