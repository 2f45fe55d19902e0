use parking_lot::Mutex;
use std::collections::HashMap;

use super::{StoredStudy, StudyStorage};
use crate::error::{OptimizerError, OptimizerResult};
use crate::trial::{FrozenTrial, StudyConfig, TrialState};

#[derive(Debug, Default)]
struct MemoryState {
    studies: Vec<StoredStudy>,
    trials: HashMap<i64, Vec<FrozenTrial>>,
}

/// Process-local study storage for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn trial_mut(state: &mut MemoryState, study_id: i64, number: usize) -> OptimizerResult<&mut FrozenTrial> {
    state
        .trials
        .get_mut(&study_id)
        .and_then(|trials| trials.get_mut(number))
        .ok_or(OptimizerError::TrialNotFound { number })
}

fn running_mut(state: &mut MemoryState, study_id: i64, number: usize) -> OptimizerResult<&mut FrozenTrial> {
    let trial = trial_mut(state, study_id, number)?;
    if trial.state.is_finished() {
        return Err(OptimizerError::Storage {
            message: format!("trial {number} is already {}", trial.state.as_str()),
        });
    }
    Ok(trial)
}

impl StudyStorage for InMemoryStorage {
    fn create_study(&self, config: &StudyConfig) -> OptimizerResult<i64> {
        let mut state = self.state.lock();
        if state.studies.iter().any(|s| s.config.name == config.name) {
            return Err(OptimizerError::DuplicateStudy {
                name: config.name.clone(),
            });
        }
        let id = state.studies.len() as i64;
        state.studies.push(StoredStudy {
            id,
            config: config.clone(),
        });
        state.trials.insert(id, Vec::new());
        Ok(id)
    }

    fn load_study(&self, name: Option<&str>) -> OptimizerResult<StoredStudy> {
        let state = self.state.lock();
        match name {
            Some(name) => state
                .studies
                .iter()
                .find(|s| s.config.name == name)
                .cloned()
                .ok_or_else(|| OptimizerError::StudyNotFound { name: name.to_string() }),
            None => match state.studies.as_slice() {
                [only] => Ok(only.clone()),
                [] => Err(OptimizerError::StudyNotFound {
                    name: "<any>".to_string(),
                }),
                many => Err(OptimizerError::AmbiguousStudy { count: many.len() }),
            },
        }
    }

    fn create_trial(&self, study_id: i64, worker_id: &str) -> OptimizerResult<usize> {
        let mut state = self.state.lock();
        let trials = state.trials.get_mut(&study_id).ok_or_else(|| OptimizerError::StudyNotFound {
            name: format!("id {study_id}"),
        })?;
        let number = trials.len();
        trials.push(FrozenTrial::new(number, Some(worker_id.to_string())));
        Ok(number)
    }

    fn set_trial_param(&self, study_id: i64, number: usize, name: &str, value: f64) -> OptimizerResult<()> {
        let mut state = self.state.lock();
        running_mut(&mut state, study_id, number)?.params.insert(name.to_string(), value);
        Ok(())
    }

    fn report_intermediate(&self, study_id: i64, number: usize, step: usize, value: f64) -> OptimizerResult<()> {
        let mut state = self.state.lock();
        running_mut(&mut state, study_id, number)?.intermediate_values.insert(step, value);
        Ok(())
    }

    fn finalize_trial(
        &self,
        study_id: i64,
        number: usize,
        state: TrialState,
        value: Option<f64>,
        error: Option<&str>,
    ) -> OptimizerResult<()> {
        let mut guard = self.state.lock();
        let trial = trial_mut(&mut guard, study_id, number)?;
        trial.finish(state, value, error.map(str::to_string))
    }

    fn trials(&self, study_id: i64) -> OptimizerResult<Vec<FrozenTrial>> {
        self.state
            .lock()
            .trials
            .get(&study_id)
            .cloned()
            .ok_or_else(|| OptimizerError::StudyNotFound {
                name: format!("id {study_id}"),
            })
    }
}
