//! Trial state machine and study configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OptimizerError, OptimizerResult};
use crate::pruner::PrunerConfig;
use crate::sampler::SamplerConfig;
use crate::search::SearchSpace;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// `true` when `candidate` improves on `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Order values best-first.
    pub fn compare(&self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        match self {
            ObjectiveDirection::Maximize => ord.reverse(),
            ObjectiveDirection::Minimize => ord,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveDirection::Maximize => "maximize",
            ObjectiveDirection::Minimize => "minimize",
        }
    }
}

/// Everything a worker needs to join a study, stored alongside its trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    pub name: String,
    pub direction: ObjectiveDirection,
    pub search_space: SearchSpace,
    pub sampler: SamplerConfig,
    pub pruner: PrunerConfig,
    pub created_at: DateTime<Utc>,
}

impl StudyConfig {
    pub fn new(name: impl Into<String>, search_space: SearchSpace) -> Self {
        Self {
            name: name.into(),
            direction: ObjectiveDirection::Maximize,
            search_space,
            sampler: SamplerConfig::default(),
            pruner: PrunerConfig::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_pruner(mut self, pruner: PrunerConfig) -> Self {
        self.pruner = pruner;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Completed,
    Pruned,
    Failed,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TrialState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::Running => "running",
            TrialState::Completed => "completed",
            TrialState::Pruned => "pruned",
            TrialState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> OptimizerResult<Self> {
        match s {
            "running" => Ok(TrialState::Running),
            "completed" => Ok(TrialState::Completed),
            "pruned" => Ok(TrialState::Pruned),
            "failed" => Ok(TrialState::Failed),
            other => Err(OptimizerError::Storage {
                message: format!("unknown trial state '{other}'"),
            }),
        }
    }
}

/// How an objective finished a trial. Pruning is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    Completed(f64),
    Pruned,
}

/// Answer to an intermediate report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneDecision {
    Continue,
    Prune,
}

impl PruneDecision {
    pub fn should_prune(&self) -> bool {
        matches!(self, PruneDecision::Prune)
    }
}

/// Snapshot of one trial as recorded in the study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub number: usize,
    pub state: TrialState,
    pub params: BTreeMap<String, f64>,
    /// Objective value; for pruned trials the last intermediate value.
    pub value: Option<f64>,
    /// Intermediate values keyed by step (fold index).
    pub intermediate_values: BTreeMap<usize, f64>,
    pub worker_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl FrozenTrial {
    pub fn new(number: usize, worker_id: Option<String>) -> Self {
        Self {
            number,
            state: TrialState::Running,
            params: BTreeMap::new(),
            value: None,
            intermediate_values: BTreeMap::new(),
            worker_id,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn last_step(&self) -> Option<(usize, f64)> {
        self.intermediate_values.iter().next_back().map(|(s, v)| (*s, *v))
    }

    fn transition(&mut self, to: TrialState) -> OptimizerResult<()> {
        if self.state != TrialState::Running {
            return Err(OptimizerError::InvalidTransition {
                number: self.number,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, value: f64) -> OptimizerResult<()> {
        self.transition(TrialState::Completed)?;
        self.value = Some(value);
        Ok(())
    }

    pub fn mark_pruned(&mut self) -> OptimizerResult<()> {
        self.transition(TrialState::Pruned)?;
        self.value = self.last_step().map(|(_, v)| v);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> OptimizerResult<()> {
        self.transition(TrialState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Apply a finalization recorded elsewhere (storage backends).
    pub fn finish(&mut self, state: TrialState, value: Option<f64>, error: Option<String>) -> OptimizerResult<()> {
        match state {
            TrialState::Completed => self.mark_completed(value.unwrap_or(f64::NAN)),
            TrialState::Pruned => {
                self.mark_pruned()?;
                if value.is_some() {
                    self.value = value;
                }
                Ok(())
            }
            TrialState::Failed => self.mark_failed(error.unwrap_or_default()),
            TrialState::Running => Err(OptimizerError::InvalidTransition {
                number: self.number,
                from: self.state,
                to: state,
            }),
        }
    }
}

/// Best completed trial under `direction`; ties go to the lower number.
pub(crate) fn select_best(trials: &[FrozenTrial], direction: ObjectiveDirection) -> OptimizerResult<FrozenTrial> {
    trials
        .iter()
        .filter(|t| t.state == TrialState::Completed)
        .filter_map(|t| t.value.filter(|v| !v.is_nan()).map(|v| (t, v)))
        .fold(None::<(&FrozenTrial, f64)>, |best, (t, v)| match best {
            Some((_, bv)) if !direction.is_better(v, bv) => best,
            _ => Some((t, v)),
        })
        .map(|(t, _)| t.clone())
        .ok_or(OptimizerError::NoCompletedTrials)
}
