//! Pruners decide at each intermediate report whether a trial should stop.

use serde::{Deserialize, Serialize};

use crate::trial::FrozenTrial;

pub trait Pruner: Send + Sync {
    /// Called after `trial` reported its value for `step`.
    fn should_prune(&self, trial: &FrozenTrial, step: usize) -> bool;

    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn should_prune(&self, _trial: &FrozenTrial, _step: usize) -> bool {
        false
    }

    fn name(&self) -> &str {
        "nop"
    }
}

/// Prunes when the latest intermediate value leaves `[lower, upper]`.
///
/// Non-finite values are always pruned, warm-up or not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPruner {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    /// Steps below this index are never pruned on range alone.
    pub n_warmup_steps: usize,
}

impl ThresholdPruner {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self {
            lower,
            upper,
            n_warmup_steps: 0,
        }
    }

    pub fn with_warmup_steps(mut self, n: usize) -> Self {
        self.n_warmup_steps = n;
        self
    }
}

impl Pruner for ThresholdPruner {
    fn should_prune(&self, trial: &FrozenTrial, step: usize) -> bool {
        let value = match trial.intermediate_values.get(&step) {
            Some(v) => *v,
            None => return false,
        };
        if !value.is_finite() {
            return true;
        }
        if step < self.n_warmup_steps {
            return false;
        }
        self.lower.map_or(false, |lo| value < lo) || self.upper.map_or(false, |hi| value > hi)
    }

    fn name(&self) -> &str {
        "threshold"
    }
}

/// Serializable pruner choice stored with the study.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrunerConfig {
    Threshold {
        lower: Option<f64>,
        upper: Option<f64>,
        #[serde(default)]
        n_warmup_steps: usize,
    },
    Nop,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        PrunerConfig::Threshold {
            lower: Some(-10.0),
            upper: None,
            n_warmup_steps: 0,
        }
    }
}

impl PrunerConfig {
    pub fn build(&self) -> Box<dyn Pruner> {
        match *self {
            PrunerConfig::Threshold {
                lower,
                upper,
                n_warmup_steps,
            } => Box::new(ThresholdPruner::new(lower, upper).with_warmup_steps(n_warmup_steps)),
            PrunerConfig::Nop => Box::new(NopPruner),
        }
    }
}
