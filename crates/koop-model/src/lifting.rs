//! Lifting functions.
//!
//! A [`LiftingSet`] is the shared, serializable description of the lifted
//! feature space. Binding it to a raw state width with [`LiftingSet::fit`]
//! produces a [`FittedLifting`]; binding only depends on that width, so every
//! trial that shares the set sees exactly the same features.
//!
//! Every transform keeps its input features as the leading output columns, so
//! the first `n_states_in` lifted features are always the raw state. Trajectory
//! prediction relies on this to read physical states back out of the lifted
//! state.

use koop_types::{KoopResult, ModelError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// One transform in a lifting set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiftingFn {
    /// All monomials of total degree `1..=order`, degree-one terms first.
    Polynomial { order: usize },
    /// Stack the current sample with `n_delays` previous samples.
    Delay { n_delays: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftingStep {
    pub name: String,
    pub function: LiftingFn,
}

/// Ordered list of named lifting functions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiftingSet {
    pub steps: Vec<LiftingStep>,
}

impl LiftingSet {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn with_step(mut self, name: impl Into<String>, function: LiftingFn) -> Self {
        self.steps.push(LiftingStep {
            name: name.into(),
            function,
        });
        self
    }

    /// Second-order polynomial followed by a ten-sample delay embedding.
    pub fn standard() -> Self {
        Self::new()
            .with_step("poly", LiftingFn::Polynomial { order: 2 })
            .with_step("delay", LiftingFn::Delay { n_delays: 10 })
    }

    /// Bind the set to a raw state width.
    pub fn fit(&self, n_states: usize) -> KoopResult<FittedLifting> {
        if n_states == 0 {
            return Err(ModelError::InvalidLifting {
                message: "cannot lift a zero-width state".to_string(),
            }
            .into());
        }
        let mut stages = Vec::with_capacity(self.steps.len());
        let mut width = n_states;
        for step in &self.steps {
            let stage = match step.function {
                LiftingFn::Polynomial { order } => {
                    if order == 0 {
                        return Err(ModelError::InvalidLifting {
                            message: format!("step '{}' has polynomial order 0", step.name),
                        }
                        .into());
                    }
                    Stage::Polynomial {
                        n_in: width,
                        powers: monomial_powers(width, order),
                    }
                }
                LiftingFn::Delay { n_delays } => Stage::Delay {
                    n_in: width,
                    n_delays,
                },
            };
            width = stage.n_out();
            stages.push(stage);
        }
        Ok(FittedLifting {
            n_states_in: n_states,
            n_lifted: width,
            stages,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Polynomial { n_in: usize, powers: Vec<Vec<u32>> },
    Delay { n_in: usize, n_delays: usize },
}

impl Stage {
    fn n_out(&self) -> usize {
        match self {
            Stage::Polynomial { powers, .. } => powers.len(),
            Stage::Delay { n_in, n_delays } => n_in * (n_delays + 1),
        }
    }

    fn lookback(&self) -> usize {
        match self {
            Stage::Polynomial { .. } => 0,
            Stage::Delay { n_delays, .. } => *n_delays,
        }
    }

    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Stage::Polynomial { powers, .. } => DMatrix::from_fn(x.nrows(), powers.len(), |i, j| {
                powers[j]
                    .iter()
                    .enumerate()
                    .filter(|&(_, &p)| p > 0)
                    .map(|(k, &p)| x[(i, k)].powi(p as i32))
                    .product()
            }),
            Stage::Delay { n_in, n_delays } => {
                let rows = x.nrows() - n_delays;
                DMatrix::from_fn(rows, n_in * (n_delays + 1), |i, j| {
                    let lag = j / n_in;
                    x[(i + n_delays - lag, j % n_in)]
                })
            }
        }
    }
}

/// A lifting set bound to a raw state width.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedLifting {
    n_states_in: usize,
    n_lifted: usize,
    stages: Vec<Stage>,
}

impl FittedLifting {
    pub fn n_states_in(&self) -> usize {
        self.n_states_in
    }

    pub fn n_lifted(&self) -> usize {
        self.n_lifted
    }

    /// Number of past samples needed before the first lifted sample exists.
    pub fn lookback(&self) -> usize {
        self.stages.iter().map(Stage::lookback).sum()
    }

    /// Lift a time-ordered block of raw states.
    ///
    /// Output row `j` corresponds to input row `j + lookback()`.
    pub fn transform(&self, states: &DMatrix<f64>) -> KoopResult<DMatrix<f64>> {
        if states.ncols() != self.n_states_in {
            return Err(ModelError::DimensionMismatch {
                context: "lifting input".to_string(),
                expected_rows: states.nrows(),
                expected_cols: self.n_states_in,
                actual_rows: states.nrows(),
                actual_cols: states.ncols(),
            }
            .into());
        }
        if states.nrows() <= self.lookback() {
            return Err(ModelError::EpisodeTooShort {
                index: 0,
                length: states.nrows(),
                required: self.lookback() + 1,
            }
            .into());
        }
        let mut lifted = states.clone();
        for stage in &self.stages {
            lifted = stage.apply(&lifted);
        }
        Ok(lifted)
    }

    /// Lifted state for the most recent row of a `lookback() + 1` row window.
    pub fn lift_latest(&self, window: &DMatrix<f64>) -> KoopResult<DVector<f64>> {
        let lifted = self.transform(window)?;
        Ok(lifted.row(lifted.nrows() - 1).transpose())
    }
}

/// Exponent vectors for all monomials of degree `1..=order` in `n` variables.
fn monomial_powers(n: usize, order: usize) -> Vec<Vec<u32>> {
    let mut powers = Vec::new();
    for degree in 1..=order {
        let mut combo = Vec::with_capacity(degree);
        push_combinations(n, degree, 0, &mut combo, &mut powers);
    }
    powers
}

fn push_combinations(
    n: usize,
    degree: usize,
    start: usize,
    combo: &mut Vec<usize>,
    out: &mut Vec<Vec<u32>>,
) {
    if combo.len() == degree {
        let mut exponents = vec![0u32; n];
        for &k in combo.iter() {
            exponents[k] += 1;
        }
        out.push(exponents);
        return;
    }
    for k in start..n {
        combo.push(k);
        push_combinations(n, degree, k, combo, out);
        combo.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_terms_keep_raw_features_first() {
        let set = LiftingSet::new().with_step("poly", LiftingFn::Polynomial { order: 2 });
        let fitted = set.fit(2).unwrap();
        assert_eq!(fitted.n_lifted(), 5);
        assert_eq!(fitted.lookback(), 0);

        let x = DMatrix::from_row_slice(1, 2, &[2.0, 3.0]);
        let lifted = fitted.transform(&x).unwrap();
        // [x0, x1, x0^2, x0*x1, x1^2]
        assert_eq!(lifted.row(0).iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0, 6.0, 9.0]);
    }

    #[test]
    fn delay_embedding_stacks_past_samples() {
        let set = LiftingSet::new().with_step("delay", LiftingFn::Delay { n_delays: 2 });
        let fitted = set.fit(1).unwrap();
        assert_eq!(fitted.n_lifted(), 3);
        assert_eq!(fitted.lookback(), 2);

        let x = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let lifted = fitted.transform(&x).unwrap();
        assert_eq!(lifted.nrows(), 2);
        assert_eq!(lifted.row(0).iter().copied().collect::<Vec<_>>(), vec![3.0, 2.0, 1.0]);
        assert_eq!(lifted.row(1).iter().copied().collect::<Vec<_>>(), vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn standard_set_dimensions() {
        let fitted = LiftingSet::standard().fit(2).unwrap();
        assert_eq!(fitted.n_lifted(), 55);
        assert_eq!(fitted.lookback(), 10);
    }

    #[test]
    fn lift_latest_matches_last_transform_row() {
        let fitted = LiftingSet::standard().fit(2).unwrap();
        let window = DMatrix::from_fn(11, 2, |i, j| (i as f64 * 0.1).sin() + j as f64);
        let latest = fitted.lift_latest(&window).unwrap();
        assert_eq!(latest.len(), 55);
        assert_eq!(latest[0], window[(10, 0)]);
        assert_eq!(latest[1], window[(10, 1)]);
    }

    #[test]
    fn short_input_and_bad_config_are_rejected() {
        let fitted = LiftingSet::standard().fit(2).unwrap();
        assert!(fitted.transform(&DMatrix::zeros(10, 2)).is_err());
        assert!(fitted.transform(&DMatrix::zeros(20, 3)).is_err());

        let bad = LiftingSet::new().with_step("poly", LiftingFn::Polynomial { order: 0 });
        assert!(bad.fit(2).is_err());
    }

    #[test]
    fn lifting_set_serializes_as_tagged_steps() {
        let json = serde_json::to_value(LiftingSet::standard()).unwrap();
        assert_eq!(json["steps"][0]["function"]["kind"], "polynomial");
        assert_eq!(json["steps"][1]["function"]["n_delays"], 10);
    }
}
