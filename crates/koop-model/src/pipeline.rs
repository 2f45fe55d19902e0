//! Koopman pipelines: lifting + regression + trajectory prediction.
//!
//! Data is passed as [`Episode`]s whose columns are `[states..., inputs...]`.
//! For the open-loop pipeline the states are the raw plant states. For the
//! closed-loop pipeline they are `[x_c, x_p]` and the inputs are
//! `[reference, feedforward]`; only `x_p` is lifted.

use koop_types::{Episode, KoopResult, ModelError, ValidationConfig};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::composer::{closed_loop_layout, compose_closed_loop, pad_output_map, ClosedLoopLayout};
use crate::controller::ControllerRealization;
use crate::lifting::{FittedLifting, LiftingSet};
use crate::linalg::{concat, hstack, vstack};
use crate::plant::{Edmd, PlantModel, Snapshots};

/// How the open-loop plant operator is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum PlantRegressor {
    Edmd(Edmd),
    /// Known `[A_p | B_p]`; fitting only checks its shape.
    Fixed(DMatrix<f64>),
}

/// How the closed-loop operator is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum ClosedLoopRegressor {
    /// Identify the plant from closed-loop data, then compose.
    Edmd(Edmd),
    /// Known `U_cl`; fitting only checks its shape and binds the lifting.
    Fixed(DMatrix<f64>),
}

#[derive(Debug, Clone)]
struct OpenLoopFit {
    lifting: FittedLifting,
    plant: PlantModel,
    n_inputs: usize,
}

/// Open-loop Koopman pipeline over plant states and measured inputs.
#[derive(Debug, Clone)]
pub struct KoopmanPipeline {
    lifting_set: LiftingSet,
    regressor: PlantRegressor,
    fitted: Option<OpenLoopFit>,
}

impl KoopmanPipeline {
    pub fn new(lifting_set: LiftingSet, regressor: PlantRegressor) -> Self {
        Self {
            lifting_set,
            regressor,
            fitted: None,
        }
    }

    pub fn lifting_set(&self) -> &LiftingSet {
        &self.lifting_set
    }

    pub fn lifting(&self) -> KoopResult<&FittedLifting> {
        Ok(&self.fitted()?.lifting)
    }

    pub fn plant(&self) -> KoopResult<&PlantModel> {
        Ok(&self.fitted()?.plant)
    }

    /// Samples per episode taken from the data as initial conditions.
    pub fn initial_condition_rows(&self) -> KoopResult<usize> {
        Ok(self.fitted()?.lifting.lookback() + 1)
    }

    fn fitted(&self) -> KoopResult<&OpenLoopFit> {
        self.fitted.as_ref().ok_or_else(|| {
            ModelError::NotFitted {
                component: "open-loop pipeline".to_string(),
            }
            .into()
        })
    }

    pub fn fit(
        &mut self,
        episodes: &[Episode],
        n_inputs: usize,
        validation: &ValidationConfig,
    ) -> KoopResult<&mut Self> {
        let width = common_width(episodes)?;
        if n_inputs >= width {
            return Err(ModelError::InvalidLifting {
                message: format!("{n_inputs} inputs leave no state columns in {width}-wide data"),
            }
            .into());
        }
        let n_states = width - n_inputs;
        let lifting = self.lifting_set.fit(n_states)?;

        let plant = match &self.regressor {
            PlantRegressor::Fixed(coef) => {
                check_coefficients(coef, lifting.n_lifted(), lifting.n_lifted() + n_inputs)?;
                PlantModel::from_coefficients(coef.clone())?
            }
            PlantRegressor::Edmd(edmd) => {
                let mut features = Vec::with_capacity(episodes.len());
                let mut targets = Vec::with_capacity(episodes.len());
                for ep in episodes {
                    validation.check_finite(&ep.data, "open-loop training data")?;
                    check_length(ep, lifting.lookback())?;
                    let states = ep.data.columns(0, n_states).into_owned();
                    let inputs = ep.data.columns(n_states, n_inputs);
                    let psi = lifting.transform(&states)?;
                    let pairs = psi.nrows() - 1;
                    let u = inputs.rows(lifting.lookback(), pairs).into_owned();
                    features.push(hstack(&[&psi.rows(0, pairs).into_owned(), &u])?);
                    targets.push(psi.rows(1, pairs).into_owned());
                }
                let snapshots = Snapshots {
                    features: vstack(&features)?,
                    targets: vstack(&targets)?,
                };
                edmd.fit(&snapshots)?
            }
        };

        debug!(
            n_states,
            n_inputs,
            n_lifted = lifting.n_lifted(),
            episodes = episodes.len(),
            "Fitted open-loop pipeline"
        );
        self.fitted = Some(OpenLoopFit {
            lifting,
            plant,
            n_inputs,
        });
        Ok(self)
    }

    /// Predict plant-state trajectories from each episode's initial
    /// conditions and recorded inputs.
    pub fn predict_trajectory(
        &self,
        episodes: &[Episode],
        validation: &ValidationConfig,
    ) -> KoopResult<Vec<Episode>> {
        let fit = self.fitted()?;
        let n_states = fit.lifting.n_states_in();
        let sim = Simulator {
            lifting: &fit.lifting,
            operator: fit.plant.coefficients(),
            n_unlifted: 0,
            n_states,
            n_inputs: fit.n_inputs,
        };
        episodes
            .iter()
            .map(|ep| sim.run(ep, validation))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct ClosedLoopFit {
    lifting: FittedLifting,
    coef: DMatrix<f64>,
    plant: Option<PlantModel>,
    layout: ClosedLoopLayout,
}

/// Closed-loop Koopman pipeline over `[x_c; psi(x_p)]`.
#[derive(Debug, Clone)]
pub struct ClosedLoopPipeline {
    lifting_set: LiftingSet,
    regressor: ClosedLoopRegressor,
    controller: ControllerRealization,
    c_plant: DMatrix<f64>,
    fitted: Option<ClosedLoopFit>,
}

impl ClosedLoopPipeline {
    pub fn new(
        lifting_set: LiftingSet,
        regressor: ClosedLoopRegressor,
        controller: ControllerRealization,
        c_plant: DMatrix<f64>,
    ) -> Self {
        Self {
            lifting_set,
            regressor,
            controller,
            c_plant,
            fitted: None,
        }
    }

    /// Closed-loop pipeline with a fixed operator composed from an already
    /// identified plant and the given controller.
    pub fn from_plant(
        lifting_set: LiftingSet,
        plant: &PlantModel,
        controller: ControllerRealization,
        c_plant: DMatrix<f64>,
    ) -> KoopResult<Self> {
        let u_cl = compose_closed_loop(plant, &controller, &c_plant)?;
        Ok(Self::new(
            lifting_set,
            ClosedLoopRegressor::Fixed(u_cl),
            controller,
            c_plant,
        ))
    }

    /// Close the loop around a fitted open-loop pipeline.
    pub fn from_open_loop(
        open_loop: &KoopmanPipeline,
        controller: ControllerRealization,
        c_plant: DMatrix<f64>,
    ) -> KoopResult<Self> {
        Self::from_plant(
            open_loop.lifting_set().clone(),
            open_loop.plant()?,
            controller,
            c_plant,
        )
    }

    pub fn controller(&self) -> &ControllerRealization {
        &self.controller
    }

    pub fn lifting_set(&self) -> &LiftingSet {
        &self.lifting_set
    }

    pub fn coefficients(&self) -> KoopResult<&DMatrix<f64>> {
        Ok(&self.fitted()?.coef)
    }

    /// Identified plant, when the operator came from regression.
    pub fn plant(&self) -> Option<&PlantModel> {
        self.fitted.as_ref().and_then(|f| f.plant.as_ref())
    }

    pub fn layout(&self) -> KoopResult<ClosedLoopLayout> {
        Ok(self.fitted()?.layout)
    }

    pub fn initial_condition_rows(&self) -> KoopResult<usize> {
        Ok(self.fitted()?.lifting.lookback() + 1)
    }

    fn fitted(&self) -> KoopResult<&ClosedLoopFit> {
        self.fitted.as_ref().ok_or_else(|| {
            ModelError::NotFitted {
                component: "closed-loop pipeline".to_string(),
            }
            .into()
        })
    }

    pub fn fit(
        &mut self,
        episodes: &[Episode],
        n_inputs: usize,
        validation: &ValidationConfig,
    ) -> KoopResult<&mut Self> {
        self.controller.validate()?;
        let width = common_width(episodes)?;
        let n_c = self.controller.n_states();
        let n_y = self.controller.n_inputs();
        if n_inputs < n_y || n_inputs >= width.saturating_sub(n_c) {
            return Err(ModelError::DimensionMismatch {
                context: "closed-loop data columns".to_string(),
                expected_rows: n_c,
                expected_cols: n_y + self.controller.n_outputs(),
                actual_rows: width,
                actual_cols: n_inputs,
            }
            .into());
        }
        let n_plant = width - n_c - n_inputs;
        let lifting = self.lifting_set.fit(n_plant)?;
        let layout = closed_loop_layout(
            lifting.n_lifted(),
            n_inputs - n_y,
            &self.controller,
            &self.c_plant,
        )?;

        let (coef, plant) = match &self.regressor {
            ClosedLoopRegressor::Fixed(coef) => {
                check_coefficients(coef, layout.rows(), layout.cols())?;
                (coef.clone(), None)
            }
            ClosedLoopRegressor::Edmd(edmd) => {
                let snapshots = self.closed_loop_snapshots(episodes, &lifting, &layout, validation)?;
                let plant = edmd.fit(&snapshots)?;
                let u_cl = compose_closed_loop(&plant, &self.controller, &self.c_plant)?;
                (u_cl, Some(plant))
            }
        };

        debug!(
            n_controller = layout.n_controller,
            n_lifted = layout.n_lifted,
            n_reference = layout.n_reference,
            n_feedforward = layout.n_feedforward,
            identified = plant.is_some(),
            "Fitted closed-loop pipeline"
        );
        self.fitted = Some(ClosedLoopFit {
            lifting,
            coef,
            plant,
            layout,
        });
        Ok(self)
    }

    /// Snapshot pairs `[psi(x_p); u] -> psi(x_p)+` where the plant input is
    /// rebuilt from the recorded controller state, reference and feedforward.
    fn closed_loop_snapshots(
        &self,
        episodes: &[Episode],
        lifting: &FittedLifting,
        layout: &ClosedLoopLayout,
        validation: &ValidationConfig,
    ) -> KoopResult<Snapshots> {
        let n_c = layout.n_controller;
        let n_plant = lifting.n_states_in();
        let c_p = pad_output_map(&self.c_plant, layout.n_lifted)?;
        let lookback = lifting.lookback();

        let mut features = Vec::with_capacity(episodes.len());
        let mut targets = Vec::with_capacity(episodes.len());
        for ep in episodes {
            validation.check_finite(&ep.data, "closed-loop training data")?;
            check_length(ep, lookback)?;
            let plant_states = ep.data.columns(n_c, n_plant).into_owned();
            let psi = lifting.transform(&plant_states)?;
            let pairs = psi.nrows() - 1;

            let x_c = ep.data.columns(0, n_c).rows(lookback, pairs).into_owned();
            let r = ep
                .data
                .columns(n_c + n_plant, layout.n_reference)
                .rows(lookback, pairs)
                .into_owned();
            let ff = ep
                .data
                .columns(n_c + n_plant + layout.n_reference, layout.n_feedforward)
                .rows(lookback, pairs)
                .into_owned();
            let psi_now = psi.rows(0, pairs).into_owned();

            // Rows are samples, so u^T = x_c^T C_c^T + (r^T - psi^T C_p^T) D_c^T + ff^T.
            let error = &r - &psi_now * c_p.transpose();
            let u = &x_c * self.controller.c.transpose() + &error * self.controller.d.transpose() + &ff;

            features.push(hstack(&[&psi_now, &u])?);
            targets.push(psi.rows(1, pairs).into_owned());
        }
        Ok(Snapshots {
            features: vstack(&features)?,
            targets: vstack(&targets)?,
        })
    }

    /// Predict `[x_c, x_p]` trajectories from each episode's initial
    /// conditions, reference and feedforward.
    pub fn predict_trajectory(
        &self,
        episodes: &[Episode],
        validation: &ValidationConfig,
    ) -> KoopResult<Vec<Episode>> {
        let fit = self.fitted()?;
        let sim = Simulator {
            lifting: &fit.lifting,
            operator: &fit.coef,
            n_unlifted: fit.layout.n_controller,
            n_states: fit.layout.n_controller + fit.lifting.n_states_in(),
            n_inputs: fit.layout.n_exogenous(),
        };
        episodes
            .iter()
            .map(|ep| sim.run(ep, validation))
            .collect()
    }
}

/// Steps `z+ = U [z; w]` with `z = [x_u; psi(x_l)]`, re-lifting the predicted
/// raw states `x_l` over a sliding window after every step.
struct Simulator<'a> {
    lifting: &'a FittedLifting,
    operator: &'a DMatrix<f64>,
    /// Leading state columns that are carried unlifted (controller state).
    n_unlifted: usize,
    n_states: usize,
    n_inputs: usize,
}

impl Simulator<'_> {
    fn run(&self, episode: &Episode, validation: &ValidationConfig) -> KoopResult<Episode> {
        let expected_width = self.n_states + self.n_inputs;
        if episode.width() != expected_width {
            return Err(ModelError::DimensionMismatch {
                context: format!("episode {} for prediction", episode.index),
                expected_rows: episode.len(),
                expected_cols: expected_width,
                actual_rows: episode.len(),
                actual_cols: episode.width(),
            }
            .into());
        }
        validation.check_finite(&episode.data, "prediction input")?;
        let lookback = self.lifting.lookback();
        if episode.len() <= lookback {
            return Err(ModelError::EpisodeTooShort {
                index: episode.index,
                length: episode.len(),
                required: lookback + 1,
            }
            .into());
        }

        let n_u = self.n_unlifted;
        let n_l = self.n_states - n_u;
        let steps = episode.len();
        let mut predicted = DMatrix::zeros(steps, self.n_states);
        predicted
            .rows_mut(0, lookback + 1)
            .copy_from(&episode.data.view((0, 0), (lookback + 1, self.n_states)));

        let mut window = episode.data.view((0, n_u), (lookback + 1, n_l)).into_owned();
        let mut unlifted: DVector<f64> = episode.data.row(lookback).columns(0, n_u).transpose();
        for k in lookback..steps - 1 {
            let z = concat(&unlifted, &self.lifting.lift_latest(&window)?);
            let w: DVector<f64> = episode
                .data
                .row(k)
                .columns(self.n_states, self.n_inputs)
                .transpose();
            let z_next = self.operator * concat(&z, &w);

            unlifted = z_next.rows(0, n_u).into_owned();
            let raw_next = z_next.rows(n_u, n_l).transpose();
            predicted.view_mut((k + 1, 0), (1, n_u)).copy_from(&unlifted.transpose());
            predicted.view_mut((k + 1, n_u), (1, n_l)).copy_from(&raw_next);

            window = window.remove_row(0).insert_row(lookback, 0.0);
            window.set_row(lookback, &raw_next);
        }
        if !validation.skip_validation() && predicted.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::RegressionFailed {
                message: format!("prediction for episode {} diverged", episode.index),
            }
            .into());
        }
        Ok(Episode::new(episode.index, predicted))
    }
}

fn common_width(episodes: &[Episode]) -> KoopResult<usize> {
    let width = match episodes.first() {
        Some(first) => first.width(),
        None => {
            return Err(koop_types::DataError::InsufficientData {
                message: "no episodes to fit on".to_string(),
            }
            .into())
        }
    };
    if let Some(bad) = episodes.iter().find(|ep| ep.width() != width) {
        return Err(koop_types::DataError::WidthMismatch {
            index: bad.index,
            expected: width,
            actual: bad.width(),
        }
        .into());
    }
    Ok(width)
}

/// Every training episode must yield at least one snapshot pair.
fn check_length(episode: &Episode, lookback: usize) -> KoopResult<()> {
    if episode.len() < lookback + 2 {
        return Err(ModelError::EpisodeTooShort {
            index: episode.index,
            length: episode.len(),
            required: lookback + 2,
        }
        .into());
    }
    Ok(())
}

fn check_coefficients(coef: &DMatrix<f64>, rows: usize, cols: usize) -> KoopResult<()> {
    if coef.nrows() != rows || coef.ncols() != cols {
        return Err(ModelError::CoefficientShape {
            expected_rows: rows,
            expected_cols: cols,
            actual_rows: coef.nrows(),
            actual_cols: coef.ncols(),
        }
        .into());
    }
    Ok(())
}
