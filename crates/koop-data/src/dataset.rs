//! Experiment dataset bundle.
//!
//! One bundle holds everything a search worker or the evaluator needs from a
//! single experiment campaign: the sampling period, open-loop and closed-loop
//! train/test combined matrices, and the controller that produced the
//! closed-loop data.

use std::path::Path;

use koop_model::ControllerRealization;
use koop_types::matrix::serde_matrix;
use koop_types::{config_error, episode_indices, split_episodes, Episode, KoopResult};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::storage::{read_json, write_json};

/// Open-loop data: columns `[plant states..., plant inputs...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenLoopData {
    #[serde(rename = "X_train", with = "serde_matrix")]
    pub x_train: DMatrix<f64>,
    #[serde(rename = "X_test", with = "serde_matrix")]
    pub x_test: DMatrix<f64>,
    pub episode_feature: bool,
    pub n_inputs: usize,
}

/// Closed-loop data: columns `[x_c..., plant states..., references..., feedforward...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLoopData {
    #[serde(rename = "X_train", with = "serde_matrix")]
    pub x_train: DMatrix<f64>,
    #[serde(rename = "X_test", with = "serde_matrix")]
    pub x_test: DMatrix<f64>,
    pub episode_feature: bool,
    pub n_inputs: usize,
    pub controller: ControllerRealization,
    #[serde(rename = "C_plant", with = "serde_matrix")]
    pub c_plant: DMatrix<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDataset {
    pub t_step: f64,
    pub open_loop: OpenLoopData,
    pub closed_loop: ClosedLoopData,
}

impl OpenLoopData {
    pub fn train_episodes(&self) -> KoopResult<Vec<Episode>> {
        split_episodes(&self.x_train, self.episode_feature)
    }

    pub fn test_episodes(&self) -> KoopResult<Vec<Episode>> {
        split_episodes(&self.x_test, self.episode_feature)
    }
}

impl ClosedLoopData {
    pub fn train_episodes(&self) -> KoopResult<Vec<Episode>> {
        split_episodes(&self.x_train, self.episode_feature)
    }

    pub fn test_episodes(&self) -> KoopResult<Vec<Episode>> {
        split_episodes(&self.x_test, self.episode_feature)
    }

    /// Width of the recorded plant state.
    pub fn n_plant_states(&self) -> usize {
        let offset = usize::from(self.episode_feature);
        self.x_train
            .ncols()
            .saturating_sub(offset + self.controller.n_states() + self.n_inputs)
    }
}

impl ExperimentDataset {
    pub fn load<P: AsRef<Path>>(path: P) -> KoopResult<Self> {
        let dataset: Self = read_json(path.as_ref())?;
        dataset.validate()?;
        tracing::info!(
            "Loaded dataset {} (open-loop {}x{}, closed-loop {}x{})",
            path.as_ref().display(),
            dataset.open_loop.x_train.nrows(),
            dataset.open_loop.x_train.ncols(),
            dataset.closed_loop.x_train.nrows(),
            dataset.closed_loop.x_train.ncols()
        );
        Ok(dataset)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> KoopResult<()> {
        self.validate()?;
        write_json(path, self)
    }

    /// Structural checks. Deserialized controllers are validated here since
    /// they bypass the checked constructor.
    pub fn validate(&self) -> KoopResult<()> {
        if !(self.t_step > 0.0 && self.t_step.is_finite()) {
            return Err(config_error!("sampling period must be positive, got {}", self.t_step));
        }

        let ol = &self.open_loop;
        let ol_offset = usize::from(ol.episode_feature);
        if ol.x_test.ncols() != ol.x_train.ncols() {
            return Err(config_error!(
                "open-loop test width {} differs from train width {}",
                ol.x_test.ncols(),
                ol.x_train.ncols()
            ));
        }
        if ol.x_train.ncols() <= ol_offset + ol.n_inputs {
            return Err(config_error!(
                "open-loop data has {} columns, no room for states beside {} input(s)",
                ol.x_train.ncols(),
                ol.n_inputs
            ));
        }

        let cl = &self.closed_loop;
        cl.controller.validate()?;
        if cl.x_test.ncols() != cl.x_train.ncols() {
            return Err(config_error!(
                "closed-loop test width {} differs from train width {}",
                cl.x_test.ncols(),
                cl.x_train.ncols()
            ));
        }
        if cl.c_plant.nrows() != cl.controller.n_inputs() {
            return Err(config_error!(
                "C_plant has {} rows, controller tracks {} output(s)",
                cl.c_plant.nrows(),
                cl.controller.n_inputs()
            ));
        }
        if cl.n_inputs != cl.controller.n_inputs() + cl.controller.n_outputs() {
            return Err(config_error!(
                "closed-loop n_inputs is {}, expected {} references plus {} feedforward",
                cl.n_inputs,
                cl.controller.n_inputs(),
                cl.controller.n_outputs()
            ));
        }
        let n_plant = cl.n_plant_states();
        if n_plant == 0 || cl.c_plant.ncols() > n_plant {
            return Err(config_error!(
                "closed-loop data has {} plant state(s), C_plant needs {}",
                n_plant,
                cl.c_plant.ncols()
            ));
        }

        // Cross-validation splits both training sets by the same episodes.
        if ol.episode_feature && cl.episode_feature {
            let ol_eps = episode_indices(&ol.train_episodes()?);
            let cl_eps = episode_indices(&cl.train_episodes()?);
            if ol_eps != cl_eps {
                return Err(config_error!(
                    "open-loop and closed-loop training sets cover different episodes"
                ));
            }
        }
        Ok(())
    }
}
