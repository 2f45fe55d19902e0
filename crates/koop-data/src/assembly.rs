//! Dataset assembly from raw rotary-pendulum episodes.
//!
//! Open-loop rows are `[theta, alpha, vf]` with one input. Closed-loop rows
//! are `[x_c, theta, alpha, r_theta, r_alpha, ff]` with three inputs, where
//! `x_c` is the controller state reconstructed by simulating the controller
//! on the recorded tracking error.

use std::path::Path;

use koop_model::{ControllerRealization, PdGains};
use koop_types::{combine_episodes, config_error, DataError, Episode, KoopResult};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{ClosedLoopData, ExperimentDataset, OpenLoopData};
use crate::loaders::{RawEpisode, RawEpisodeLoader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyConfig {
    pub t_step: f64,
    /// Samples dropped from the start of every episode.
    pub n_skip: usize,
    /// Trailing episodes held out as the test set.
    pub n_valid: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            t_step: 1.0 / 500.0,
            n_skip: 500,
            n_valid: 2,
        }
    }
}

impl AssemblyConfig {
    pub fn with_t_step(mut self, t_step: f64) -> Self {
        self.t_step = t_step;
        self
    }

    pub fn with_n_skip(mut self, n_skip: usize) -> Self {
        self.n_skip = n_skip;
        self
    }

    pub fn with_n_valid(mut self, n_valid: usize) -> Self {
        self.n_valid = n_valid;
        self
    }
}

/// PD gains for the arm (`theta`) and pendulum (`alpha`) loops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerGains {
    pub kp_theta: f64,
    pub kd_theta: f64,
    pub kp_alpha: f64,
    pub kd_alpha: f64,
    pub tau: f64,
}

impl ControllerGains {
    pub fn realization(&self, t_step: f64) -> KoopResult<ControllerRealization> {
        ControllerRealization::pd_summed(
            &[
                PdGains {
                    kp: self.kp_theta,
                    kd: self.kd_theta,
                    tau: self.tau,
                },
                PdGains {
                    kp: self.kp_alpha,
                    kd: self.kd_alpha,
                    tau: self.tau,
                },
            ],
            t_step,
        )
    }
}

/// Build a dataset bundle from raw episodes recorded under `gains`.
pub fn assemble_dataset(
    episodes: &[RawEpisode],
    gains: &ControllerGains,
    config: &AssemblyConfig,
) -> KoopResult<ExperimentDataset> {
    if episodes.len() <= config.n_valid {
        return Err(config_error!(
            "{} episode(s) cannot leave a training set after holding out {}",
            episodes.len(),
            config.n_valid
        ));
    }
    let controller = gains.realization(config.t_step)?;
    let c_plant = DMatrix::identity(2, 2);

    let mut open_loop = Vec::with_capacity(episodes.len());
    let mut closed_loop = Vec::with_capacity(episodes.len());
    for raw in episodes {
        check_channels(raw, config.n_skip)?;
        if let Some(dt) = raw.sample_period() {
            if (dt - config.t_step).abs() > 1e-6 * config.t_step.max(1.0) {
                warn!(
                    episode = raw.index,
                    recorded = dt,
                    configured = config.t_step,
                    "Recorded sampling period differs from configuration"
                );
            }
        }
        let (ol, cl) = episode_matrices(raw, &controller)?;
        open_loop.push(Episode::new(raw.index, ol).skip_samples(config.n_skip));
        closed_loop.push(Episode::new(raw.index, cl).skip_samples(config.n_skip));
    }

    let n_train = episodes.len() - config.n_valid;
    info!(
        n_train,
        n_valid = config.n_valid,
        n_skip = config.n_skip,
        "Assembled experiment dataset"
    );
    let dataset = ExperimentDataset {
        t_step: config.t_step,
        open_loop: OpenLoopData {
            x_train: combine_episodes(&open_loop[..n_train], true)?,
            x_test: combine_episodes(&open_loop[n_train..], true)?,
            episode_feature: true,
            n_inputs: 1,
        },
        closed_loop: ClosedLoopData {
            x_train: combine_episodes(&closed_loop[..n_train], true)?,
            x_test: combine_episodes(&closed_loop[n_train..], true)?,
            episode_feature: true,
            n_inputs: 3,
            controller,
            c_plant,
        },
    };
    dataset.validate()?;
    Ok(dataset)
}

/// Load every CSV in `dir` and assemble it.
pub fn assemble_from_directory<P: AsRef<Path>>(
    dir: P,
    gains: &ControllerGains,
    config: &AssemblyConfig,
) -> KoopResult<ExperimentDataset> {
    let episodes = RawEpisodeLoader::new().load_directory(dir)?;
    assemble_dataset(&episodes, gains, config)
}

fn check_channels(raw: &RawEpisode, n_skip: usize) -> KoopResult<()> {
    let n = raw.len();
    let lengths = [
        raw.r_theta.len(),
        raw.r_alpha.len(),
        raw.theta.len(),
        raw.alpha.len(),
        raw.ff.len(),
        raw.vf.len(),
    ];
    if lengths.iter().any(|&len| len != n) {
        return Err(DataError::InvalidFormat {
            message: format!("episode {} has channels of unequal length {:?}", raw.index, lengths),
        }
        .into());
    }
    if n <= n_skip {
        return Err(DataError::InsufficientData {
            message: format!("episode {} has {} samples, {} are skipped", raw.index, n, n_skip),
        }
        .into());
    }
    Ok(())
}

fn episode_matrices(
    raw: &RawEpisode,
    controller: &ControllerRealization,
) -> KoopResult<(DMatrix<f64>, DMatrix<f64>)> {
    let n = raw.len();
    let error = DMatrix::from_fn(n, 2, |i, j| match j {
        0 => raw.r_theta[i] - raw.theta[i],
        _ => raw.r_alpha[i] - raw.alpha[i],
    });
    let x_c = controller.simulate(&error, None)?.states;
    let n_c = x_c.ncols();

    let open_loop = DMatrix::from_fn(n, 3, |i, j| match j {
        0 => raw.theta[i],
        1 => raw.alpha[i],
        _ => raw.vf[i],
    });
    let closed_loop = DMatrix::from_fn(n, n_c + 5, |i, j| {
        if j < n_c {
            return x_c[(i, j)];
        }
        match j - n_c {
            0 => raw.theta[i],
            1 => raw.alpha[i],
            2 => raw.r_theta[i],
            3 => raw.r_alpha[i],
            _ => raw.ff[i],
        }
    });
    Ok((open_loop, closed_loop))
}
