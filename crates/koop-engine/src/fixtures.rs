//! Synthetic experiments for engine tests.
//!
//! A stable two-state linear plant with one input is run in feedback with a
//! summed PD controller, recorded as raw episodes and assembled exactly the way
//! real recordings are. With a first-order polynomial lifting the model class
//! contains the true plant, so identification is exact up to regularization.

use koop_data::{assemble_dataset, AssemblyConfig, ControllerGains, ExperimentDataset, RawEpisode};
use koop_model::{LiftingFn, LiftingSet};
use nalgebra::{DMatrix, DVector};

pub(crate) const T_STEP: f64 = 0.01;

pub(crate) fn training_gains() -> ControllerGains {
    ControllerGains {
        kp_theta: 1.0,
        kd_theta: 0.01,
        kp_alpha: 1.0,
        kd_alpha: 0.01,
        tau: 50.0,
    }
}

pub(crate) fn transfer_gains() -> ControllerGains {
    ControllerGains {
        kp_theta: 2.0,
        kd_theta: 0.02,
        kp_alpha: 0.5,
        kd_alpha: 0.01,
        tau: 40.0,
    }
}

pub(crate) fn linear_lifting() -> LiftingSet {
    LiftingSet::new().with_step("poly", LiftingFn::Polynomial { order: 1 })
}

fn record(index: usize, len: usize, gains: &ControllerGains) -> RawEpisode {
    let a = DMatrix::from_row_slice(2, 2, &[0.98, 0.01, -0.02, 0.95]);
    let b = DVector::from_column_slice(&[-0.01, -0.02]);
    let controller = gains.realization(T_STEP).expect("valid gains");

    let mut x = DVector::from_column_slice(&[0.1 * index as f64, -0.05]);
    let mut x_c = DVector::zeros(controller.n_states());
    let mut raw = RawEpisode {
        index,
        t: Vec::with_capacity(len),
        r_theta: Vec::with_capacity(len),
        r_alpha: Vec::with_capacity(len),
        theta: Vec::with_capacity(len),
        alpha: Vec::with_capacity(len),
        ff: Vec::with_capacity(len),
        vf: Vec::with_capacity(len),
    };
    for k in 0..len {
        let phase = index as f64;
        let r = DVector::from_column_slice(&[0.3 * (0.05 * k as f64 + phase).sin(), 0.0]);
        let ff = 0.2 * (0.11 * k as f64 + 0.5 * phase).sin();
        let e = &r - &x;
        let y = (&controller.c * &x_c + &controller.d * &e)[0];
        let u = y + ff;

        raw.t.push(k as f64 * T_STEP);
        raw.r_theta.push(r[0]);
        raw.r_alpha.push(r[1]);
        raw.theta.push(x[0]);
        raw.alpha.push(x[1]);
        raw.ff.push(ff);
        raw.vf.push(u);

        x_c = &controller.a * &x_c + &controller.b * &e;
        x = &a * &x + &b * u;
    }
    raw
}

/// Six 40-sample episodes (five skipped), the last two held out.
pub(crate) fn synthetic_dataset(gains: &ControllerGains) -> ExperimentDataset {
    let episodes: Vec<RawEpisode> = (0..6).map(|i| record(i, 40, gains)).collect();
    let config = AssemblyConfig::default()
        .with_t_step(T_STEP)
        .with_n_skip(5)
        .with_n_valid(2);
    assemble_dataset(&episodes, gains, &config).expect("consistent synthetic dataset")
}
