//! Final evaluation at the best regularization of each study.

use chrono::{DateTime, Utc};
use koop_data::ExperimentDataset;
use koop_model::{
    score_trajectory, ClosedLoopPipeline, ClosedLoopRegressor, Edmd, KoopmanPipeline, LiftingSet, PlantModel,
    PlantRegressor,
};
use koop_types::matrix::serde_matrix;
use koop_types::{combine_episodes, internal_error, Episode, KoopResult, ValidationConfig};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Best `alpha` found by each study.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestAlphas {
    pub closed_loop: f64,
    pub open_loop: f64,
}

/// Predicted and recorded trajectories of one model, as combined matrices
/// with a leading episode column.
///
/// A diverged prediction is kept as produced; its non-finite samples are
/// written as `null` and `r2` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    #[serde(with = "serde_matrix")]
    pub predicted: DMatrix<f64>,
    #[serde(with = "serde_matrix")]
    pub expected: DMatrix<f64>,
    pub r2: Option<f64>,
}

impl TrajectoryRecord {
    fn new(name: &str, predicted: &[Episode], expected: &[Episode], skip: usize) -> KoopResult<Self> {
        let score = score_trajectory(predicted, expected, skip)?;
        let r2 = score.is_finite().then_some(score);
        if r2.is_none() {
            warn!(model = name, "prediction diverged");
        }
        let width = predicted.first().map(Episode::width).unwrap_or(0);
        let expected: Vec<Episode> = expected.iter().map(|ep| ep.leading_columns(width)).collect();
        Ok(Self {
            predicted: combine_episodes(predicted, true)?,
            expected: combine_episodes(&expected, true)?,
            r2,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub best_alpha: BestAlphas,
    /// Closed-loop model on held-out training-controller data.
    pub closed_loop: TrajectoryRecord,
    /// Open-loop model on held-out open-loop data.
    pub open_loop: TrajectoryRecord,
    /// Closed-loop plant estimate under the evaluation controller.
    pub transfer_closed_loop: TrajectoryRecord,
    /// Open-loop plant estimate under the evaluation controller.
    pub transfer_open_loop: TrajectoryRecord,
    pub created_at: DateTime<Utc>,
}

impl EvaluationReport {
    /// Records by name, in report order.
    pub fn records(&self) -> [(&'static str, &TrajectoryRecord); 4] {
        [
            ("closed_loop", &self.closed_loop),
            ("open_loop", &self.open_loop),
            ("transfer_closed_loop", &self.transfer_closed_loop),
            ("transfer_open_loop", &self.transfer_open_loop),
        ]
    }
}

/// Fit on every training episode of `dataset`, then predict its held-out
/// episodes and the held-out episodes of `transfer`, which was recorded under
/// a different controller.
pub fn evaluate(
    dataset: &ExperimentDataset,
    transfer: &ExperimentDataset,
    lifting: &LiftingSet,
    alphas: BestAlphas,
) -> KoopResult<EvaluationReport> {
    dataset.validate()?;
    transfer.validate()?;
    let validation = ValidationConfig::new();

    let cl = &dataset.closed_loop;
    let mut closed_loop = ClosedLoopPipeline::new(
        lifting.clone(),
        ClosedLoopRegressor::Edmd(Edmd::new(alphas.closed_loop)?),
        cl.controller.clone(),
        cl.c_plant.clone(),
    );
    closed_loop.fit(&cl.train_episodes()?, cl.n_inputs, &validation)?;
    let cl_plant = closed_loop
        .plant()
        .cloned()
        .ok_or_else(|| internal_error!("closed-loop regression produced no plant"))?;

    let ol = &dataset.open_loop;
    let mut open_loop = KoopmanPipeline::new(lifting.clone(), PlantRegressor::Edmd(Edmd::new(alphas.open_loop)?));
    open_loop.fit(&ol.train_episodes()?, ol.n_inputs, &validation)?;
    let ol_plant = open_loop.plant()?.clone();

    let transfer_closed_loop = bind_transfer(transfer, lifting, &cl_plant, &validation)?;
    let transfer_open_loop = bind_transfer(transfer, lifting, &ol_plant, &validation)?;

    let cl_test = cl.test_episodes()?;
    let ol_test = ol.test_episodes()?;
    let transfer_test = transfer.closed_loop.test_episodes()?;

    let _relaxed = validation.relaxed();
    let report = EvaluationReport {
        best_alpha: alphas,
        closed_loop: TrajectoryRecord::new(
            "closed_loop",
            &closed_loop.predict_trajectory(&cl_test, &validation)?,
            &cl_test,
            closed_loop.initial_condition_rows()?,
        )?,
        open_loop: TrajectoryRecord::new(
            "open_loop",
            &open_loop.predict_trajectory(&ol_test, &validation)?,
            &ol_test,
            open_loop.initial_condition_rows()?,
        )?,
        transfer_closed_loop: TrajectoryRecord::new(
            "transfer_closed_loop",
            &transfer_closed_loop.predict_trajectory(&transfer_test, &validation)?,
            &transfer_test,
            transfer_closed_loop.initial_condition_rows()?,
        )?,
        transfer_open_loop: TrajectoryRecord::new(
            "transfer_open_loop",
            &transfer_open_loop.predict_trajectory(&transfer_test, &validation)?,
            &transfer_test,
            transfer_open_loop.initial_condition_rows()?,
        )?,
        created_at: Utc::now(),
    };
    info!(
        closed_loop = ?report.closed_loop.r2,
        open_loop = ?report.open_loop.r2,
        transfer_closed_loop = ?report.transfer_closed_loop.r2,
        transfer_open_loop = ?report.transfer_open_loop.r2,
        "evaluation scored"
    );
    Ok(report)
}

/// Compose `plant` with the transfer controller. The operator is fixed; the
/// fit only binds the lifting to the transfer training episodes.
fn bind_transfer(
    transfer: &ExperimentDataset,
    lifting: &LiftingSet,
    plant: &PlantModel,
    validation: &ValidationConfig,
) -> KoopResult<ClosedLoopPipeline> {
    let cl = &transfer.closed_loop;
    let mut model = ClosedLoopPipeline::from_plant(lifting.clone(), plant, cl.controller.clone(), cl.c_plant.clone())?;
    model.fit(&cl.train_episodes()?, cl.n_inputs, validation)?;
    Ok(model)
}
