//! Trajectory scoring.

use koop_types::{DataError, Episode, KoopResult, ModelError};
use nalgebra::DMatrix;

use crate::linalg::vstack;

/// Coefficient of determination, averaged uniformly over columns.
///
/// A constant expected column scores 1 when predicted exactly and 0
/// otherwise.
pub fn r2_score(predicted: &DMatrix<f64>, expected: &DMatrix<f64>) -> KoopResult<f64> {
    if predicted.shape() != expected.shape() {
        return Err(ModelError::DimensionMismatch {
            context: "r2 score".to_string(),
            expected_rows: expected.nrows(),
            expected_cols: expected.ncols(),
            actual_rows: predicted.nrows(),
            actual_cols: predicted.ncols(),
        }
        .into());
    }
    if expected.nrows() == 0 || expected.ncols() == 0 {
        return Err(DataError::InsufficientData {
            message: "cannot score an empty trajectory".to_string(),
        }
        .into());
    }

    let mut total = 0.0;
    for (pred, truth) in predicted.column_iter().zip(expected.column_iter()) {
        let mean = truth.mean();
        let ss_res: f64 = pred.iter().zip(truth.iter()).map(|(p, t)| (t - p).powi(2)).sum();
        let ss_tot: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
        total += if ss_tot != 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };
    }
    Ok(total / expected.ncols() as f64)
}

/// Score predicted trajectories against recorded episodes.
///
/// Expected episodes are cut to the predicted width, and the first `skip`
/// samples of every episode (the initial conditions copied from data) are
/// left out. A prediction that is not finite scores negative infinity.
pub fn score_trajectory(predicted: &[Episode], expected: &[Episode], skip: usize) -> KoopResult<f64> {
    if predicted.len() != expected.len() {
        return Err(DataError::InvalidFormat {
            message: format!(
                "{} predicted episodes for {} expected",
                predicted.len(),
                expected.len()
            ),
        }
        .into());
    }

    let mut pred_blocks = Vec::with_capacity(predicted.len());
    let mut truth_blocks = Vec::with_capacity(expected.len());
    for (pred, truth) in predicted.iter().zip(expected) {
        if pred.index != truth.index || pred.len() != truth.len() || pred.width() > truth.width() {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "predicted episode {} ({}x{}) does not line up with expected episode {} ({}x{})",
                    pred.index,
                    pred.len(),
                    pred.width(),
                    truth.index,
                    truth.len(),
                    truth.width()
                ),
            }
            .into());
        }
        let aligned = truth.leading_columns(pred.width());
        pred_blocks.push(pred.skip_samples(skip).data);
        truth_blocks.push(aligned.skip_samples(skip).data);
    }

    let pred = vstack(&pred_blocks)?;
    if pred.iter().any(|v| !v.is_finite()) {
        return Ok(f64::NEG_INFINITY);
    }
    let score = r2_score(&pred, &vstack(&truth_blocks)?)?;
    Ok(if score.is_finite() { score } else { f64::NEG_INFINITY })
}
