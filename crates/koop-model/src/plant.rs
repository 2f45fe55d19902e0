//! Plant identification.

use koop_types::{KoopResult, ModelError};
use nalgebra::{DMatrix, DMatrixView};
use tracing::debug;

use crate::linalg::ridge_solve;

/// Identified plant `U_p = [A_p | B_p]` over lifted states and raw inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantModel {
    coef: DMatrix<f64>,
}

impl PlantModel {
    /// Wrap a coefficient matrix; `A_p` is the leading square block.
    pub fn from_coefficients(coef: DMatrix<f64>) -> KoopResult<Self> {
        if coef.nrows() == 0 || coef.ncols() < coef.nrows() {
            return Err(ModelError::CoefficientShape {
                expected_rows: coef.nrows(),
                expected_cols: coef.nrows().max(1),
                actual_rows: coef.nrows(),
                actual_cols: coef.ncols(),
            }
            .into());
        }
        Ok(Self { coef })
    }

    pub fn from_blocks(a: &DMatrix<f64>, b: &DMatrix<f64>) -> KoopResult<Self> {
        if a.nrows() != a.ncols() || b.nrows() != a.nrows() {
            return Err(ModelError::DimensionMismatch {
                context: "plant blocks".to_string(),
                expected_rows: a.nrows(),
                expected_cols: b.ncols(),
                actual_rows: b.nrows(),
                actual_cols: b.ncols(),
            }
            .into());
        }
        Self::from_coefficients(crate::linalg::hstack(&[a, b])?)
    }

    pub fn coefficients(&self) -> &DMatrix<f64> {
        &self.coef
    }

    pub fn n_lifted(&self) -> usize {
        self.coef.nrows()
    }

    pub fn n_inputs(&self) -> usize {
        self.coef.ncols() - self.coef.nrows()
    }

    pub fn a(&self) -> DMatrixView<'_, f64> {
        self.coef.columns(0, self.n_lifted())
    }

    pub fn b(&self) -> DMatrixView<'_, f64> {
        self.coef.columns(self.n_lifted(), self.n_inputs())
    }
}

/// Snapshot pairs for regression: `targets[k]` is the lifted state one step
/// after `features[k] = [lifted state, input]`. Pairs never straddle episodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshots {
    pub features: DMatrix<f64>,
    pub targets: DMatrix<f64>,
}

impl Snapshots {
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }
}

/// Extended dynamic mode decomposition with Tikhonov regularization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edmd {
    alpha: f64,
}

impl Edmd {
    pub fn new(alpha: f64) -> KoopResult<Self> {
        if !(alpha.is_finite() && alpha >= 0.0) {
            return Err(ModelError::InvalidRegularization { alpha }.into());
        }
        Ok(Self { alpha })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Fit `U_p` minimizing `||Y - U_p Theta||^2 + alpha ||U_p||^2`.
    pub fn fit(&self, snapshots: &Snapshots) -> KoopResult<PlantModel> {
        if snapshots.is_empty() {
            return Err(koop_types::DataError::InsufficientData {
                message: "no snapshot pairs to regress on".to_string(),
            }
            .into());
        }
        debug!(
            alpha = self.alpha,
            samples = snapshots.len(),
            features = snapshots.features.ncols(),
            "Fitting EDMD plant model"
        );
        let coef = ridge_solve(&snapshots.features, &snapshots.targets, self.alpha)?;
        PlantModel::from_coefficients(coef)
    }
}
