//! Small dense linear-algebra helpers shared by the identification code.

use koop_types::{KoopResult, ModelError};
use nalgebra::{DMatrix, DVector};

/// Concatenate matrices with equal row counts side by side.
pub fn hstack(blocks: &[&DMatrix<f64>]) -> KoopResult<DMatrix<f64>> {
    let nrows = blocks.first().map_or(0, |b| b.nrows());
    if let Some(bad) = blocks.iter().find(|b| b.nrows() != nrows) {
        return Err(ModelError::DimensionMismatch {
            context: "hstack".to_string(),
            expected_rows: nrows,
            expected_cols: bad.ncols(),
            actual_rows: bad.nrows(),
            actual_cols: bad.ncols(),
        }
        .into());
    }
    let ncols = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = DMatrix::zeros(nrows, ncols);
    let mut col = 0;
    for block in blocks {
        out.view_mut((0, col), (nrows, block.ncols())).copy_from(*block);
        col += block.ncols();
    }
    Ok(out)
}

/// Concatenate matrices with equal column counts on top of each other.
pub fn vstack(blocks: &[DMatrix<f64>]) -> KoopResult<DMatrix<f64>> {
    let ncols = blocks.first().map_or(0, |b| b.ncols());
    if let Some(bad) = blocks.iter().find(|b| b.ncols() != ncols) {
        return Err(ModelError::DimensionMismatch {
            context: "vstack".to_string(),
            expected_rows: bad.nrows(),
            expected_cols: ncols,
            actual_rows: bad.nrows(),
            actual_cols: bad.ncols(),
        }
        .into());
    }
    let nrows = blocks.iter().map(|b| b.nrows()).sum();
    let mut out = DMatrix::zeros(nrows, ncols);
    let mut row = 0;
    for block in blocks {
        out.view_mut((row, 0), (block.nrows(), ncols)).copy_from(block);
        row += block.nrows();
    }
    Ok(out)
}

/// Concatenate two column vectors.
pub fn concat(top: &DVector<f64>, bottom: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(top.len() + bottom.len());
    out.rows_mut(0, top.len()).copy_from(top);
    out.rows_mut(top.len(), bottom.len()).copy_from(bottom);
    out
}

/// Tikhonov-regularized least squares.
///
/// Returns `U` (`targets.ncols() x features.ncols()`) minimizing
/// `||targets - features * U^T||^2 + alpha * ||U||^2`. Samples are rows.
pub fn ridge_solve(
    features: &DMatrix<f64>,
    targets: &DMatrix<f64>,
    alpha: f64,
) -> KoopResult<DMatrix<f64>> {
    if features.nrows() != targets.nrows() {
        return Err(ModelError::DimensionMismatch {
            context: "ridge regression targets".to_string(),
            expected_rows: features.nrows(),
            expected_cols: targets.ncols(),
            actual_rows: targets.nrows(),
            actual_cols: targets.ncols(),
        }
        .into());
    }
    let n = features.ncols();
    let mut gram = features.tr_mul(features);
    for i in 0..n {
        gram[(i, i)] += alpha;
    }
    let rhs = features.tr_mul(targets);

    let solution = match gram.clone().cholesky() {
        Some(chol) => chol.solve(&rhs),
        // Singular Gram matrix (alpha = 0 with collinear features): minimum-norm solution.
        None => gram
            .svd(true, true)
            .solve(&rhs, 1e-12)
            .map_err(|message| ModelError::RegressionFailed {
                message: message.to_string(),
            })?,
    };
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::RegressionFailed {
            message: "solution contains non-finite coefficients".to_string(),
        }
        .into());
    }
    Ok(solution.transpose())
}
