//! Discrete-time linear controller realizations.

use koop_types::matrix::serde_matrix;
use koop_types::{KoopResult, ModelError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// State-space realization `x[k+1] = A x[k] + B e[k]`, `y[k] = C x[k] + D e[k]`.
///
/// `e` is the tracking error seen by the controller (`n_inputs` channels) and
/// `y` the control signal sent to the plant (`n_outputs` channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerRealization {
    #[serde(with = "serde_matrix")]
    pub a: DMatrix<f64>,
    #[serde(with = "serde_matrix")]
    pub b: DMatrix<f64>,
    #[serde(with = "serde_matrix")]
    pub c: DMatrix<f64>,
    #[serde(with = "serde_matrix")]
    pub d: DMatrix<f64>,
}

/// Gains for one channel of a PD controller with filtered derivative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdGains {
    pub kp: f64,
    pub kd: f64,
    /// Derivative filter constant.
    pub tau: f64,
}

/// Result of [`ControllerRealization::simulate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerResponse {
    /// Controller state at each sample, one row per sample.
    pub states: DMatrix<f64>,
    /// Controller output at each sample.
    pub outputs: DMatrix<f64>,
}

impl ControllerRealization {
    pub fn new(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        c: DMatrix<f64>,
        d: DMatrix<f64>,
    ) -> KoopResult<Self> {
        let controller = Self { a, b, c, d };
        controller.validate()?;
        Ok(controller)
    }

    /// Check that the four matrices form a consistent realization.
    ///
    /// Deserialized realizations bypass [`ControllerRealization::new`], so
    /// loaders call this explicitly.
    pub fn validate(&self) -> KoopResult<()> {
        let n = self.a.nrows();
        if self.a.ncols() != n {
            return Err(invalid(format!("A_c must be square, got {}x{}", n, self.a.ncols())));
        }
        if self.b.nrows() != n {
            return Err(shape("B_c", n, self.b.ncols(), &self.b));
        }
        if self.c.ncols() != n {
            return Err(shape("C_c", self.c.nrows(), n, &self.c));
        }
        if self.d.nrows() != self.c.nrows() || self.d.ncols() != self.b.ncols() {
            return Err(shape("D_c", self.c.nrows(), self.b.ncols(), &self.d));
        }
        if self.b.ncols() == 0 || self.c.nrows() == 0 {
            return Err(invalid("controller needs at least one input and one output".to_string()));
        }
        let all_finite = [&self.a, &self.b, &self.c, &self.d]
            .iter()
            .all(|m| m.iter().all(|v| v.is_finite()));
        if !all_finite {
            return Err(invalid("realization contains non-finite entries".to_string()));
        }
        Ok(())
    }

    pub fn n_states(&self) -> usize {
        self.a.nrows()
    }

    /// Width of the tracking-error input.
    pub fn n_inputs(&self) -> usize {
        self.b.ncols()
    }

    /// Width of the control output.
    pub fn n_outputs(&self) -> usize {
        self.c.nrows()
    }

    /// Forced response to an input sequence (one row per sample).
    pub fn simulate(
        &self,
        inputs: &DMatrix<f64>,
        x0: Option<&DVector<f64>>,
    ) -> KoopResult<ControllerResponse> {
        if inputs.ncols() != self.n_inputs() {
            return Err(shape("controller input", inputs.nrows(), self.n_inputs(), inputs));
        }
        let mut x = match x0 {
            Some(x0) if x0.len() != self.n_states() => {
                return Err(ModelError::DimensionMismatch {
                    context: "controller initial state".to_string(),
                    expected_rows: self.n_states(),
                    expected_cols: 1,
                    actual_rows: x0.len(),
                    actual_cols: 1,
                }
                .into())
            }
            Some(x0) => x0.clone(),
            None => DVector::zeros(self.n_states()),
        };

        let steps = inputs.nrows();
        let mut states = DMatrix::zeros(steps, self.n_states());
        let mut outputs = DMatrix::zeros(steps, self.n_outputs());
        for k in 0..steps {
            let e = inputs.row(k).transpose();
            let y = &self.c * &x + &self.d * &e;
            states.set_row(k, &x.transpose());
            outputs.set_row(k, &y.transpose());
            x = &self.a * &x + &self.b * &e;
        }
        Ok(ControllerResponse { states, outputs })
    }

    /// PD controllers with filtered derivative, one per error channel, whose
    /// outputs are summed into a single control signal.
    ///
    /// Each channel implements `-kp - kd * D(z)` with the backward-difference
    /// derivative `D(z) = a (z - 1) / (z - b)`, `a = tau / (1 + tau * t_step)`
    /// and `b = 1 / (1 + tau * t_step)`.
    pub fn pd_summed(channels: &[PdGains], t_step: f64) -> KoopResult<Self> {
        if channels.is_empty() {
            return Err(invalid("PD controller needs at least one channel".to_string()));
        }
        if !(t_step > 0.0 && t_step.is_finite()) {
            return Err(invalid(format!("sampling period must be positive, got {t_step}")));
        }
        let n = channels.len();
        let mut a = DMatrix::zeros(n, n);
        let mut c = DMatrix::zeros(1, n);
        let mut d = DMatrix::zeros(1, n);
        for (i, gains) in channels.iter().enumerate() {
            if !(gains.tau > 0.0) {
                return Err(invalid(format!("channel {i} has non-positive tau {}", gains.tau)));
            }
            let gain = gains.tau / (1.0 + gains.tau * t_step);
            let pole = 1.0 / (1.0 + gains.tau * t_step);
            a[(i, i)] = pole;
            c[(0, i)] = -gains.kd * gain * (pole - 1.0);
            d[(0, i)] = -gains.kp - gains.kd * gain;
        }
        Self::new(a, DMatrix::identity(n, n), c, d)
    }
}

fn invalid(message: String) -> koop_types::KoopError {
    ModelError::InvalidController { message }.into()
}

fn shape(context: &str, rows: usize, cols: usize, actual: &DMatrix<f64>) -> koop_types::KoopError {
    ModelError::DimensionMismatch {
        context: context.to_string(),
        expected_rows: rows,
        expected_cols: cols,
        actual_rows: actual.nrows(),
        actual_cols: actual.ncols(),
    }
    .into()
}
