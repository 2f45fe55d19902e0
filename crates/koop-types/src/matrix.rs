//! Row-major serde representation for `DMatrix<f64>`.
//!
//! Use with `#[serde(with = "koop_types::matrix::serde_matrix")]`. Matrices are
//! written as `{ "nrows": .., "ncols": .., "rows": [[..], ..] }` so that
//! datasets and reports stay readable and zero-row matrices keep their width.
//! JSON has no non-finite numbers: they are written as `null` and read back
//! as NaN.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct MatrixRepr {
    nrows: usize,
    ncols: usize,
    rows: Vec<Vec<Option<f64>>>,
}

impl From<&DMatrix<f64>> for MatrixRepr {
    fn from(m: &DMatrix<f64>) -> Self {
        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            rows: m
                .row_iter()
                .map(|row| row.iter().map(|v| v.is_finite().then_some(*v)).collect())
                .collect(),
        }
    }
}

impl MatrixRepr {
    fn into_matrix(self) -> Result<DMatrix<f64>, String> {
        if self.rows.len() != self.nrows {
            return Err(format!(
                "matrix declares {} rows but contains {}",
                self.nrows,
                self.rows.len()
            ));
        }
        if let Some((i, row)) = self
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.ncols)
        {
            return Err(format!(
                "row {i} has {} columns, expected {}",
                row.len(),
                self.ncols
            ));
        }
        let flat: Vec<f64> = self
            .rows
            .into_iter()
            .flatten()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(DMatrix::from_row_slice(self.nrows, self.ncols, &flat))
    }
}

pub mod serde_matrix {
    use super::MatrixRepr;
    use nalgebra::DMatrix;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &DMatrix<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        MatrixRepr::from(m).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DMatrix<f64>, D::Error> {
        MatrixRepr::deserialize(deserializer)?
            .into_matrix()
            .map_err(serde::de::Error::custom)
    }
}
