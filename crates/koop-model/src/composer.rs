//! Closed-loop composition of an identified plant with a known controller.
//!
//! The closed-loop state is `[x_c; x_p]` (controller state, lifted plant
//! state) and the exogenous input is `[r; f]` (reference, feedforward):
//!
//! ```text
//! U_cl = [ A_c       -B_c C_p            B_c       0   ]
//!        [ B_p C_c    A_p - B_p D_c C_p  B_p D_c   B_p ]
//! ```
//!
//! where `C_p` is the output map padded with zero columns to the lifted width.

use koop_types::{KoopResult, ModelError};
use nalgebra::DMatrix;

use crate::controller::ControllerRealization;
use crate::plant::PlantModel;

/// Block sizes of a composed closed-loop operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedLoopLayout {
    pub n_controller: usize,
    pub n_lifted: usize,
    pub n_reference: usize,
    pub n_feedforward: usize,
}

impl ClosedLoopLayout {
    pub fn n_state(&self) -> usize {
        self.n_controller + self.n_lifted
    }

    pub fn n_exogenous(&self) -> usize {
        self.n_reference + self.n_feedforward
    }

    pub fn rows(&self) -> usize {
        self.n_state()
    }

    pub fn cols(&self) -> usize {
        self.n_state() + self.n_exogenous()
    }
}

/// Pad `C_plant` with zero columns so it acts on the full lifted state.
pub fn pad_output_map(c_plant: &DMatrix<f64>, n_lifted: usize) -> KoopResult<DMatrix<f64>> {
    if c_plant.ncols() > n_lifted || c_plant.nrows() == 0 {
        return Err(ModelError::DimensionMismatch {
            context: "output map".to_string(),
            expected_rows: c_plant.nrows().max(1),
            expected_cols: n_lifted,
            actual_rows: c_plant.nrows(),
            actual_cols: c_plant.ncols(),
        }
        .into());
    }
    let mut padded = DMatrix::zeros(c_plant.nrows(), n_lifted);
    padded
        .columns_mut(0, c_plant.ncols())
        .copy_from(c_plant);
    Ok(padded)
}

/// Shape check shared by composition and by fixed-coefficient pipelines.
pub fn closed_loop_layout(
    n_lifted: usize,
    plant_inputs: usize,
    controller: &ControllerRealization,
    c_plant: &DMatrix<f64>,
) -> KoopResult<ClosedLoopLayout> {
    controller.validate()?;
    if c_plant.nrows() != controller.n_inputs() {
        return Err(ModelError::DimensionMismatch {
            context: "output map rows vs controller inputs".to_string(),
            expected_rows: controller.n_inputs(),
            expected_cols: c_plant.ncols(),
            actual_rows: c_plant.nrows(),
            actual_cols: c_plant.ncols(),
        }
        .into());
    }
    if c_plant.ncols() > n_lifted {
        return Err(ModelError::DimensionMismatch {
            context: "output map columns vs lifted state".to_string(),
            expected_rows: c_plant.nrows(),
            expected_cols: n_lifted,
            actual_rows: c_plant.nrows(),
            actual_cols: c_plant.ncols(),
        }
        .into());
    }
    if plant_inputs != controller.n_outputs() {
        return Err(ModelError::DimensionMismatch {
            context: "plant inputs vs controller outputs".to_string(),
            expected_rows: n_lifted,
            expected_cols: controller.n_outputs(),
            actual_rows: n_lifted,
            actual_cols: plant_inputs,
        }
        .into());
    }
    Ok(ClosedLoopLayout {
        n_controller: controller.n_states(),
        n_lifted,
        n_reference: controller.n_inputs(),
        n_feedforward: plant_inputs,
    })
}

/// Compose `U_cl` from a plant model, a controller and an output map.
///
/// Pure function: the same inputs always give the same operator, so a plant
/// identified under one controller can be recombined with another.
pub fn compose_closed_loop(
    plant: &PlantModel,
    controller: &ControllerRealization,
    c_plant: &DMatrix<f64>,
) -> KoopResult<DMatrix<f64>> {
    let layout = closed_loop_layout(plant.n_lifted(), plant.n_inputs(), controller, c_plant)?;
    let c_p = pad_output_map(c_plant, layout.n_lifted)?;

    let a_p = plant.a();
    let b_p = plant.b();
    let (nc, p, ny, m) = (
        layout.n_controller,
        layout.n_lifted,
        layout.n_reference,
        layout.n_feedforward,
    );

    let mut u_cl = DMatrix::zeros(layout.rows(), layout.cols());
    // Controller rows.
    u_cl.view_mut((0, 0), (nc, nc)).copy_from(&controller.a);
    u_cl.view_mut((0, nc), (nc, p)).copy_from(&(-(&controller.b * &c_p)));
    u_cl.view_mut((0, nc + p), (nc, ny)).copy_from(&controller.b);
    // Plant rows.
    let b_d = &b_p * &controller.d;
    u_cl.view_mut((nc, 0), (p, nc)).copy_from(&(&b_p * &controller.c));
    u_cl.view_mut((nc, nc), (p, p)).copy_from(&(&a_p - &b_d * &c_p));
    u_cl.view_mut((nc, nc + p), (p, ny)).copy_from(&b_d);
    u_cl.view_mut((nc, nc + p + ny), (p, m)).copy_from(&b_p);
    Ok(u_cl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn pd_like(nc: usize, ny: usize, m: usize) -> ControllerRealization {
        ControllerRealization::new(
            DMatrix::from_fn(nc, nc, |i, j| if i == j { 0.8 } else { 0.05 }),
            DMatrix::from_fn(nc, ny, |i, j| (i + j) as f64 * 0.1 + 1.0),
            DMatrix::from_fn(m, nc, |i, j| (i as f64 - j as f64) * 0.3),
            DMatrix::from_fn(m, ny, |i, j| -0.2 * (i + 2 * j + 1) as f64),
        )
        .unwrap()
    }

    #[test]
    fn literal_scalar_example() {
        let controller = ControllerRealization::new(scalar(0.5), scalar(1.0), scalar(1.0), scalar(0.0)).unwrap();
        let plant = PlantModel::from_blocks(&scalar(0.9), &scalar(1.0)).unwrap();
        let u_cl = compose_closed_loop(&plant, &controller, &scalar(1.0)).unwrap();
        let expected = DMatrix::from_row_slice(2, 4, &[0.5, -1.0, 1.0, 0.0, 1.0, 0.9, 0.0, 1.0]);
        assert_eq!(u_cl, expected);
    }

    #[test]
    fn composed_dimensions() {
        for &(nc, p, ny, m) in &[(1, 1, 1, 1), (2, 55, 2, 1), (3, 7, 2, 2)] {
            let controller = pd_like(nc, ny, m);
            let a = DMatrix::from_fn(p, p, |i, j| if i == j { 0.9 } else { 0.0 });
            let b = DMatrix::from_element(p, m, 0.1);
            let plant = PlantModel::from_blocks(&a, &b).unwrap();
            let c_plant = DMatrix::from_fn(ny, ny.min(p), |i, j| if i == j { 1.0 } else { 0.0 });
            let u_cl = compose_closed_loop(&plant, &controller, &c_plant).unwrap();
            assert_eq!(u_cl.nrows(), nc + p);
            assert_eq!(u_cl.ncols(), nc + p + ny + m);
        }
    }

    #[test]
    fn zero_input_matrix_decouples_plant() {
        let (nc, p, ny, m) = (2, 4, 2, 1);
        let controller = pd_like(nc, ny, m);
        let a = DMatrix::from_fn(p, p, |i, j| 0.1 * (i * p + j) as f64);
        let plant = PlantModel::from_blocks(&a, &DMatrix::zeros(p, m)).unwrap();
        let c_plant = DMatrix::identity(ny, ny);
        let u_cl = compose_closed_loop(&plant, &controller, &c_plant).unwrap();

        let plant_rows = u_cl.rows(nc, p);
        assert!(plant_rows.columns(0, nc).iter().all(|v| *v == 0.0));
        assert_eq!(plant_rows.columns(nc, p).into_owned(), a);
        assert!(plant_rows.columns(nc + p, ny + m).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn composition_matches_feedback_simulation() {
        let (nc, p, ny, m) = (2, 3, 2, 1);
        let controller = pd_like(nc, ny, m);
        let a = DMatrix::from_fn(p, p, |i, j| if i == j { 0.7 } else { 0.05 * (i + j) as f64 });
        let b = DMatrix::from_fn(p, m, |i, _| 0.2 * (i + 1) as f64);
        let plant = PlantModel::from_blocks(&a, &b).unwrap();
        let c_plant = DMatrix::identity(ny, ny);
        let u_cl = compose_closed_loop(&plant, &controller, &c_plant).unwrap();
        let c_p = pad_output_map(&c_plant, p).unwrap();

        let mut xc = nalgebra::DVector::from_element(nc, 0.1);
        let mut xp = nalgebra::DVector::from_fn(p, |i, _| 0.3 * i as f64);
        let mut z = crate::linalg::concat(&xc, &xp);
        for k in 0..20 {
            let r = nalgebra::DVector::from_fn(ny, |i, _| ((k + i) as f64 * 0.2).cos());
            let f = nalgebra::DVector::from_element(m, 0.05 * k as f64);

            let e = &r - &c_p * &xp;
            let u = &controller.c * &xc + &controller.d * &e + &f;
            let xc_next = &controller.a * &xc + &controller.b * &e;
            let xp_next = &a * &xp + &b * &u;
            xc = xc_next;
            xp = xp_next;

            let w = crate::linalg::concat(&r, &f);
            z = &u_cl * crate::linalg::concat(&z, &w);
            let expected = crate::linalg::concat(&xc, &xp);
            assert!((&z - expected).abs().max() < 1e-12);
        }
    }

    #[test]
    fn mismatched_shapes_are_configuration_errors() {
        let controller = pd_like(2, 2, 1);
        let plant = PlantModel::from_blocks(&DMatrix::identity(3, 3), &DMatrix::zeros(3, 1)).unwrap();

        // Output map with three rows but controller expects two.
        let err = compose_closed_loop(&plant, &controller, &DMatrix::identity(3, 3)).unwrap_err();
        assert!(err.is_configuration());

        // Output map wider than lifted state.
        let err = compose_closed_loop(&plant, &controller, &DMatrix::zeros(2, 4)).unwrap_err();
        assert!(err.is_configuration());

        // Plant with two inputs, controller drives one.
        let wide = PlantModel::from_blocks(&DMatrix::identity(3, 3), &DMatrix::zeros(3, 2)).unwrap();
        let err = compose_closed_loop(&wide, &controller, &DMatrix::identity(2, 2)).unwrap_err();
        assert!(err.is_configuration());
    }
}
