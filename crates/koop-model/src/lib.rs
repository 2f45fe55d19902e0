//! # koop-model
//!
//! Koopman model identification for Koopweave: lifting functions, controller
//! realizations, regularized plant identification, closed-loop composition,
//! trajectory prediction and scoring.

pub mod composer;
pub mod controller;
pub mod lifting;
pub mod linalg;
pub mod pipeline;
pub mod plant;
pub mod scoring;

pub use composer::{compose_closed_loop, pad_output_map, ClosedLoopLayout};
pub use controller::{ControllerRealization, ControllerResponse, PdGains};
pub use lifting::{FittedLifting, LiftingFn, LiftingSet, LiftingStep};
pub use pipeline::{ClosedLoopPipeline, ClosedLoopRegressor, KoopmanPipeline, PlantRegressor};
pub use plant::{Edmd, PlantModel, Snapshots};
pub use scoring::{r2_score, score_trajectory};
