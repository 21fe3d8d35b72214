// Kalman filter module
// Position estimation for tracked entities

pub mod linalg;
pub mod state;

pub use state::{Estimator, EstimatorConfig, EstimatorState};
