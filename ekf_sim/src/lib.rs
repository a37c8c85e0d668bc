// ekf_sim/src/lib.rs

//! Scenario harness for `ekf_core`: a kinematic vehicle, synthetic sensors
//! and a runner that scores the filter against the truth.

pub mod cli;
pub mod errors;
pub mod prelude;
pub mod simulation;
