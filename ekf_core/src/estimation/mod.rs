// ekf_core/src/estimation/mod.rs

//! The delayed-horizon navigation filter.
//!
//! [`Ekf`] owns every component. Its methods are spread over the
//! submodules by concern: prediction, fusion, mode control, resets, the
//! terrain estimator and the host interface.

pub mod control;
pub mod ekf;
pub mod fusion;
pub mod interface;
pub mod output;
pub mod predictor;
pub mod reset;
pub mod state;
pub mod status;
pub mod terrain;

pub use ekf::Ekf;
