// ekf_core/src/lib.rs

//! A 24-state navigation filter that fuses delayed sensor observations at a
//! fusion horizon behind the IMU and predicts the solution forward to the
//! newest IMU sample.

pub mod buffers;
pub mod errors;
pub mod estimation;
pub mod frames;
pub mod messages;
pub mod params;
pub mod prelude;
pub mod types;
