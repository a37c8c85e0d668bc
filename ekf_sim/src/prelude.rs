// ekf_sim/src/prelude.rs

// Re-export the core prelude so harness code sees the filter types.
pub use ekf_core::prelude::*;

pub use crate::errors::{SimError, SimResult};
pub use crate::simulation::config::ScenarioConfig;
pub use crate::simulation::runner::{RunSummary, Simulation, TrackingError};
pub use crate::simulation::trajectory::{TrajectoryConfig, TruthSample};
