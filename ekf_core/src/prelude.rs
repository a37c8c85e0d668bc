// ekf_core/src/prelude.rs

// --- Filter ---
pub use crate::errors::{EkfError, EkfResult};
pub use crate::estimation::interface::{ControlLimits, EkfOrigin};
pub use crate::estimation::state::StateSample;
pub use crate::estimation::status::{
    innovation_fault, solution_status, ControlStatus, FaultStatus, InnovationTestStatus,
};
pub use crate::estimation::Ekf;

// --- Configuration ---
pub use crate::params::{fusion_mask, gps_check_mask, EkfParams, HeightSensor, MagFuseType};

// --- Sensor samples ---
pub use crate::messages::{
    AirspeedSample, AuxVelSample, BaroSample, ExtVisionSample, FlowSample, GpsMessage, ImuSample,
    MagSample, OutputSample, RangeSample,
};

// --- Numeric types ---
pub use crate::types::{Quatf, TimeUs, Vector2f, Vector3f};
