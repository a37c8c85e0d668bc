// ekf_core/src/messages.rs

//! Sensor sample contracts consumed by the estimator and the output sample
//! it produces. Every sample carries the time it was measured, in the IMU
//! clock; the estimator subtracts the configured sensor delays itself.

use crate::types::{Quatf, TimeUs, Vector2f, Vector3f};

// =========================================================================
// == Inertial Data ==
// =========================================================================

/// Integrated IMU output over one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// Delta angle in body frame, integrated over `delta_ang_dt` (rad).
    pub delta_ang: Vector3f,
    /// Delta velocity in body frame, integrated over `delta_vel_dt` (m/s).
    pub delta_vel: Vector3f,
    pub delta_ang_dt: f32,
    pub delta_vel_dt: f32,
    pub time_us: TimeUs,
}

impl Default for ImuSample {
    fn default() -> Self {
        Self {
            delta_ang: Vector3f::zeros(),
            delta_vel: Vector3f::zeros(),
            delta_ang_dt: 0.0,
            delta_vel_dt: 0.0,
            time_us: 0,
        }
    }
}

// =========================================================================
// == Position and Velocity Aiding ==
// =========================================================================

/// A GPS receiver solution as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsMessage {
    pub time_us: TimeUs,
    /// Latitude (deg).
    pub lat: f64,
    /// Longitude (deg).
    pub lon: f64,
    /// Altitude above mean sea level (m).
    pub alt: f32,
    /// Heading from a dual antenna receiver (rad), if available.
    pub yaw: Option<f32>,
    /// 0-1 no fix, 2 2D fix, 3 3D fix, 4 RTCM differential, 5 RTK float,
    /// 6 RTK fixed.
    pub fix_type: u8,
    /// Horizontal position accuracy (m).
    pub eph: f32,
    /// Vertical position accuracy (m).
    pub epv: f32,
    /// Speed accuracy (m/s).
    pub sacc: f32,
    /// Ground speed (m/s).
    pub vel_m_s: f32,
    /// NED velocity (m/s).
    pub vel_ned: Vector3f,
    pub vel_ned_valid: bool,
    pub nsats: u8,
    pub pdop: f32,
}

impl Default for GpsMessage {
    fn default() -> Self {
        Self {
            time_us: 0,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            yaw: None,
            fix_type: 0,
            eph: 0.0,
            epv: 0.0,
            sacc: 0.0,
            vel_m_s: 0.0,
            vel_ned: Vector3f::zeros(),
            vel_ned_valid: false,
            nsats: 0,
            pdop: 0.0,
        }
    }
}

/// A GPS observation projected into the local frame, as stored for fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSample {
    pub time_us: TimeUs,
    /// North/East position relative to the origin (m).
    pub pos: Vector2f,
    /// Height above the origin altitude (m, positive up).
    pub hgt: f32,
    /// NED velocity (m/s).
    pub vel: Vector3f,
    /// Antenna baseline heading (rad), if reported.
    pub yaw: Option<f32>,
    pub hacc: f32,
    pub vacc: f32,
    pub sacc: f32,
}

impl Default for GpsSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            pos: Vector2f::zeros(),
            hgt: 0.0,
            vel: Vector3f::zeros(),
            yaw: None,
            hacc: 0.0,
            vacc: 0.0,
            sacc: 0.0,
        }
    }
}

/// External vision pose estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtVisionSample {
    pub time_us: TimeUs,
    /// Position in the vision system's NED-like frame (m).
    pub pos: Vector3f,
    /// Orientation, body to vision frame.
    pub quat: Quatf,
    /// One sigma position error (m).
    pub pos_err: f32,
    /// One sigma angular error (rad).
    pub ang_err: f32,
}

impl Default for ExtVisionSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            pos: Vector3f::zeros(),
            quat: Quatf::identity(),
            pos_err: 0.0,
            ang_err: 0.0,
        }
    }
}

/// Horizontal velocity from an auxiliary source such as a landing target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxVelSample {
    pub time_us: TimeUs,
    /// North/East velocity (m/s).
    pub vel_ne: Vector2f,
    /// North/East velocity variance (m/s)^2.
    pub vel_var_ne: Vector2f,
}

impl Default for AuxVelSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            vel_ne: Vector2f::zeros(),
            vel_var_ne: Vector2f::zeros(),
        }
    }
}

// =========================================================================
// == Other Sensors ==
// =========================================================================

/// Three axis magnetometer reading in body frame (gauss).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagSample {
    pub time_us: TimeUs,
    pub mag: Vector3f,
}

impl Default for MagSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            mag: Vector3f::zeros(),
        }
    }
}

/// Barometric height (m, positive up).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BaroSample {
    pub time_us: TimeUs,
    pub hgt: f32,
}

/// Range finder distance along the sensor axis (m).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RangeSample {
    pub time_us: TimeUs,
    pub rng: f32,
}

/// Integrated optical flow and the sensor's matching gyro integral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowSample {
    pub time_us: TimeUs,
    /// Integrated flow about the sensor X and Y axes (rad). Positive flow is
    /// produced by a right handed rotation of the image.
    pub flow_xy_rad: Vector2f,
    /// Integrated rotation of the sensor about its own axes (rad).
    pub gyro_xyz: Vector3f,
    /// Integration period (s).
    pub dt: f32,
    /// 0 is no confidence, 255 full confidence.
    pub quality: u8,
}

impl Default for FlowSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            flow_xy_rad: Vector2f::zeros(),
            gyro_xyz: Vector3f::zeros(),
            dt: 0.0,
            quality: 0,
        }
    }
}

/// Airspeed reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirspeedSample {
    pub time_us: TimeUs,
    /// True airspeed (m/s).
    pub true_airspeed: f32,
    /// Ratio of true to equivalent airspeed.
    pub eas2tas: f32,
}

impl Default for AirspeedSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            true_airspeed: 0.0,
            eas2tas: 1.0,
        }
    }
}

// =========================================================================
// == Estimator Output ==
// =========================================================================

/// Real-time navigation solution produced by the output predictor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSample {
    pub time_us: TimeUs,
    /// Body to NED rotation.
    pub quat_nominal: Quatf,
    /// NED velocity (m/s).
    pub vel: Vector3f,
    /// NED position (m).
    pub pos: Vector3f,
}

impl Default for OutputSample {
    fn default() -> Self {
        Self {
            time_us: 0,
            quat_nominal: Quatf::identity(),
            vel: Vector3f::zeros(),
            pos: Vector3f::zeros(),
        }
    }
}
