// ekf_core/src/params.rs

use serde::{Deserialize, Serialize};

use crate::errors::{EkfError, EkfResult};
use crate::types::Vector3f;

// =========================================================================
// == Bitmask Constants ==
// =========================================================================

/// Bits of [`EkfParams::fusion_mode`].
pub mod fusion_mask {
    /// Fuse GPS position and velocity.
    pub const USE_GPS: u16 = 1 << 0;
    /// Fuse optical flow.
    pub const USE_OPT_FLOW: u16 = 1 << 1;
    /// Never learn the delta velocity bias.
    pub const INHIBIT_ACC_BIAS: u16 = 1 << 2;
    /// Fuse external vision position.
    pub const USE_EV_POS: u16 = 1 << 3;
    /// Fuse external vision yaw.
    pub const USE_EV_YAW: u16 = 1 << 4;
    /// Fuse multirotor drag specific force to estimate wind.
    pub const USE_DRAG: u16 = 1 << 5;
    /// Rotate external vision data into the navigation frame.
    pub const ROTATE_EV: u16 = 1 << 6;
    /// Fuse yaw from a dual antenna GPS.
    pub const USE_GPS_YAW: u16 = 1 << 7;
}

/// Bits of [`EkfParams::gps_check_mask`]. Each selects one of the quality
/// checks applied before GPS is allowed to aid the filter.
pub mod gps_check_mask {
    pub const NSATS: u16 = 1 << 0;
    pub const PDOP: u16 = 1 << 1;
    pub const HACC: u16 = 1 << 2;
    pub const VACC: u16 = 1 << 3;
    pub const SACC: u16 = 1 << 4;
    pub const HDRIFT: u16 = 1 << 5;
    pub const VDRIFT: u16 = 1 << 6;
    pub const HSPD: u16 = 1 << 7;
    pub const VSPD: u16 = 1 << 8;
}

// =========================================================================
// == Mode Selection Enums ==
// =========================================================================

/// Primary source of height observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeightSensor {
    #[default]
    Baro,
    Gps,
    Range,
    Vision,
}

/// How the magnetometer is used to observe yaw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagFuseType {
    /// Heading fusion on the ground, 3-axis fusion in the air once the earth
    /// field and biases are observable.
    #[default]
    Auto,
    /// Always fuse a heading angle derived from the magnetometer.
    Heading,
    /// Always fuse the three field components.
    ThreeAxis,
    /// Never use the magnetometer.
    None,
}

// =========================================================================
// == Filter Parameters ==
// =========================================================================

/// Tuning and configuration of the estimator.
///
/// Every field has a default matching a typical small multirotor, so a
/// partial TOML table deserialises into a usable parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfParams {
    // --- Timing ---
    /// Nominal period of one filter cycle (us).
    pub filter_update_period_us: u64,
    /// Magnetometer measurement delay relative to the IMU (ms).
    pub mag_delay_ms: f32,
    /// Barometer measurement delay relative to the IMU (ms).
    pub baro_delay_ms: f32,
    /// GPS measurement delay relative to the IMU (ms).
    pub gps_delay_ms: f32,
    /// Airspeed measurement delay relative to the IMU (ms).
    pub airspeed_delay_ms: f32,
    /// Optical flow measurement delay relative to the IMU (ms).
    pub flow_delay_ms: f32,
    /// Range finder measurement delay relative to the IMU (ms).
    pub range_delay_ms: f32,
    /// External vision measurement delay relative to the IMU (ms).
    pub ev_delay_ms: f32,
    /// Auxiliary velocity measurement delay relative to the IMU (ms).
    pub aux_vel_delay_ms: f32,

    // --- Input selection ---
    /// Bitmask of [`fusion_mask`] bits.
    pub fusion_mode: u16,
    /// Primary height sensor.
    pub vdist_sensor_type: HeightSensor,
    pub mag_fusion_type: MagFuseType,

    // --- Process noise ---
    /// Rate gyro noise (rad/s).
    pub gyro_noise: f32,
    /// Accelerometer noise (m/s^2).
    pub accel_noise: f32,
    /// Gyro bias random walk (rad/s^2).
    pub gyro_bias_p_noise: f32,
    /// Accelerometer bias random walk (m/s^3).
    pub accel_bias_p_noise: f32,
    /// Earth field random walk (gauss/s).
    pub mage_p_noise: f32,
    /// Body field random walk (gauss/s).
    pub magb_p_noise: f32,
    /// Wind random walk (m/s^2).
    pub wind_vel_p_noise: f32,
    /// Terrain height random walk (m/s).
    pub terrain_p_noise: f32,
    /// Terrain gradient used to scale height noise with ground speed (m/m).
    pub terrain_gradient: f32,

    // --- Initial uncertainty ---
    /// Gyro bias uncertainty at switch on (rad/s).
    pub switch_on_gyro_bias: f32,
    /// Accelerometer bias uncertainty at switch on (m/s^2).
    pub switch_on_accel_bias: f32,
    /// Tilt uncertainty after alignment (rad).
    pub initial_tilt_err: f32,
    /// Wind uncertainty when wind estimation starts (m/s).
    pub initial_wind_uncertainty: f32,

    // --- Position and height aiding ---
    /// Minimum GPS velocity observation noise (m/s).
    pub gps_vel_noise: f32,
    /// Minimum GPS horizontal position observation noise (m).
    pub gps_pos_noise: f32,
    /// Synthetic position observation noise when unaided (m).
    pub pos_noaid_noise: f32,
    /// Barometric height observation noise (m).
    pub baro_noise: f32,
    pub baro_innov_gate: f32,
    pub pos_ne_innov_gate: f32,
    pub vel_innov_gate: f32,
    /// Height innovation above which the height is reset on the next GPS
    /// height fusion (m). Zero disables the reset.
    pub hgt_reset_lim: f32,

    // --- Magnetometer ---
    /// Heading observation noise (rad).
    pub mag_heading_noise: f32,
    /// Field component observation noise (gauss).
    pub mag_noise: f32,
    /// Declination used when it cannot be learned (deg).
    pub mag_declination_deg: f32,
    pub heading_innov_gate: f32,
    pub mag_innov_gate: f32,
    /// Fuse the declination as an observation while running 3-axis fusion.
    pub fuse_declination: bool,
    /// Horizontal acceleration above which yaw is treated as observable
    /// during automatic mode selection (m/s^2).
    pub mag_acc_gate: f32,
    /// Yaw rate above which body field biases are treated as observable
    /// during automatic mode selection (rad/s).
    pub mag_yaw_rate_gate: f32,

    // --- Airspeed and sideslip ---
    pub tas_innov_gate: f32,
    /// Equivalent airspeed observation noise (m/s).
    pub eas_noise: f32,
    /// Airspeed below which measurements are ignored (m/s).
    pub arsp_thr: f32,
    pub beta_innov_gate: f32,
    /// Synthetic sideslip observation noise (rad).
    pub beta_noise: f32,

    // --- Range finder ---
    /// Range observation noise (m).
    pub range_noise: f32,
    pub range_innov_gate: f32,
    /// Range finder reading on the ground (m).
    pub rng_gnd_clearance: f32,
    /// Sensor pitch relative to the body Z axis (rad).
    pub rng_sens_pitch: f32,
    /// Range noise growth with distance (m/m).
    pub range_noise_scaler: f32,
    /// Use the range finder as height reference at low height and speed.
    pub range_aid: bool,
    /// Maximum height for range aid (m).
    pub max_hagl_for_range_aid: f32,
    /// Maximum horizontal speed for range aid (m/s).
    pub max_vel_for_range_aid: f32,
    /// Terrain consistency gate for range aid (SD).
    pub range_aid_innov_gate: f32,
    /// Cosine of the maximum tilt for which range data is usable.
    pub range_cos_max_tilt: f32,
    /// Minimum variation of range data in flight before it is considered
    /// live (m).
    pub range_stuck_threshold: f32,

    // --- External vision ---
    pub ev_innov_gate: f32,
    /// Minimum external vision position noise (m).
    pub ev_pos_noise: f32,
    /// Minimum external vision angular noise (rad).
    pub ev_ang_noise: f32,

    // --- Optical flow ---
    /// Flow observation noise at maximum quality (rad/s).
    pub flow_noise: f32,
    /// Flow observation noise at minimum quality (rad/s).
    pub flow_noise_qual_min: f32,
    /// Minimum quality accepted from the flow sensor (0-255).
    pub flow_qual_min: u8,
    pub flow_innov_gate: f32,

    // --- GPS quality checks ---
    /// Bitmask of [`gps_check_mask`] bits.
    pub gps_check_mask: u16,
    /// Maximum horizontal accuracy (m).
    pub req_hacc: f32,
    /// Maximum vertical accuracy (m).
    pub req_vacc: f32,
    /// Maximum speed accuracy (m/s).
    pub req_sacc: f32,
    /// Minimum satellite count.
    pub req_nsats: u8,
    /// Maximum position dilution of precision.
    pub req_pdop: f32,
    /// Maximum filtered horizontal drift on the ground (m/s).
    pub req_hdrift: f32,
    /// Maximum filtered vertical drift on the ground (m/s).
    pub req_vdrift: f32,
    /// Time GPS must pass every check before it is used (us).
    pub min_gps_health_us: u64,

    // --- Sensor positions in body frame (m) ---
    pub imu_pos_body: Vector3f,
    pub gps_pos_body: Vector3f,
    pub rng_pos_body: Vector3f,
    pub flow_pos_body: Vector3f,
    pub ev_pos_body: Vector3f,

    // --- Output complementary filter ---
    /// Velocity tracking time constant (s).
    pub vel_tau: f32,
    /// Position tracking time constant (s).
    pub pos_tau: f32,

    // --- Accelerometer bias learning ---
    /// Maximum accelerometer bias (m/s^2).
    pub acc_bias_lim: f32,
    /// Filtered acceleration magnitude above which bias learning stops (m/s^2).
    pub acc_bias_learn_acc_lim: f32,
    /// Filtered angular rate magnitude above which bias learning stops (rad/s).
    pub acc_bias_learn_gyr_lim: f32,
    /// Time constant of the learning inhibit filters (s).
    pub acc_bias_learn_tc: f32,

    // --- Aiding timeouts ---
    /// Time after which an aiding source is considered lost (us).
    pub valid_timeout_max: u64,
    /// Time without any aiding after which the solution is degraded (us).
    pub no_aid_timeout_max: u64,

    // --- Multirotor drag ---
    /// Drag specific force observation noise (m/s^2).
    pub drag_noise: f32,
    /// Ballistic coefficient along body X (kg/m^2).
    pub bcoef_x: f32,
    /// Ballistic coefficient along body Y (kg/m^2).
    pub bcoef_y: f32,

    // --- Auxiliary velocity ---
    pub aux_vel_innov_gate: f32,

    // --- GPS yaw ---
    /// Heading of the antenna baseline relative to body X (rad).
    pub gps_yaw_offset: f32,
    /// Dual antenna heading observation noise (rad).
    pub gps_heading_noise: f32,
}

impl Default for EkfParams {
    fn default() -> Self {
        Self {
            filter_update_period_us: 12_000,
            mag_delay_ms: 0.0,
            baro_delay_ms: 0.0,
            gps_delay_ms: 110.0,
            airspeed_delay_ms: 100.0,
            flow_delay_ms: 5.0,
            range_delay_ms: 5.0,
            ev_delay_ms: 100.0,
            aux_vel_delay_ms: 0.0,

            fusion_mode: fusion_mask::USE_GPS,
            vdist_sensor_type: HeightSensor::Baro,
            mag_fusion_type: MagFuseType::Auto,

            gyro_noise: 1.5e-2,
            accel_noise: 3.5e-1,
            gyro_bias_p_noise: 1.0e-3,
            accel_bias_p_noise: 3.0e-3,
            mage_p_noise: 1.0e-3,
            magb_p_noise: 1.0e-4,
            wind_vel_p_noise: 1.0e-1,
            terrain_p_noise: 5.0,
            terrain_gradient: 0.5,

            switch_on_gyro_bias: 0.1,
            switch_on_accel_bias: 0.2,
            initial_tilt_err: 0.1,
            initial_wind_uncertainty: 1.0,

            gps_vel_noise: 0.5,
            gps_pos_noise: 0.5,
            pos_noaid_noise: 10.0,
            baro_noise: 2.0,
            baro_innov_gate: 5.0,
            pos_ne_innov_gate: 5.0,
            vel_innov_gate: 5.0,
            hgt_reset_lim: 0.0,

            mag_heading_noise: 3.0e-1,
            mag_noise: 5.0e-2,
            mag_declination_deg: 0.0,
            heading_innov_gate: 2.6,
            mag_innov_gate: 3.0,
            fuse_declination: true,
            mag_acc_gate: 0.5,
            mag_yaw_rate_gate: 0.25,

            tas_innov_gate: 5.0,
            eas_noise: 1.4,
            arsp_thr: 0.0,
            beta_innov_gate: 5.0,
            beta_noise: 0.3,

            range_noise: 0.1,
            range_innov_gate: 5.0,
            rng_gnd_clearance: 0.1,
            rng_sens_pitch: 0.0,
            range_noise_scaler: 0.0,
            range_aid: false,
            max_hagl_for_range_aid: 5.0,
            max_vel_for_range_aid: 1.0,
            range_aid_innov_gate: 1.0,
            range_cos_max_tilt: 0.7071,
            range_stuck_threshold: 0.1,

            ev_innov_gate: 5.0,
            ev_pos_noise: 0.1,
            ev_ang_noise: 0.05,

            flow_noise: 0.15,
            flow_noise_qual_min: 0.5,
            flow_qual_min: 1,
            flow_innov_gate: 3.0,

            gps_check_mask: gps_check_mask::NSATS | gps_check_mask::HACC | gps_check_mask::SACC,
            req_hacc: 5.0,
            req_vacc: 8.0,
            req_sacc: 1.0,
            req_nsats: 6,
            req_pdop: 2.5,
            req_hdrift: 0.3,
            req_vdrift: 0.5,
            min_gps_health_us: 10_000_000,

            imu_pos_body: Vector3f::zeros(),
            gps_pos_body: Vector3f::zeros(),
            rng_pos_body: Vector3f::zeros(),
            flow_pos_body: Vector3f::zeros(),
            ev_pos_body: Vector3f::zeros(),

            vel_tau: 0.25,
            pos_tau: 0.25,

            acc_bias_lim: 0.4,
            acc_bias_learn_acc_lim: 25.0,
            acc_bias_learn_gyr_lim: 3.0,
            acc_bias_learn_tc: 0.5,

            valid_timeout_max: 5_000_000,
            no_aid_timeout_max: 7_000_000,

            drag_noise: 2.5,
            bcoef_x: 25.0,
            bcoef_y: 25.0,

            aux_vel_innov_gate: 5.0,

            gps_yaw_offset: 0.0,
            gps_heading_noise: 0.1,
        }
    }
}

impl EkfParams {
    /// Filter period in seconds.
    pub fn filter_update_period_s(&self) -> f32 {
        self.filter_update_period_us as f32 * 1e-6
    }

    pub fn uses(&self, mask: u16) -> bool {
        self.fusion_mode & mask != 0
    }

    /// The longest configured sensor delay (ms).
    pub fn max_delay_ms(&self) -> f32 {
        [
            self.mag_delay_ms,
            self.baro_delay_ms,
            self.gps_delay_ms,
            self.airspeed_delay_ms,
            self.flow_delay_ms,
            self.range_delay_ms,
            self.ev_delay_ms,
            self.aux_vel_delay_ms,
        ]
        .into_iter()
        .fold(0.0, f32::max)
    }

    /// Validates ranges the filter relies on. Called once when the filter is
    /// constructed; the parameters are immutable afterwards.
    pub fn validate(&self) -> EkfResult<()> {
        if self.filter_update_period_us < 1_000 || self.filter_update_period_us > 100_000 {
            return Err(invalid("filter_update_period_us", "must lie in 1000..=100000"));
        }

        let delays = [
            ("mag_delay_ms", self.mag_delay_ms),
            ("baro_delay_ms", self.baro_delay_ms),
            ("gps_delay_ms", self.gps_delay_ms),
            ("airspeed_delay_ms", self.airspeed_delay_ms),
            ("flow_delay_ms", self.flow_delay_ms),
            ("range_delay_ms", self.range_delay_ms),
            ("ev_delay_ms", self.ev_delay_ms),
            ("aux_vel_delay_ms", self.aux_vel_delay_ms),
        ];
        for (name, delay) in delays {
            if !(delay.is_finite() && delay >= 0.0) {
                return Err(invalid(name, "must be finite and non-negative"));
            }
        }

        let positive = [
            ("gyro_noise", self.gyro_noise),
            ("accel_noise", self.accel_noise),
            ("gps_vel_noise", self.gps_vel_noise),
            ("gps_pos_noise", self.gps_pos_noise),
            ("pos_noaid_noise", self.pos_noaid_noise),
            ("baro_noise", self.baro_noise),
            ("mag_heading_noise", self.mag_heading_noise),
            ("mag_noise", self.mag_noise),
            ("eas_noise", self.eas_noise),
            ("beta_noise", self.beta_noise),
            ("range_noise", self.range_noise),
            ("ev_pos_noise", self.ev_pos_noise),
            ("ev_ang_noise", self.ev_ang_noise),
            ("flow_noise", self.flow_noise),
            ("flow_noise_qual_min", self.flow_noise_qual_min),
            ("drag_noise", self.drag_noise),
            ("gps_heading_noise", self.gps_heading_noise),
            ("baro_innov_gate", self.baro_innov_gate),
            ("pos_ne_innov_gate", self.pos_ne_innov_gate),
            ("vel_innov_gate", self.vel_innov_gate),
            ("heading_innov_gate", self.heading_innov_gate),
            ("mag_innov_gate", self.mag_innov_gate),
            ("tas_innov_gate", self.tas_innov_gate),
            ("beta_innov_gate", self.beta_innov_gate),
            ("range_innov_gate", self.range_innov_gate),
            ("range_aid_innov_gate", self.range_aid_innov_gate),
            ("ev_innov_gate", self.ev_innov_gate),
            ("flow_innov_gate", self.flow_innov_gate),
            ("aux_vel_innov_gate", self.aux_vel_innov_gate),
            ("vel_tau", self.vel_tau),
            ("pos_tau", self.pos_tau),
            ("acc_bias_lim", self.acc_bias_lim),
            ("acc_bias_learn_tc", self.acc_bias_learn_tc),
            ("bcoef_x", self.bcoef_x),
            ("bcoef_y", self.bcoef_y),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(name, "must be finite and positive"));
            }
        }

        let non_negative = [
            ("gyro_bias_p_noise", self.gyro_bias_p_noise),
            ("accel_bias_p_noise", self.accel_bias_p_noise),
            ("mage_p_noise", self.mage_p_noise),
            ("magb_p_noise", self.magb_p_noise),
            ("wind_vel_p_noise", self.wind_vel_p_noise),
            ("terrain_p_noise", self.terrain_p_noise),
            ("terrain_gradient", self.terrain_gradient),
            ("hgt_reset_lim", self.hgt_reset_lim),
            ("rng_gnd_clearance", self.rng_gnd_clearance),
            ("range_noise_scaler", self.range_noise_scaler),
            ("range_stuck_threshold", self.range_stuck_threshold),
            ("arsp_thr", self.arsp_thr),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(name, "must be finite and non-negative"));
            }
        }

        if !(0.0..=1.0).contains(&self.range_cos_max_tilt) {
            return Err(invalid("range_cos_max_tilt", "must lie in 0..=1"));
        }

        if self.vel_tau.min(self.pos_tau) < self.filter_update_period_s() {
            return Err(invalid("vel_tau", "tracking time constants must exceed the filter period"));
        }

        Ok(())
    }
}

fn invalid(name: &'static str, reason: &'static str) -> EkfError {
    EkfError::InvalidParameter { name, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EkfParams::default().validate().is_ok());
    }

    #[test]
    fn negative_noise_is_rejected() {
        let params = EkfParams {
            gps_pos_noise: -1.0,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(EkfError::InvalidParameter {
                name: "gps_pos_noise",
                reason: "must be finite and positive"
            })
        );
    }

    #[test]
    fn tiny_filter_period_is_rejected() {
        let params = EkfParams {
            filter_update_period_us: 10,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(EkfError::InvalidParameter { name: "filter_update_period_us", .. })
        ));
    }

    #[test]
    fn fusion_mask_bits_are_distinct() {
        let bits = [
            fusion_mask::USE_GPS,
            fusion_mask::USE_OPT_FLOW,
            fusion_mask::INHIBIT_ACC_BIAS,
            fusion_mask::USE_EV_POS,
            fusion_mask::USE_EV_YAW,
            fusion_mask::USE_DRAG,
            fusion_mask::ROTATE_EV,
            fusion_mask::USE_GPS_YAW,
        ];
        let combined = bits.iter().fold(0u16, |acc, b| {
            assert_eq!(acc & b, 0);
            acc | b
        });
        assert_eq!(combined.count_ones(), bits.len() as u32);
    }

    #[test]
    fn max_delay_picks_longest_sensor() {
        let params = EkfParams::default();
        assert_eq!(params.max_delay_ms(), 110.0);
    }
}
