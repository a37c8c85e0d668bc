// ekf_core/src/estimation/reset.rs

//! Discontinuous state resets.
//!
//! Each reset overwrites a block of the state, reinitialises its covariance
//! with the cross terms zeroed, records the step it made and shifts the
//! output predictor by the same step so the real-time solution stays
//! continuous for the host.

use nalgebra::Matrix2;
use tracing::{debug, info, warn};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::gps_yaw::antenna_heading;
use crate::estimation::fusion::mag::{heading_of, measured_heading};
use crate::frames::layout::{DANG_BIAS, DVEL_BIAS, MAG_B, MAG_I, POS_D, POS_N, VEL_D, VEL_N};
use crate::frames::{
    dcm_from_euler_312, euler_312, euler_321, normalized, prefer_321_sequence, quat_from_dcm,
    quat_from_euler, quat_to_dcm,
};
use crate::params::MagFuseType;
use crate::types::{elapsed_us, sq, wrap_pi, Quatf, TimeUs, Vector2f, Vector3f};

/// Minimum time between two IMU bias resets (us).
pub const IMU_BIAS_RESET_COOLDOWN_US: u64 = 10_000_000;

/// Ground speed above which GPS course is a usable yaw reference (m/s).
const MIN_GPS_COURSE_SPEED: f32 = 5.0;

/// Course error beyond which the yaw is assumed wrong (rad).
const MAX_COURSE_YAW_ERROR: f32 = 0.5;

/// Vertical velocity variance used when no reference is available (m^2/s^2).
const UNAIDED_VEL_D_VAR: f32 = 10.0;

/// Oldest GPS sample whose vertical velocity a height reset uses (us).
const MAX_GPS_VEL_AGE_US: u64 = 1_000_000;

/// Step made by the last reset of each class, and how many resets of that
/// class happened. Counters wrap at 256.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetStatus {
    pub vel_ne_counter: u8,
    pub vel_d_counter: u8,
    pub pos_ne_counter: u8,
    pub pos_d_counter: u8,
    pub quat_counter: u8,
    pub vel_ne_change: Vector2f,
    pub vel_d_change: f32,
    pub pos_ne_change: Vector2f,
    pub pos_d_change: f32,
    /// Body frame rotation with `q_post = q_pre * quat_change`.
    pub quat_change: Quatf,
}

impl Default for ResetStatus {
    fn default() -> Self {
        Self {
            vel_ne_counter: 0,
            vel_d_counter: 0,
            pos_ne_counter: 0,
            pos_d_counter: 0,
            quat_counter: 0,
            vel_ne_change: Vector2f::zeros(),
            vel_d_change: 0.0,
            pos_ne_change: Vector2f::zeros(),
            pos_d_change: 0.0,
            quat_change: Quatf::identity(),
        }
    }
}

impl ResetStatus {
    fn record_vel_ne(&mut self, delta: Vector2f) {
        self.vel_ne_change = delta;
        self.vel_ne_counter = self.vel_ne_counter.wrapping_add(1);
    }

    fn record_vel_d(&mut self, delta: f32) {
        self.vel_d_change = delta;
        self.vel_d_counter = self.vel_d_counter.wrapping_add(1);
    }

    fn record_pos_ne(&mut self, delta: Vector2f) {
        self.pos_ne_change = delta;
        self.pos_ne_counter = self.pos_ne_counter.wrapping_add(1);
    }

    fn record_pos_d(&mut self, delta: f32) {
        self.pos_d_change = delta;
        self.pos_d_counter = self.pos_d_counter.wrapping_add(1);
    }

    fn record_quat(&mut self, delta: Quatf) {
        self.quat_change = delta;
        self.quat_counter = self.quat_counter.wrapping_add(1);
    }
}

impl Ekf {
    // --- Velocity and position ---

    /// Resets horizontal velocity to the best available reference: GPS,
    /// then optical flow, then zero. A GPS reset also sets the vertical
    /// velocity.
    pub(crate) fn reset_velocity(&mut self) -> bool {
        let before = self.store.state.vel;
        let mut after = before;
        let ne_var;
        let mut d_var = None;

        if self.control.gps {
            let gps = &self.delayed.gps;
            after = gps.vel;
            ne_var = sq(gps.sacc.max(self.params.gps_vel_noise));
            d_var = Some(sq(1.5 * gps.sacc.max(self.params.gps_vel_noise)));
        } else if self.control.opt_flow && self.delayed.flow.dt > 0.0 {
            let range = (self.terrain.vpos() - self.store.state.pos[2])
                .max(self.params.rng_gnd_clearance);
            let los = self.flow.compensated_xy / self.delayed.flow.dt;
            let vel_body = Vector3f::new(-los[1] * range, los[0] * range, 0.0);
            let vel_earth = self.r_to_earth * vel_body;
            after[0] = vel_earth[0];
            after[1] = vel_earth[1];
            ne_var = self.calc_opt_flow_meas_var(self.delayed.flow.quality) * sq(range);
        } else {
            after[0] = 0.0;
            after[1] = 0.0;
            ne_var = sq(self.params.gps_vel_noise.max(0.5));
        }

        self.store.state.vel = after;
        self.store.set_diag(VEL_N..VEL_N + 2, ne_var);
        let delta = after - before;
        self.reset.record_vel_ne(delta.xy());
        if let Some(var) = d_var {
            self.store.set_diag(VEL_D..VEL_D + 1, var);
            self.reset.record_vel_d(delta[2]);
        }
        self.output.apply_velocity_reset(&delta);
        debug!(dn = delta[0], de = delta[1], dd = delta[2], "velocity reset");
        true
    }

    /// Resets horizontal position to GPS, external vision, or the last
    /// known position, in that order of preference.
    pub(crate) fn reset_position(&mut self) -> bool {
        let before = self.store.state.pos.xy();
        let (after, var) = if self.control.gps {
            let gps = &self.delayed.gps;
            (gps.pos, sq(gps.hacc.max(self.params.gps_pos_noise)))
        } else if self.control.ev_pos {
            let ev = &self.delayed.ev;
            (
                self.ev_position_ned(&ev.pos).xy(),
                sq(ev.pos_err.max(self.params.ev_pos_noise)),
            )
        } else {
            (self.last_known_pos_ne, sq(self.params.pos_noaid_noise))
        };

        self.store.state.pos[0] = after[0];
        self.store.state.pos[1] = after[1];
        self.store.set_diag(POS_N..POS_N + 2, var);
        let delta = after - before;
        self.reset.record_pos_ne(delta);
        self.output
            .apply_position_reset(&Vector3f::new(delta[0], delta[1], 0.0));
        debug!(dn = delta[0], de = delta[1], "horizontal position reset");
        true
    }

    /// Resets the vertical position to the active height source and the
    /// vertical velocity to GPS, or to zero without GPS.
    pub(crate) fn reset_height(&mut self) {
        let source = self.control.height_source;
        let pos_before = self.store.state.pos[2];
        let vel_before = self.store.state.vel[2];

        if let Some(pos_d) = self.latest_height_measurement(source) {
            self.store.state.pos[2] = pos_d;
        }
        let pos_var = self.height_obs_var(source);
        self.store.set_diag(POS_D..POS_D + 1, pos_var);

        let gps_age = elapsed_us(self.imu_sample_delayed.time_us, self.delayed.gps.time_us);
        let gps_recent = self.control.gps && gps_age < MAX_GPS_VEL_AGE_US;
        if gps_recent {
            self.store.state.vel[2] = self.delayed.gps.vel[2];
            self.store
                .set_diag(VEL_D..VEL_D + 1, sq(1.5 * self.params.gps_vel_noise));
        } else {
            self.store.state.vel[2] = 0.0;
            self.store.set_diag(VEL_D..VEL_D + 1, UNAIDED_VEL_D_VAR);
        }

        let pos_delta = self.store.state.pos[2] - pos_before;
        let vel_delta = self.store.state.vel[2] - vel_before;
        self.reset.record_pos_d(pos_delta);
        self.reset.record_vel_d(vel_delta);
        self.output
            .apply_position_reset(&Vector3f::new(0.0, 0.0, pos_delta));
        self.output
            .apply_velocity_reset(&Vector3f::new(0.0, 0.0, vel_delta));
        info!(source = ?source, pos_delta, "height reset");
    }

    // --- Attitude ---

    /// Sets the yaw of the quaternion, keeping roll and pitch, records the
    /// body frame delta and rotates the output history by the earth frame
    /// equivalent. `yaw_variance` replaces the yaw uncertainty when given.
    pub(crate) fn reset_quat_yaw(
        &mut self,
        yaw: f32,
        yaw_variance: Option<f32>,
        update_buffer: bool,
    ) -> Quatf {
        let q_pre = self.store.state.quat_nominal;
        let dcm = quat_to_dcm(&q_pre);
        let q_post = if prefer_321_sequence(&dcm) {
            let (roll, pitch, _) = euler_321(&dcm);
            quat_from_euler(roll, pitch, yaw)
        } else {
            let (roll, pitch, _) = euler_312(&dcm);
            quat_from_dcm(&dcm_from_euler_312(roll, pitch, yaw))
        };
        // Keep the hemisphere of the previous quaternion.
        let q_post = if q_post.dot(&q_pre) < 0.0 { -q_post } else { q_post };
        let q_post = normalized(&q_post);

        let rot_var = self.store.calc_rot_vec_variances();
        self.store.state.quat_nominal = q_post;
        self.r_to_earth = quat_to_dcm(&q_post);
        self.store.uncorrelate_quat_states();
        self.store.initialise_quat_covariances(&Vector3f::new(
            rot_var[0],
            rot_var[1],
            yaw_variance.unwrap_or(rot_var[2]),
        ));

        let delta = q_pre.conjugate() * q_post;
        self.reset.record_quat(delta);
        if update_buffer {
            self.output
                .apply_attitude_reset(&normalized(&(q_post * q_pre.conjugate())));
        }
        delta
    }

    /// Resets yaw from a magnetometer sample (or from external vision when
    /// that is the yaw reference) and re-initialises the earth field states.
    pub(crate) fn reset_mag_heading(
        &mut self,
        mag_init: &Vector3f,
        increase_yaw_var: bool,
        update_buffer: bool,
    ) -> bool {
        let yaw_var = increase_yaw_var.then(|| sq(self.params.mag_heading_noise.max(1e-2)));
        if self.control.ev_yaw {
            let ev_yaw = self.ev_yaw_measurement();
            self.reset_quat_yaw(ev_yaw, yaw_var, update_buffer);
            return true;
        }
        if self.params.mag_fusion_type == MagFuseType::None
            || self.control.mag_fault
            || mag_init.norm() <= 0.0
        {
            return false;
        }

        let dcm = quat_to_dcm(&self.store.state.quat_nominal);
        let yaw = measured_heading(
            &dcm,
            &(mag_init - self.store.state.mag_b),
            self.mag_declination(),
            prefer_321_sequence(&dcm),
        );
        self.reset_quat_yaw(yaw, yaw_var, update_buffer);

        self.store.state.mag_i = self.r_to_earth * (mag_init - self.store.state.mag_b);
        self.store.zero_rows(MAG_I..MAG_B + 3);
        self.store.zero_cols(MAG_I..MAG_B + 3);
        if self.control.mag_3d {
            self.store.reset_mag_covariance(sq(self.params.mag_noise));
            self.mag_ctrl.saved_covariance = Some(self.store.save_mag_covariance());
        }
        info!(yaw, "yaw reset to magnetometer");
        true
    }

    /// Resets yaw to the dual antenna GPS heading.
    pub(crate) fn reset_gps_ant_yaw(&mut self) -> bool {
        let Some(gps_yaw) = self.delayed.gps.yaw else {
            return false;
        };
        if antenna_heading(&self.store.state, self.params.gps_yaw_offset).is_none() {
            return false;
        }
        let var = sq(self.params.gps_heading_noise.max(1e-2));
        self.reset_quat_yaw(wrap_pi(gps_yaw), Some(var), true);
        self.timers.last_gps_yaw_fuse = self.imu_sample_delayed.time_us;
        info!(yaw = gps_yaw, "yaw reset to GPS antenna heading");
        true
    }

    /// Fixed wing yaw recovery: aligns the yaw to the GPS course when the
    /// two disagree and GPS velocity is being rejected, then resets
    /// velocity and position. Returns `true` when the yaw is now aligned
    /// with the course.
    pub(crate) fn realign_yaw_gps(&mut self) -> bool {
        let gps_vel = self.delayed.gps.vel;
        if !(self.control.fixed_wing && gps_vel.xy().norm() > MIN_GPS_COURSE_SPEED) {
            return false;
        }

        let ratios = &self.innov.vel_pos_test_ratio;
        let bad_vel_innov = (ratios[0] > 1.0 || ratios[1] > 1.0) && self.control.gps;
        let gps_cog = gps_vel[1].atan2(gps_vel[0]);
        let ekf_cog = self.store.state.vel[1].atan2(self.store.state.vel[0]);
        let course_yaw_error = wrap_pi(gps_cog - ekf_cog);
        let bad_mag_yaw = course_yaw_error.abs() > MAX_COURSE_YAW_ERROR && bad_vel_innov;
        if bad_mag_yaw {
            self.mag_ctrl.num_bad_flight_yaw_events =
                self.mag_ctrl.num_bad_flight_yaw_events.saturating_add(1);
        }

        if bad_mag_yaw || !self.control.yaw_align {
            let dcm = quat_to_dcm(&self.store.state.quat_nominal);
            let current = heading_of(&dcm, prefer_321_sequence(&dcm));
            let var = sq(self.params.mag_heading_noise.max(1e-2));
            self.reset_quat_yaw(wrap_pi(current + course_yaw_error), Some(var), true);
            self.reset_velocity();
            self.reset_position();
            if self.mag_ctrl.num_bad_flight_yaw_events >= 2 && !self.control.mag_fault {
                self.control.mag_fault = true;
                warn!("stopping magnetometer use after repeated yaw errors");
            }
            warn!(course_yaw_error, "yaw realigned to GPS course");
        }
        self.control.yaw_align = true;
        true
    }

    // --- Wind and biases ---

    /// Sets the wind from airspeed and heading when airspeed is available,
    /// zero otherwise, with a matching covariance.
    pub(crate) fn reset_wind_states(&mut self) {
        let tas = self.delayed.airspeed.true_airspeed;
        let yaw_var = self.store.calc_rot_vec_variances()[2];
        if self.delayed.airspeed.time_us > 0 && tas > self.params.arsp_thr {
            let yaw = heading_of(&self.r_to_earth, prefer_321_sequence(&self.r_to_earth));
            let vel = self.store.state.vel;
            self.store.state.wind_vel =
                Vector2f::new(vel[0] - tas * yaw.cos(), vel[1] - tas * yaw.sin());
            let var = sq(self.params.eas_noise) + sq(tas) * yaw_var;
            self.store.set_wind_covariance(&Matrix2::from_diagonal_element(var));
        } else {
            self.store.state.wind_vel = Vector2f::zeros();
            self.store.set_wind_covariance(&Matrix2::from_diagonal_element(sq(
                self.params.initial_wind_uncertainty,
            )));
        }
        debug!(wind_n = self.store.state.wind_vel[0], wind_e = self.store.state.wind_vel[1], "wind reset");
    }

    /// Zeroes the IMU bias estimates and restores their switch-on
    /// uncertainty. Refused within [`IMU_BIAS_RESET_COOLDOWN_US`] of the
    /// previous reset.
    pub fn reset_imu_bias(&mut self) -> bool {
        let now: TimeUs = self.time_last_imu;
        if let Some(last) = self.time_last_imu_bias_reset {
            if elapsed_us(now, last) < IMU_BIAS_RESET_COOLDOWN_US {
                return false;
            }
        }

        let dt = self.dt_ekf_avg;
        self.store.state.delta_ang_bias = Vector3f::zeros();
        self.store.state.delta_vel_bias = Vector3f::zeros();
        let dang_var = sq(self.params.switch_on_gyro_bias * dt);
        let dvel_var = sq(self.params.switch_on_accel_bias * dt);
        self.store.set_diag(DANG_BIAS..DANG_BIAS + 3, dang_var);
        self.store.set_diag(DVEL_BIAS..DVEL_BIAS + 3, dvel_var);
        self.prev_dvel_bias_var = Vector3f::repeat(dvel_var);
        self.time_last_imu_bias_reset = Some(now);
        info!("IMU bias estimates reset");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EkfParams;
    use approx::assert_abs_diff_eq;

    fn ekf() -> Ekf {
        let mut ekf = Ekf::new(EkfParams::default()).expect("default parameters are valid");
        ekf.store.initialise_quat_covariances(&Vector3f::repeat(0.01));
        ekf.store.set_diag(VEL_N..POS_D + 1, 1.0);
        ekf
    }

    #[test]
    fn position_reset_records_its_step() {
        let mut ekf = ekf();
        ekf.store.state.pos = Vector3f::new(3.0, -4.0, 1.0);
        ekf.last_known_pos_ne = Vector2f::new(1.0, 2.0);
        let before = ekf.store.state.pos.xy();
        let counter = ekf.reset.pos_ne_counter;

        assert!(ekf.reset_position());
        let after = ekf.store.state.pos.xy();
        assert_eq!(after, before + ekf.reset.pos_ne_change);
        assert_eq!(ekf.reset.pos_ne_counter, counter.wrapping_add(1));
        assert_abs_diff_eq!(ekf.store.p[(POS_N, POS_N)], sq(ekf.params.pos_noaid_noise));
    }

    #[test]
    fn unaided_velocity_reset_zeroes_horizontal_velocity() {
        let mut ekf = ekf();
        ekf.store.state.vel = Vector3f::new(2.0, 1.0, -0.5);
        assert!(ekf.reset_velocity());
        assert_eq!(ekf.store.state.vel, Vector3f::new(0.0, 0.0, -0.5));
        assert_eq!(ekf.reset.vel_ne_change, Vector2f::new(-2.0, -1.0));
        assert_eq!(ekf.reset.vel_ne_counter, 1);
        assert_eq!(ekf.reset.vel_d_counter, 0);
    }

    #[test]
    fn yaw_reset_delta_maps_old_attitude_to_new() {
        let mut ekf = ekf();
        ekf.store.state.quat_nominal = quat_from_euler(0.1, -0.05, 0.3);
        let q_pre = ekf.store.state.quat_nominal;

        let delta = ekf.reset_quat_yaw(1.2, Some(0.04), true);
        let q_post = ekf.store.state.quat_nominal;
        let rebuilt = q_pre * delta;
        for i in 0..4 {
            assert_abs_diff_eq!(rebuilt.coords[i], q_post.coords[i], epsilon = 1e-5);
        }
        assert_eq!(ekf.reset.quat_change, delta);
        assert_eq!(ekf.reset.quat_counter, 1);

        let (roll, pitch, yaw) = euler_321(&quat_to_dcm(&q_post));
        assert_abs_diff_eq!(roll, 0.1, epsilon = 1e-4);
        assert_abs_diff_eq!(pitch, -0.05, epsilon = 1e-4);
        assert_abs_diff_eq!(yaw, 1.2, epsilon = 1e-4);
    }

    #[test]
    fn bias_reset_has_a_cooldown() {
        let mut ekf = ekf();
        ekf.time_last_imu = 1_000_000;
        ekf.store.state.delta_ang_bias = Vector3f::repeat(1e-4);
        assert!(ekf.reset_imu_bias());
        assert_eq!(ekf.store.state.delta_ang_bias, Vector3f::zeros());

        ekf.time_last_imu += IMU_BIAS_RESET_COOLDOWN_US - 1;
        ekf.store.state.delta_ang_bias = Vector3f::repeat(2e-4);
        ekf.store.p[(DANG_BIAS, DANG_BIAS)] = 3e-9;
        let before = ekf.store.clone();
        let counters = ekf.reset;
        assert!(!ekf.reset_imu_bias());
        assert_eq!(ekf.store, before);
        assert_eq!(ekf.reset, counters);

        ekf.time_last_imu += 1;
        assert!(ekf.reset_imu_bias());
    }

    #[test]
    fn counters_wrap() {
        let mut status = ResetStatus {
            pos_d_counter: 255,
            ..Default::default()
        };
        status.record_pos_d(1.5);
        assert_eq!(status.pos_d_counter, 0);
        assert_eq!(status.pos_d_change, 1.5);
        assert_eq!(status.vel_d_counter, 0);
    }
}
