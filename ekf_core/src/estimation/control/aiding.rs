// ekf_core/src/estimation/control/aiding.rs

//! Relative aiding sources: optical flow, external vision and auxiliary
//! velocity.

use tracing::{info, warn};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::mag::heading_of;
use crate::estimation::fusion::vel_pos::AxisObservation;
use crate::frames::{
    normalized, prefer_321_sequence, quat_from_rotation_vector, quat_to_dcm,
    quat_to_rotation_vector,
};
use crate::params::fusion_mask;
use crate::types::{constrain, elapsed_us, sq, Matrix3f, Quatf, TimeUs, Vector2f, Vector3f, GRAVITY};

/// Longest expected interval between vision samples (us).
const EV_MAX_INTERVAL_US: u64 = 200_000;

/// Cut-off of the vision frame alignment filter (rad/us).
const EV_ROT_LPF_OMEGA: f32 = 0.2e-6;

/// Largest step of the vision frame alignment filter input (rad).
const EV_ROT_INPUT_LIMIT: f32 = 0.1;

/// Minimum noise of incremental vision position observations (m).
const EV_ODOM_MIN_NOISE: f32 = 0.5;

/// On-ground time with suitable motion required before flow resumes (us).
const FLOW_GOOD_MOTION_HOLD_US: u64 = 5_000_000;

/// On-ground time with unsuitable motion tolerated before flow stops (us).
const FLOW_BAD_MOTION_HOLD_US: u64 = 100_000;

/// Flow keeps fusing this long after the last height above ground
/// correction (us).
const FLOW_HAGL_TIMEOUT_US: u64 = 10_000_000;

/// Gap after which a vehicle relying on flow alone is reset (us).
const FLOW_RESET_TIMEOUT_US: u64 = 7_000_000;

/// Alignment between the external vision reference frame and the
/// navigation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ExtVisionFrame {
    /// Filtered rotation vector from the vision frame to the navigation frame.
    pub rot_vec_filt: Vector3f,
    pub rot_mat: Matrix3f,
    pub last_time_us: TimeUs,
    /// Vision position fused as increments on top of GPS.
    pub fuse_as_odometry: bool,
    pub pos_meas_prev: Vector3f,
    pub hpos_pred_prev: Vector2f,
}

impl Default for ExtVisionFrame {
    fn default() -> Self {
        Self {
            rot_vec_filt: Vector3f::zeros(),
            rot_mat: Matrix3f::identity(),
            last_time_us: 0,
            fuse_as_odometry: false,
            pos_meas_prev: Vector3f::zeros(),
            hpos_pred_prev: Vector2f::zeros(),
        }
    }
}

impl Ekf {
    // --- Optical flow ---

    /// Decides whether optical flow may be used, starts and stops flow
    /// aiding and fuses the delayed flow sample.
    pub(crate) fn control_optical_flow_fusion(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        self.update_flow_motion_checks();

        let gps_err_norm_lim = if self.control.opt_flow { 0.7 } else { 1.0 };
        let flow_required = self.control.in_air
            && (self.aiding.is_dead_reckoning
                || (self.control.opt_flow && !self.control.gps && !self.control.ev_pos)
                || (self.control.gps && self.gps_checks.error_norm > gps_err_norm_lim));

        let range_aid = self.range_checks.range_aid_enabled;
        let flow = &mut self.flow;
        if !flow.inhibit_use && self.control.opt_flow {
            let preflight_bad = !self.control.in_air
                && elapsed_us(now, flow.time_good_motion_us) > FLOW_BAD_MOTION_HOLD_US;
            let flight_bad = self.control.in_air && !range_aid;
            if (preflight_bad || flight_bad) && !flow_required {
                flow.inhibit_use = true;
            }
        } else if flow.inhibit_use && !self.control.opt_flow {
            let preflight_ok = !self.control.in_air
                && elapsed_us(now, flow.time_bad_motion_us) > FLOW_GOOD_MOTION_HOLD_US;
            let flight_ok = self.control.in_air && range_aid;
            if preflight_ok || flight_ok || flow_required {
                flow.inhibit_use = false;
            }
        }

        if self.control.opt_flow {
            if self.flow.inhibit_use {
                self.control.opt_flow = false;
                self.timers.last_of_fuse = 0;
                info!("optical flow use inhibited");
            } else if elapsed_us(now, self.timers.last_of_fuse) > self.params.no_aid_timeout_max {
                self.control.opt_flow = false;
                warn!("optical flow fusion timeout");
            }
        }

        let selected = self.params.uses(fusion_mask::USE_OPT_FLOW);
        if selected
            && !self.control.opt_flow
            && self.control.tilt_align
            && !self.flow.inhibit_use
            && self.terrain.is_valid()
        {
            if !self.control.yaw_align {
                let mag = self.delayed.mag.mag;
                self.control.yaw_align = self.reset_mag_heading(&mag, false, true);
            }
            if self.control.yaw_align {
                self.control.opt_flow = true;
                self.timers.last_of_fuse = now;
                if !(self.control.gps || self.control.ev_pos) {
                    self.reset_velocity();
                    self.reset_position();
                    let state = self.store.state;
                    self.output.align(&state, self.time_last_imu);
                }
                info!("starting optical flow fusion");
            }
        } else if !selected {
            self.control.opt_flow = false;
        }

        // Relying on flow alone but not fusing it: reset to what flow says.
        if self.control.opt_flow
            && !self.control.gps
            && !self.control.ev_pos
            && elapsed_us(now, self.timers.last_of_fuse) > FLOW_RESET_TIMEOUT_US
        {
            self.reset_velocity();
            self.reset_position();
            self.timers.last_of_fuse = now;
        }

        if !self.delayed.flow_ready {
            return;
        }
        let mut sample = self.delayed.flow;
        self.calc_opt_flow_body_rate_comp(&mut sample);
        self.delayed.flow = sample;

        let quality_good = sample.quality >= self.params.flow_qual_min;
        let hagl = self.terrain.vpos() - self.store.state.pos[2];
        let in_range = hagl >= self.flow.min_distance && hagl <= self.flow.max_distance;
        let hagl_recent =
            elapsed_us(now, self.terrain.time_last_fuse()) < FLOW_HAGL_TIMEOUT_US;
        if !self.flow.inhibit_use && self.control.opt_flow && quality_good && in_range && hagl_recent
        {
            self.fuse_opt_flow(&sample);
            self.last_known_pos_ne = self.store.state.pos.xy();
        }
    }

    /// On the ground, marks whether the vehicle is being moved in a way
    /// flow cannot follow.
    fn update_flow_motion_checks(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let imu = self.imu_sample_delayed;
        if self.control.in_air {
            self.flow.time_bad_motion_us = 0;
            self.flow.time_good_motion_us = now;
            return;
        }
        let accel_norm = if imu.delta_vel_dt > 0.0 {
            imu.delta_vel.norm() / imu.delta_vel_dt
        } else {
            GRAVITY
        };
        let excessive = accel_norm > 1.5 * GRAVITY
            || accel_norm < 0.5 * GRAVITY
            || self.ang_rate_mag_filt > self.flow.max_rate
            || self.r_to_earth[(2, 2)] < 0.866;
        if excessive {
            self.flow.time_bad_motion_us = now;
        } else {
            self.flow.time_good_motion_us = now;
        }
    }

    // --- External vision ---

    /// Position in the navigation frame of a vision position.
    pub(crate) fn ev_position_ned(&self, pos: &Vector3f) -> Vector3f {
        if self.params.uses(fusion_mask::ROTATE_EV) {
            self.ev_frame.rot_mat * pos
        } else {
            *pos
        }
    }

    /// Yaw of the delayed vision attitude.
    pub(crate) fn ev_yaw_measurement(&self) -> f32 {
        let dcm = quat_to_dcm(&self.delayed.ev.quat);
        let use_321 = prefer_321_sequence(&quat_to_dcm(&self.store.state.quat_nominal));
        heading_of(&dcm, use_321)
    }

    /// Rotation from the navigation frame to the vision frame.
    pub(crate) fn ekf_to_ev_quaternion(&self) -> Quatf {
        quat_from_rotation_vector(&self.ev_frame.rot_vec_filt).conjugate()
    }

    /// Updates the rotation between the vision and navigation frames from
    /// the difference of their attitudes, spike limited and low passed.
    pub(crate) fn calc_ext_vis_rot_mat(&mut self) {
        let q_error = normalized(&(self.store.state.quat_nominal * self.delayed.ev.quat.conjugate()));
        let mut rot_vec = quat_to_rotation_vector(&q_error);
        let frame = &mut self.ev_frame;
        if rot_vec.norm() > 1e-6 {
            let input_delta = rot_vec - frame.rot_vec_filt;
            let delta_len = input_delta.norm();
            if delta_len > EV_ROT_INPUT_LIMIT {
                rot_vec = frame.rot_vec_filt + input_delta * (EV_ROT_INPUT_LIMIT / delta_len);
            }
            let alpha = constrain(
                EV_ROT_LPF_OMEGA * elapsed_us(self.time_last_imu, frame.last_time_us) as f32,
                0.0,
                1.0,
            );
            frame.last_time_us = self.time_last_imu;
            frame.rot_vec_filt = frame.rot_vec_filt * (1.0 - alpha) + rot_vec * alpha;
        }
        frame.rot_mat = quat_to_dcm(&quat_from_rotation_vector(&frame.rot_vec_filt));
    }

    /// Starts vision position or yaw aiding, queues the position
    /// observation and fuses the yaw.
    pub(crate) fn control_external_vision_fusion(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        if !self.delayed.ev_ready {
            if self.control.ev_pos
                && elapsed_us(self.time_last_imu, self.timers.last_ext_vision)
                    > self.params.no_aid_timeout_max
            {
                self.control.ev_pos = false;
                warn!("external vision data stopped");
            }
            return;
        }

        let use_pos = self.params.uses(fusion_mask::USE_EV_POS);
        if self.params.uses(fusion_mask::ROTATE_EV) && use_pos && !self.control.ev_yaw {
            self.calc_ext_vis_rot_mat();
        }
        let arriving =
            elapsed_us(self.time_last_imu, self.timers.last_ext_vision) < 2 * EV_MAX_INTERVAL_US;

        if use_pos && !self.control.ev_pos && self.control.tilt_align && self.control.yaw_align && arriving
        {
            self.control.ev_pos = true;
            if self.control.gps {
                self.ev_frame.fuse_as_odometry = true;
            } else {
                self.ev_frame.fuse_as_odometry = false;
                self.reset_position();
                self.reset_velocity();
            }
            self.ev_frame.pos_meas_prev = self.ev_position_ned(&self.delayed.ev.pos);
            self.ev_frame.hpos_pred_prev = self.store.state.pos.xy();
            info!(odometry = self.ev_frame.fuse_as_odometry, "starting external vision position fusion");
        }

        if !self.control.gps
            && self.params.uses(fusion_mask::USE_EV_YAW)
            && !self.control.ev_yaw
            && self.control.tilt_align
            && arriving
        {
            let yaw = self.ev_yaw_measurement();
            let var = sq(self.delayed.ev.ang_err.max(self.params.ev_ang_noise));
            self.reset_quat_yaw(yaw, Some(var), true);
            self.control.yaw_align = true;
            self.control.ev_yaw = true;
            self.control.mag_hdg = false;
            self.control.mag_3d = false;
            self.control.mag_dec = false;
            info!("starting external vision yaw fusion");
        }

        if self.control.ev_pos {
            self.queue_ev_position(now);
        }

        if self.control.ev_yaw {
            let yaw = self.ev_yaw_measurement();
            let var = sq(self.delayed.ev.ang_err.max(self.params.ev_ang_noise));
            self.fuse_heading(yaw, var);
        }
    }

    fn queue_ev_position(&mut self, now: TimeUs) {
        let ev = self.delayed.ev;
        let pos_ned = self.ev_position_ned(&ev.pos);
        let offset = self.r_to_earth * (self.params.ev_pos_body - self.params.imu_pos_body);

        let (measured, noise) = if self.ev_frame.fuse_as_odometry {
            let delta = pos_ned - self.ev_frame.pos_meas_prev;
            let measured = self.ev_frame.hpos_pred_prev + delta.xy();
            (measured, ev.pos_err.max(EV_ODOM_MIN_NOISE))
        } else {
            if elapsed_us(now, self.timers.last_pos_fuse) > self.params.no_aid_timeout_max {
                if elapsed_us(now, self.timers.last_of_fuse) > 1_000_000 {
                    self.reset_velocity();
                }
                self.reset_position();
            }
            (pos_ned.xy(), ev.pos_err.max(self.params.ev_pos_noise).max(0.01))
        };
        self.ev_frame.pos_meas_prev = pos_ned;
        self.ev_frame.hpos_pred_prev = self.store.state.pos.xy();

        let measured = measured - offset.xy();
        self.pending.hor_pos = Some(AxisObservation {
            measurement: [measured[0], measured[1]],
            obs_var: [sq(noise); 2],
            gate: self.params.ev_innov_gate.max(1.0),
        });
    }

    // --- Auxiliary velocity ---

    /// Fuses auxiliary horizontal velocity while a primary aiding source is
    /// active.
    pub(crate) fn control_aux_vel_fusion(&mut self) {
        let primary_aiding = self.control.gps || self.control.ev_pos || self.control.opt_flow;
        self.control.fuse_aux_vel = self.delayed.aux_vel_ready && primary_aiding;
        if !self.control.fuse_aux_vel {
            return;
        }
        let sample = self.delayed.aux_vel;
        self.fuse_aux_vel(
            [sample.vel_ne[0], sample.vel_ne[1]],
            [sample.vel_var_ne[0], sample.vel_var_ne[1]],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_vision_frame_is_identity() {
        let frame = ExtVisionFrame::default();
        assert_abs_diff_eq!(frame.rot_mat, Matrix3f::identity());
        assert!(!frame.fuse_as_odometry);
    }
}
