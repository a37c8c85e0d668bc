// ekf_core/src/estimation/output.rs

//! Real-time output predictor.
//!
//! The filter itself runs on the delayed fusion horizon. The output
//! predictor integrates every raw IMU sample forward to the present and
//! keeps pulling its history towards the delayed estimate: the attitude
//! through a delta angle correction, velocity and position through a
//! proportional plus integral correction applied to the whole history.

use crate::buffers::ObservationBuffer;
use crate::estimation::state::StateSample;
use crate::frames::{normalized, quat_from_rotation_vector, quat_to_dcm};
use crate::messages::{ImuSample, OutputSample};
use crate::types::{constrain, sq, Matrix3f, Quatf, TimeUs, Vector3f, GRAVITY};

/// Capacity of the IMU and output delay lines.
pub const DELAY_BUFFER_CAPACITY: usize = 48;

/// Longest time constant accepted for the velocity and position tracking
/// loops (s).
const MAX_TRACKING_TAU: f32 = 10.0;

/// Gains of the tracking loop for one correction step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingGains {
    /// Averaged filter period (s).
    pub dt_ekf_avg: f32,
    /// Averaged raw IMU period (s).
    pub dt_imu_avg: f32,
    /// Current time delay between the newest IMU sample and the fusion
    /// horizon (s).
    pub time_delay: f32,
    pub vel_tau: f32,
    pub pos_tau: f32,
}

#[derive(Debug, Clone)]
pub struct OutputPredictor {
    output_new: OutputSample,
    history: ObservationBuffer<OutputSample, DELAY_BUFFER_CAPACITY>,
    delta_angle_corr: Vector3f,
    vel_err_integ: Vector3f,
    pos_err_integ: Vector3f,
    /// Attitude (rad), velocity (m/s) and position (m) tracking error
    /// magnitudes at the last correction.
    tracking_error: [f32; 3],
    r_to_earth_now: Matrix3f,
    vel_deriv_ned: Vector3f,
    /// IMU velocity relative to the body origin, NED.
    vel_imu_rel_body_ned: Vector3f,
}

impl OutputPredictor {
    pub fn with_length(length: usize) -> Self {
        Self {
            output_new: OutputSample::default(),
            history: ObservationBuffer::with_length(length),
            delta_angle_corr: Vector3f::zeros(),
            vel_err_integ: Vector3f::zeros(),
            pos_err_integ: Vector3f::zeros(),
            tracking_error: [0.0; 3],
            r_to_earth_now: Matrix3f::identity(),
            vel_deriv_ned: Vector3f::zeros(),
            vel_imu_rel_body_ned: Vector3f::zeros(),
        }
    }

    /// Latest real-time solution.
    pub fn output(&self) -> &OutputSample {
        &self.output_new
    }

    /// Oldest stored sample, aligned with the fusion horizon once the
    /// history is full.
    pub fn delayed(&self) -> Option<&OutputSample> {
        self.history.oldest()
    }

    pub fn tracking_error(&self) -> [f32; 3] {
        self.tracking_error
    }

    pub fn delta_angle_corr(&self) -> &Vector3f {
        &self.delta_angle_corr
    }

    pub fn vel_deriv_ned(&self) -> &Vector3f {
        &self.vel_deriv_ned
    }

    pub fn vel_imu_rel_body_ned(&self) -> &Vector3f {
        &self.vel_imu_rel_body_ned
    }

    /// Integrates one raw IMU sample. `dang_bias` and `dvel_bias` are the
    /// bias estimates already scaled to the raw IMU period.
    pub fn integrate(
        &mut self,
        imu: &ImuSample,
        dang_bias: &Vector3f,
        dvel_bias: &Vector3f,
        imu_pos_body: &Vector3f,
    ) {
        let delta_angle = imu.delta_ang - dang_bias + self.delta_angle_corr;
        let delta_vel = imu.delta_vel - dvel_bias;

        let out = &mut self.output_new;
        out.time_us = imu.time_us;
        out.quat_nominal = normalized(&(out.quat_nominal * quat_from_rotation_vector(&delta_angle)));
        self.r_to_earth_now = quat_to_dcm(&out.quat_nominal);

        let mut delta_vel_ned = self.r_to_earth_now * delta_vel;
        delta_vel_ned[2] += GRAVITY * imu.delta_vel_dt;
        if imu.delta_vel_dt > 1e-4 {
            self.vel_deriv_ned = delta_vel_ned / imu.delta_vel_dt;
        }

        let vel_last = out.vel;
        out.vel += delta_vel_ned;
        out.pos += (out.vel + vel_last) * (0.5 * imu.delta_vel_dt);

        if imu.delta_ang_dt > 0.0 {
            let ang_rate = imu.delta_ang / imu.delta_ang_dt;
            self.vel_imu_rel_body_ned = self.r_to_earth_now * ang_rate.cross(imu_pos_body);
        }
    }

    /// Stores the current solution and corrects the history against the
    /// delayed filter state. Called once per filter cycle.
    pub fn correct(&mut self, state: &StateSample, gains: &TrackingGains) {
        self.history.push(self.output_new);
        let Some(delayed) = self.history.oldest().copied() else {
            return;
        };

        // Attitude: steer the integration so the delayed output quaternion
        // converges on the filter quaternion.
        let q_error = normalized(&(state.quat_nominal.conjugate() * delayed.quat_nominal));
        let scalar = if q_error.w >= 0.0 { -2.0 } else { 2.0 };
        let delta_ang_error = q_error.imag() * scalar;
        let time_delay = gains.time_delay.max(gains.dt_imu_avg);
        let att_gain = if time_delay > 0.0 {
            0.5 * gains.dt_imu_avg / time_delay
        } else {
            0.0
        };
        self.delta_angle_corr = delta_ang_error * att_gain;

        let vel_err = state.vel - delayed.vel;
        let pos_err = state.pos - delayed.pos;
        self.tracking_error = [delta_ang_error.norm(), vel_err.norm(), pos_err.norm()];

        let dt = gains.dt_ekf_avg;
        let vel_gain = dt / constrain(gains.vel_tau, dt, MAX_TRACKING_TAU);
        self.vel_err_integ += vel_err;
        let vel_correction = vel_err * vel_gain + self.vel_err_integ * sq(vel_gain) * 0.1;

        let pos_gain = dt / constrain(gains.pos_tau, dt, MAX_TRACKING_TAU);
        self.pos_err_integ += pos_err;
        let pos_correction = pos_err * pos_gain + self.pos_err_integ * sq(pos_gain) * 0.1;

        for sample in self.history.iter_mut() {
            sample.vel += vel_correction;
            sample.pos += pos_correction;
        }
        if let Some(newest) = self.history.newest() {
            self.output_new = *newest;
        }
    }

    /// Snaps the whole history onto the delayed filter state, keeping the
    /// relative motion stored in it. With an empty history the current
    /// solution becomes the filter state.
    pub fn align(&mut self, state: &StateSample, time_us: TimeUs) {
        let Some(delayed) = self.history.oldest().copied() else {
            self.output_new = OutputSample {
                time_us,
                quat_nominal: state.quat_nominal,
                vel: state.vel,
                pos: state.pos,
            };
            self.reset_integrals();
            return;
        };
        let q_delta = normalized(&(state.quat_nominal * delayed.quat_nominal.conjugate()));
        let vel_delta = state.vel - delayed.vel;
        let pos_delta = state.pos - delayed.pos;
        self.apply(|s| {
            s.quat_nominal = normalized(&(q_delta * s.quat_nominal));
            s.vel += vel_delta;
            s.pos += pos_delta;
        });
        self.reset_integrals();
    }

    /// Shifts history and solution by a velocity step.
    pub fn apply_velocity_reset(&mut self, delta: &Vector3f) {
        self.apply(|s| s.vel += delta);
    }

    /// Shifts history and solution by a position step.
    pub fn apply_position_reset(&mut self, delta: &Vector3f) {
        self.apply(|s| s.pos += delta);
    }

    /// Rotates history and solution by an earth frame rotation.
    pub fn apply_attitude_reset(&mut self, q_earth: &Quatf) {
        self.apply(|s| s.quat_nominal = normalized(&(*q_earth * s.quat_nominal)));
    }

    fn apply<F: Fn(&mut OutputSample)>(&mut self, f: F) {
        for sample in self.history.iter_mut() {
            f(sample);
        }
        f(&mut self.output_new);
    }

    fn reset_integrals(&mut self) {
        self.delta_angle_corr = Vector3f::zeros();
        self.vel_err_integ = Vector3f::zeros();
        self.pos_err_integ = Vector3f::zeros();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::quat_from_euler;
    use approx::assert_abs_diff_eq;

    const DT: f32 = 0.01;

    fn level_imu(time_us: TimeUs) -> ImuSample {
        ImuSample {
            delta_ang: Vector3f::zeros(),
            delta_vel: Vector3f::new(0.0, 0.0, -GRAVITY * DT),
            delta_ang_dt: DT,
            delta_vel_dt: DT,
            time_us,
        }
    }

    fn gains() -> TrackingGains {
        TrackingGains {
            dt_ekf_avg: DT,
            dt_imu_avg: DT,
            time_delay: 0.1,
            vel_tau: 0.25,
            pos_tau: 0.25,
        }
    }

    #[test]
    fn static_integration_holds_still() {
        let mut out = OutputPredictor::with_length(10);
        let zero = Vector3f::zeros();
        for k in 1..=100 {
            out.integrate(&level_imu(k * 10_000), &zero, &zero, &zero);
        }
        assert_abs_diff_eq!(out.output().vel.norm(), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out.output().pos.norm(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn tracking_pulls_velocity_towards_the_filter() {
        let mut out = OutputPredictor::with_length(10);
        let zero = Vector3f::zeros();
        let state = StateSample {
            vel: Vector3f::new(1.0, 0.0, 0.0),
            ..Default::default()
        };
        let mut first_error = None;
        for k in 1..=300 {
            out.integrate(&level_imu(k * 10_000), &zero, &zero, &zero);
            out.correct(&state, &gains());
            first_error.get_or_insert(out.tracking_error()[1]);
        }
        let first = first_error.unwrap_or_default();
        assert!(out.tracking_error()[1] < 0.1 * first);
    }

    #[test]
    fn align_moves_history_onto_the_state() {
        let mut out = OutputPredictor::with_length(5);
        let zero = Vector3f::zeros();
        for k in 1..=5 {
            out.integrate(&level_imu(k * 10_000), &zero, &zero, &zero);
            out.correct(&StateSample::default(), &gains());
        }
        let state = StateSample {
            quat_nominal: quat_from_euler(0.0, 0.0, 1.0),
            pos: Vector3f::new(3.0, -2.0, 1.0),
            ..Default::default()
        };
        out.align(&state, 50_000);
        let delayed = out.delayed().copied().unwrap_or_default();
        assert_abs_diff_eq!(delayed.pos, state.pos, epsilon = 1e-4);
        assert_abs_diff_eq!(delayed.quat_nominal.dot(&state.quat_nominal).abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn resets_shift_the_solution() {
        let mut out = OutputPredictor::with_length(5);
        out.apply_position_reset(&Vector3f::new(1.0, 2.0, 0.0));
        out.apply_velocity_reset(&Vector3f::new(0.0, 0.0, -1.0));
        assert_abs_diff_eq!(out.output().pos, Vector3f::new(1.0, 2.0, 0.0), epsilon = 1e-6);
        assert_abs_diff_eq!(out.output().vel[2], -1.0, epsilon = 1e-6);
    }
}
