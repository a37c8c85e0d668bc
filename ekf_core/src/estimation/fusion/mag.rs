// ekf_core/src/estimation/fusion/mag.rs

//! Magnetometer observations: the three field components, a heading angle
//! derived from the field, and the declination of the earth field states.

use tracing::debug;

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::{numeric_jacobian_angle, test_ratio};
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::layout::{MAG_B, MAG_E, MAG_I, MAG_N, QUAT};
use crate::frames::{
    dcm_from_euler_312, dcm_from_euler_321, euler_312, euler_321, prefer_321_sequence,
    quat_to_dcm, rotate_jacobian,
};
use crate::types::{constrain, sq, wrap_pi, Matrix3f, Quatf, StateVector, Vector3f};

/// Smallest horizontal earth field the declination logic works with (gauss).
const MIN_HORIZONTAL_FIELD: f32 = 0.001;

/// Largest departure of the estimated declination from the reference (rad).
const DECLINATION_TOLERANCE: f32 = 0.5;

/// Predicted body frame field, `R(q)ᵀ m_earth + m_bias`, for one axis, with
/// its Jacobian.
pub(crate) fn mag_observation(state: &StateSample, axis: usize) -> (f32, StateVector) {
    let q = state.quat_nominal;
    let r = quat_to_dcm(&q);
    let predicted = r.transpose() * state.mag_i + state.mag_b;

    let mut h = StateVector::zeros();
    // Rᵀ(q) u = R(q*) u, so differentiate about the conjugate and flip the
    // sign of the vector part.
    let conj = Quatf::new(q.w, -q.i, -q.j, -q.k);
    let dq = rotate_jacobian(&conj, &state.mag_i);
    for col in 0..4 {
        let sign = if col == 0 { 1.0 } else { -1.0 };
        h[QUAT + col] = sign * dq[(axis, col)];
    }
    for col in 0..3 {
        h[MAG_I + col] = r[(col, axis)];
    }
    h[MAG_B + axis] = 1.0;
    (predicted[axis], h)
}

/// Yaw of `dcm` using the chosen Euler sequence.
pub(crate) fn heading_of(dcm: &Matrix3f, use_321: bool) -> f32 {
    if use_321 {
        euler_321(dcm).2
    } else {
        euler_312(dcm).2
    }
}

/// Heading that makes `mag_body` point at the declination, given the tilt
/// of `dcm`.
pub(crate) fn measured_heading(
    dcm: &Matrix3f,
    mag_body: &Vector3f,
    declination: f32,
    use_321: bool,
) -> f32 {
    let r_tilt = if use_321 {
        let (roll, pitch, _) = euler_321(dcm);
        dcm_from_euler_321(roll, pitch, 0.0)
    } else {
        let (roll, pitch, _) = euler_312(dcm);
        dcm_from_euler_312(roll, pitch, 0.0)
    };
    let mag_level = r_tilt * mag_body;
    wrap_pi(-mag_level[1].atan2(mag_level[0]) + declination)
}

impl Ekf {
    /// Declination used for heading observations and field resets (rad).
    pub(crate) fn mag_declination(&self) -> f32 {
        let mag = &self.store.state.mag_i;
        if self.control.mag_aligned_in_flight && mag.xy().norm() >= MIN_HORIZONTAL_FIELD {
            mag[1].atan2(mag[0])
        } else {
            self.params.mag_declination_deg.to_radians()
        }
    }

    /// Fuses the three field components in sequence.
    pub(crate) fn fuse_mag(&mut self, mag: &Vector3f) -> bool {
        let measured = *mag;
        let obs_var = [sq(self.params.mag_noise.max(1e-3)); 3];
        let result = self.fuse_axis_group(obs_var, self.params.mag_innov_gate, move |state, axis| {
            let (predicted, h) = mag_observation(state, axis);
            (measured[axis] - predicted, h)
        });

        self.innov.mag = result.innov;
        self.innov.mag_var = result.innov_var;
        self.innov.mag_test_ratio = result.test_ratio;
        self.faults.bad_mag_x = result.failed_axis == Some(0);
        self.faults.bad_mag_y = result.failed_axis == Some(1);
        self.faults.bad_mag_z = result.failed_axis == Some(2);

        let axis_bits = [
            innovation_fault::MAG_X,
            innovation_fault::MAG_Y,
            innovation_fault::MAG_Z,
        ];
        for (bit, ratio) in axis_bits.iter().zip(result.test_ratio) {
            if ratio > 1.0 || result.failed_axis.is_some() {
                self.innov_check_fail_status |= *bit;
            } else {
                self.innov_check_fail_status &= !*bit;
            }
        }

        if result.fused() {
            self.limit_declination();
            self.timers.last_mag_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }

    /// Fuses a yaw observation, picking the Euler sequence that is away from
    /// its singularity at the current attitude.
    ///
    /// On the ground a failed gate does not reject the observation; the
    /// innovation is clipped to the gate instead, so a large initial yaw
    /// error or gyro bias can still be corrected.
    pub(crate) fn fuse_heading(&mut self, measured_yaw: f32, obs_var: f32) -> bool {
        let use_321 = prefer_321_sequence(&quat_to_dcm(&self.store.state.quat_nominal));
        let obs_var = obs_var.max(sq(1e-2));
        let gate = self.params.heading_innov_gate.max(1.0);
        let model = move |state: &StateSample| heading_of(&quat_to_dcm(&state.quat_nominal), use_321);

        let h = numeric_jacobian_angle(&self.store.state, model);
        let innov = wrap_pi(measured_yaw - model(&self.store.state));
        let innov_var = self.store.innovation_variance(&h, obs_var);

        self.innov.heading = innov;
        self.innov.heading_var = innov_var;
        if !(innov_var >= obs_var) {
            self.faults.bad_hdg = true;
            return false;
        }
        self.faults.bad_hdg = false;

        let ratio = test_ratio(innov, innov_var, gate);
        self.innov.yaw_test_ratio = ratio;
        let innov = if ratio > 1.0 {
            self.innov_check_fail_status |= innovation_fault::YAW;
            if self.control.in_air {
                return false;
            }
            // On the ground the clipped innovation is still fused.
            let limit = (sq(gate) * innov_var).sqrt();
            constrain(innov, -limit, limit)
        } else {
            self.innov_check_fail_status &= !innovation_fault::YAW;
            innov
        };

        if !self.fuse_scalar(&h, innov, innov_var) {
            self.faults.bad_hdg = true;
            return false;
        }
        self.timers.last_heading_fuse = self.imu_sample_delayed.time_us;
        true
    }

    /// Heading from the magnetometer, for [`Ekf::fuse_heading`].
    pub(crate) fn mag_heading_measurement(&self, mag: &Vector3f) -> f32 {
        let dcm = quat_to_dcm(&self.store.state.quat_nominal);
        let use_321 = prefer_321_sequence(&dcm);
        measured_heading(
            &dcm,
            &(mag - self.store.state.mag_b),
            self.mag_declination(),
            use_321,
        )
    }

    /// Fuses the declination of the earth field states as an observation.
    /// Not gated; the innovation is limited instead.
    pub(crate) fn fuse_declination(&mut self, decl_sigma: f32) -> bool {
        let mag_n = self.store.state.mag_i[0];
        let mag_e = self.store.state.mag_i[1];
        let h_field_sq = sq(mag_n) + sq(mag_e);
        if h_field_sq < sq(MIN_HORIZONTAL_FIELD) {
            return false;
        }

        let obs_var = sq(decl_sigma);
        let mut h = StateVector::zeros();
        h[MAG_N] = -mag_e / h_field_sq;
        h[MAG_E] = mag_n / h_field_sq;

        let declination = self.params.mag_declination_deg.to_radians();
        let innov = constrain(wrap_pi(declination - mag_e.atan2(mag_n)), -0.5, 0.5);
        let innov_var = self.store.innovation_variance(&h, obs_var);
        if !(innov_var >= obs_var) || !self.fuse_scalar(&h, innov, innov_var) {
            self.faults.bad_mag_decl = true;
            debug!("declination fusion failed");
            return false;
        }
        self.faults.bad_mag_decl = false;
        true
    }

    /// Keeps the horizontal earth field from collapsing and its declination
    /// close to the reference value.
    pub(crate) fn limit_declination(&mut self) {
        let reference = self.params.mag_declination_deg.to_radians();
        let mag = &mut self.store.state.mag_i;

        let mut h_field = (sq(mag[0]) + sq(mag[1])).sqrt();
        if h_field < MIN_HORIZONTAL_FIELD {
            if h_field > 1e-3 * MIN_HORIZONTAL_FIELD {
                let scale = MIN_HORIZONTAL_FIELD / h_field;
                mag[0] *= scale;
                mag[1] *= scale;
            } else {
                mag[0] = 2.0 * MIN_HORIZONTAL_FIELD * reference.cos();
                mag[1] = 2.0 * MIN_HORIZONTAL_FIELD * reference.sin();
            }
            h_field = (sq(mag[0]) + sq(mag[1])).sqrt();
        }

        let estimate = mag[1].atan2(mag[0]);
        let offset = wrap_pi(estimate - reference);
        if offset.abs() > DECLINATION_TOLERANCE {
            let limited = reference + DECLINATION_TOLERANCE.copysign(offset);
            mag[0] = h_field * limited.cos();
            mag[1] = h_field * limited.sin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::fusion::numeric_jacobian;
    use crate::frames::quat_from_euler;
    use crate::params::EkfParams;
    use approx::assert_abs_diff_eq;

    fn field_state() -> StateSample {
        StateSample {
            quat_nominal: quat_from_euler(0.2, -0.3, 1.1),
            mag_i: Vector3f::new(0.21, 0.02, 0.43),
            mag_b: Vector3f::new(0.01, -0.02, 0.005),
            ..Default::default()
        }
    }

    #[test]
    fn analytic_mag_jacobian_matches_finite_difference() {
        let state = field_state();
        for axis in 0..3 {
            let (_, h) = mag_observation(&state, axis);
            let numeric = numeric_jacobian(&state, |s| mag_observation(s, axis).0);
            assert_abs_diff_eq!(h, numeric, epsilon = 2e-3);
        }
    }

    fn level_ekf(in_air: bool) -> Ekf {
        let mut ekf = Ekf::new(EkfParams::default()).expect("default parameters are valid");
        ekf.store.initialise_quat_covariances(&Vector3f::repeat(0.01));
        ekf.control.in_air = in_air;
        ekf
    }

    #[test]
    fn failed_heading_gate_is_clipped_on_the_ground() {
        let mut ekf = level_ekf(false);
        assert!(ekf.fuse_heading(1.5, 0.01));
        assert_ne!(ekf.innov_check_fail_status & innovation_fault::YAW, 0);

        let limit = (sq(ekf.params.heading_innov_gate) * ekf.innov.heading_var).sqrt();
        let yaw = heading_of(&quat_to_dcm(&ekf.store.state.quat_nominal), true);
        assert!(yaw > 0.05 && yaw <= limit + 1e-4, "yaw {yaw} limit {limit}");
    }

    #[test]
    fn failed_heading_gate_is_rejected_in_the_air() {
        let mut ekf = level_ekf(true);
        let before = ekf.store.clone();
        assert!(!ekf.fuse_heading(1.5, 0.01));
        assert_ne!(ekf.innov_check_fail_status & innovation_fault::YAW, 0);
        assert_eq!(ekf.store, before);
    }

    #[test]
    fn measured_heading_recovers_true_yaw() {
        let state = field_state();
        let dcm = quat_to_dcm(&state.quat_nominal);
        let mag_body = dcm.transpose() * Vector3f::new(0.2, 0.0, 0.4);
        for use_321 in [true, false] {
            let yaw = measured_heading(&dcm, &mag_body, 0.0, use_321);
            assert_abs_diff_eq!(yaw, heading_of(&dcm, use_321), epsilon = 1e-4);
        }
    }

    #[test]
    fn declination_is_added_to_the_heading() {
        let dcm = Matrix3f::identity();
        let yaw = measured_heading(&dcm, &Vector3f::new(0.2, 0.0, 0.4), 0.1, true);
        assert_abs_diff_eq!(yaw, 0.1, epsilon = 1e-6);
    }
}
