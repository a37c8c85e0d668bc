// ekf_core/src/estimation/fusion/airspeed.rs

//! Air data observations for fixed wing vehicles: true airspeed, and a
//! synthetic zero sideslip.

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::numeric_jacobian;
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::layout::{VEL_D, VEL_E, VEL_N, WIND_E, WIND_N};
use crate::frames::quat_to_dcm;
use crate::messages::AirspeedSample;
use crate::types::{constrain, sq, StateVector, Vector3f};

/// Predicted airspeed below which airspeed fusion is skipped (m/s).
const MIN_PREDICTED_TAS: f32 = 1.0;

/// Forward airspeed below which sideslip is not observable (m/s).
const MIN_SIDESLIP_AIRSPEED: f32 = 7.0;

/// Velocity relative to the air mass, NED.
pub(crate) fn air_relative_velocity(state: &StateSample) -> Vector3f {
    Vector3f::new(
        state.vel[0] - state.wind_vel[0],
        state.vel[1] - state.wind_vel[1],
        state.vel[2],
    )
}

/// Predicted true airspeed and its Jacobian.
pub(crate) fn airspeed_observation(state: &StateSample) -> (f32, StateVector) {
    let rel = air_relative_velocity(state);
    let tas = rel.norm();
    let mut h = StateVector::zeros();
    if tas > 0.0 {
        h[VEL_N] = rel[0] / tas;
        h[VEL_E] = rel[1] / tas;
        h[VEL_D] = rel[2] / tas;
        h[WIND_N] = -rel[0] / tas;
        h[WIND_E] = -rel[1] / tas;
    }
    (tas, h)
}

/// Sideslip angle of the air relative velocity, as the small angle ratio of
/// lateral to forward body velocity.
pub(crate) fn sideslip_of(state: &StateSample) -> f32 {
    let rel_body = quat_to_dcm(&state.quat_nominal).transpose() * air_relative_velocity(state);
    rel_body[1] / rel_body[0]
}

impl Ekf {
    pub(crate) fn fuse_airspeed(&mut self, sample: &AirspeedSample) -> bool {
        let (predicted, _) = airspeed_observation(&self.store.state);
        if predicted <= MIN_PREDICTED_TAS {
            return false;
        }

        let measured = sample.true_airspeed;
        let obs_var = sq(constrain(self.params.eas_noise, 0.5, 5.0) * constrain(sample.eas2tas, 0.9, 10.0));
        let result = self.fuse_axis_group([obs_var], self.params.tas_innov_gate, move |s, _| {
            let (tas, h) = airspeed_observation(s);
            (measured - tas, h)
        });

        self.innov.airspeed = result.innov[0];
        self.innov.airspeed_var = result.innov_var[0];
        self.innov.tas_test_ratio = result.test_ratio[0];
        self.faults.bad_airspeed = result.failed_axis.is_some();
        if result.accepted {
            self.innov_check_fail_status &= !innovation_fault::AIRSPEED;
        } else {
            self.innov_check_fail_status |= innovation_fault::AIRSPEED;
        }
        if result.fused() {
            self.timers.last_arsp_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }

    /// Fuses the assumption of zero sideslip.
    pub(crate) fn fuse_sideslip(&mut self) -> bool {
        let rel_body =
            self.r_to_earth.transpose() * air_relative_velocity(&self.store.state);
        if rel_body[0] <= MIN_SIDESLIP_AIRSPEED {
            return false;
        }

        let obs_var = sq(self.params.beta_noise.max(1e-2));
        let result = self.fuse_axis_group([obs_var], self.params.beta_innov_gate, |s, _| {
            (-sideslip_of(s), numeric_jacobian(s, sideslip_of))
        });

        self.innov.beta = result.innov[0];
        self.innov.beta_var = result.innov_var[0];
        self.innov.beta_test_ratio = result.test_ratio[0];
        self.faults.bad_sideslip = result.failed_axis.is_some();
        if result.accepted {
            self.innov_check_fail_status &= !innovation_fault::SIDESLIP;
        } else {
            self.innov_check_fail_status |= innovation_fault::SIDESLIP;
        }
        if result.fused() {
            self.timers.last_beta_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::quat_from_euler;
    use crate::types::Vector2f;
    use approx::assert_abs_diff_eq;

    #[test]
    fn airspeed_is_ground_speed_minus_wind() {
        let state = StateSample {
            vel: Vector3f::new(20.0, 0.0, 0.0),
            wind_vel: Vector2f::new(-5.0, 0.0),
            ..Default::default()
        };
        let (tas, h) = airspeed_observation(&state);
        assert_abs_diff_eq!(tas, 25.0, epsilon = 1e-5);
        assert_abs_diff_eq!(h[VEL_N], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h[WIND_N], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn crabbing_flight_has_sideslip() {
        let state = StateSample {
            quat_nominal: quat_from_euler(0.0, 0.0, 0.1),
            vel: Vector3f::new(20.0, 0.0, 0.0),
            ..Default::default()
        };
        // Nose 0.1 rad right of the track, so the air comes from the left.
        assert_abs_diff_eq!(sideslip_of(&state), -(0.1_f32).tan(), epsilon = 1e-5);
    }
}
