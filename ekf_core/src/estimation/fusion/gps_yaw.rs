// ekf_core/src/estimation/fusion/gps_yaw.rs

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::numeric_jacobian_angle;
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::quat_to_dcm;
use crate::types::{sq, wrap_pi, Vector3f};

/// Below this horizontal length of the unit antenna baseline in earth frame
/// the baseline heading is too poorly defined to use.
const MIN_BASELINE_HORIZONTAL: f32 = 0.5;

/// Earth frame heading of the antenna baseline, `None` when the baseline is
/// close to vertical.
pub(crate) fn antenna_heading(state: &StateSample, yaw_offset: f32) -> Option<f32> {
    let baseline_body = Vector3f::new(yaw_offset.cos(), yaw_offset.sin(), 0.0);
    let baseline_earth = quat_to_dcm(&state.quat_nominal) * baseline_body;
    (baseline_earth.xy().norm() >= MIN_BASELINE_HORIZONTAL)
        .then(|| baseline_earth[1].atan2(baseline_earth[0]))
}

impl Ekf {
    /// Fuses the heading reported by a dual antenna receiver. `gps_yaw` is
    /// the heading of the antenna baseline (rad).
    pub(crate) fn fuse_gps_ant_yaw(&mut self, gps_yaw: f32) -> bool {
        let offset = self.params.gps_yaw_offset;
        let state = self.store.state;
        let Some(predicted) = antenna_heading(&state, offset) else {
            return false;
        };

        let measured = wrap_pi(gps_yaw + offset);
        let obs_var = sq(self.params.gps_heading_noise.max(1e-2));
        let gate = self.params.heading_innov_gate.max(1.0);
        let result = self.fuse_axis_group([obs_var], gate, move |s, _| {
            let heading = |p: &StateSample| {
                antenna_heading(p, offset).unwrap_or(predicted)
            };
            let h = numeric_jacobian_angle(s, heading);
            (wrap_pi(measured - heading(s)), h)
        });

        self.innov.heading = result.innov[0];
        self.innov.heading_var = result.innov_var[0];
        self.innov.yaw_test_ratio = result.test_ratio[0];
        if result.accepted {
            self.innov_check_fail_status &= !innovation_fault::YAW;
        } else {
            self.innov_check_fail_status |= innovation_fault::YAW;
        }
        self.faults.bad_hdg = result.failed_axis.is_some();
        if result.fused() {
            self.timers.last_gps_yaw_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::quat_from_euler;
    use approx::assert_abs_diff_eq;

    #[test]
    fn antenna_heading_adds_the_baseline_offset() {
        let state = StateSample {
            quat_nominal: quat_from_euler(0.0, 0.0, 0.4),
            ..Default::default()
        };
        let heading = antenna_heading(&state, core::f32::consts::FRAC_PI_2);
        assert_abs_diff_eq!(heading.unwrap_or_default(), 0.4 + core::f32::consts::FRAC_PI_2, epsilon = 1e-5);
    }

    #[test]
    fn vertical_baseline_is_unusable() {
        let state = StateSample {
            quat_nominal: quat_from_euler(0.0, 1.5, 0.0),
            ..Default::default()
        };
        assert!(antenna_heading(&state, 0.0).is_none());
    }
}
