// ekf_core/src/estimation/fusion/drag.rs

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::airspeed::air_relative_velocity;
use crate::estimation::fusion::numeric_jacobian;
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::quat_to_dcm;
use crate::types::{sq, Vector2f};

/// Gate applied to each drag axis (SD).
const DRAG_INNOV_GATE: f32 = 5.0;

/// Ballistic coefficients below this are treated as drag fusion disabled
/// (kg/m^2).
const MIN_BALLISTIC_COEF: f32 = 1.0;

/// Specific force along body X and Y predicted from bluff body drag,
/// `-0.5 rho v |v| / BC` on each axis.
pub(crate) fn predicted_drag(state: &StateSample, air_density: f32, bcoef: [f32; 2]) -> Vector2f {
    let rel_body = quat_to_dcm(&state.quat_nominal).transpose() * air_relative_velocity(state);
    Vector2f::new(
        -0.5 * air_density * rel_body[0] * rel_body[0].abs() / bcoef[0],
        -0.5 * air_density * rel_body[1] * rel_body[1].abs() / bcoef[1],
    )
}

impl Ekf {
    /// Fuses the body X and Y specific force of a multirotor as drag, which
    /// makes the wind observable without airspeed.
    pub(crate) fn fuse_drag(&mut self, measured: &Vector2f) -> bool {
        let bcoef = [self.params.bcoef_x, self.params.bcoef_y];
        if bcoef.iter().any(|bc| *bc < MIN_BALLISTIC_COEF) {
            return false;
        }

        let rho = self.air_density;
        let measured = *measured;
        let obs_var = [sq(self.params.drag_noise.max(0.5)); 2];
        let result = self.fuse_axis_group(obs_var, DRAG_INNOV_GATE, move |s, axis| {
            let predicted = predicted_drag(s, rho, bcoef)[axis];
            let h = numeric_jacobian(s, |p| predicted_drag(p, rho, bcoef)[axis]);
            (measured[axis] - predicted, h)
        });

        self.innov.drag = result.innov;
        self.innov.drag_var = result.innov_var;
        self.innov.drag_test_ratio = result.test_ratio;
        self.faults.bad_drag_x = result.failed_axis == Some(0);
        self.faults.bad_drag_y = result.failed_axis == Some(1);
        for (axis, bit) in [innovation_fault::DRAG_X, innovation_fault::DRAG_Y].into_iter().enumerate() {
            if result.test_ratio[axis] > 1.0 {
                self.innov_check_fail_status |= bit;
            } else {
                self.innov_check_fail_status &= !bit;
            }
        }
        if result.fused() {
            self.timers.last_drag_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vector3f;
    use approx::assert_abs_diff_eq;

    #[test]
    fn drag_opposes_relative_wind() {
        let state = StateSample {
            vel: Vector3f::new(5.0, -2.0, 0.0),
            ..Default::default()
        };
        let drag = predicted_drag(&state, 1.225, [25.0, 25.0]);
        assert!(drag[0] < 0.0);
        assert!(drag[1] > 0.0);
        assert_abs_diff_eq!(drag[0], -0.5 * 1.225 * 25.0 / 25.0, epsilon = 1e-5);
    }
}
