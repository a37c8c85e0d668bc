// ekf_core/src/estimation/fusion/mod.rs

//! Fusion engine: the shared scalar update and innovation gate, plus one
//! module per observation class.
//!
//! Every observation is fused as a sequence of scalar updates. A group of
//! axes (NE velocity, 3-axis field, flow XY, ...) is gated as a whole
//! before anything is touched; when one axis fails, the group is rejected
//! and the state and covariance stay exactly as they were.

pub mod airspeed;
pub mod drag;
pub mod gps_yaw;
pub mod mag;
pub mod optflow;
pub mod vel_pos;

use crate::estimation::ekf::Ekf;
use crate::estimation::state::{ActiveStates, StateSample};
use crate::params::fusion_mask;
use crate::types::{sq, wrap_pi, StateVector, NUM_STATES};

/// Perturbation used by [`numeric_jacobian`].
const JACOBIAN_STEP: f32 = 1e-3;

/// Latest innovation, innovation variance and test ratio of every
/// observation class.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Innovations {
    /// North, East, Down velocity then North, East, Down position.
    pub vel_pos: [f32; 6],
    pub vel_pos_var: [f32; 6],
    pub vel_pos_test_ratio: [f32; 6],
    pub aux_vel: [f32; 2],
    pub aux_vel_var: [f32; 2],
    pub aux_vel_test_ratio: [f32; 2],
    pub mag: [f32; 3],
    pub mag_var: [f32; 3],
    pub mag_test_ratio: [f32; 3],
    pub heading: f32,
    pub heading_var: f32,
    pub yaw_test_ratio: f32,
    pub airspeed: f32,
    pub airspeed_var: f32,
    pub tas_test_ratio: f32,
    pub beta: f32,
    pub beta_var: f32,
    pub beta_test_ratio: f32,
    pub flow: [f32; 2],
    pub flow_var: [f32; 2],
    pub flow_test_ratio: [f32; 2],
    pub drag: [f32; 2],
    pub drag_var: [f32; 2],
    pub drag_test_ratio: [f32; 2],
    pub hagl: f32,
    pub hagl_var: f32,
    pub hagl_test_ratio: f32,
}

/// Outcome of fusing a group of scalar observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupFusion<const N: usize> {
    /// Innovations evaluated against the state before the group was fused.
    pub innov: [f32; N],
    pub innov_var: [f32; N],
    pub test_ratio: [f32; N],
    /// Every axis passed the innovation gate.
    pub accepted: bool,
    /// Set for the first axis whose innovation variance or covariance
    /// update was numerically unusable.
    pub failed_axis: Option<usize>,
}

impl<const N: usize> GroupFusion<N> {
    /// True when the whole group made it into the state.
    pub fn fused(&self) -> bool {
        self.accepted && self.failed_axis.is_none()
    }

    /// Largest test ratio across the group.
    pub fn max_test_ratio(&self) -> f32 {
        self.test_ratio.iter().fold(0.0, |acc, r| acc.max(*r))
    }
}

/// Normalised innovation squared against a gate of `gate` standard
/// deviations. The observation passes when the ratio is at most one.
pub fn test_ratio(innovation: f32, innov_var: f32, gate: f32) -> f32 {
    sq(innovation) / (sq(gate) * innov_var)
}

/// Central difference Jacobian of a scalar measurement model with respect
/// to the 24 states. Quaternion components are perturbed without
/// renormalising, matching the homogeneous rotation used by the models.
pub fn numeric_jacobian<F>(state: &StateSample, model: F) -> StateVector
where
    F: Fn(&StateSample) -> f32,
{
    let x = state.to_vector();
    let mut h = StateVector::zeros();
    for i in 0..NUM_STATES {
        let mut plus = x;
        let mut minus = x;
        plus[i] += JACOBIAN_STEP;
        minus[i] -= JACOBIAN_STEP;
        let f_plus = model(&StateSample::from_vector(&plus));
        let f_minus = model(&StateSample::from_vector(&minus));
        h[i] = (f_plus - f_minus) / (2.0 * JACOBIAN_STEP);
    }
    h
}

/// [`numeric_jacobian`] for models returning an angle, with differences
/// wrapped so the derivative stays finite across the +/- pi seam.
pub fn numeric_jacobian_angle<F>(state: &StateSample, model: F) -> StateVector
where
    F: Fn(&StateSample) -> f32,
{
    let x = state.to_vector();
    let mut h = StateVector::zeros();
    for i in 0..NUM_STATES {
        let mut plus = x;
        let mut minus = x;
        plus[i] += JACOBIAN_STEP;
        minus[i] -= JACOBIAN_STEP;
        let diff = wrap_pi(
            model(&StateSample::from_vector(&plus)) - model(&StateSample::from_vector(&minus)),
        );
        h[i] = diff / (2.0 * JACOBIAN_STEP);
    }
    h
}

impl Ekf {
    /// Optional state blocks that may currently receive gain.
    pub(crate) fn active_states(&self) -> ActiveStates {
        ActiveStates {
            accel_bias: !self.accel_bias_inhibit,
            mag_field: self.control.mag_3d,
            wind: self.control.wind,
        }
    }

    /// One scalar Kalman update with a precomputed innovation variance.
    ///
    /// Returns `false`, leaving state and covariance untouched, when the
    /// covariance update would drive a variance negative.
    pub(crate) fn fuse_scalar(&mut self, h: &StateVector, innovation: f32, innov_var: f32) -> bool {
        let active = self.active_states();
        let gain = self.store.kalman_gain(h, innov_var, &active);
        if !self.store.update_covariance(&gain, h) {
            return false;
        }
        self.store.fuse(&gain, innovation);
        self.condition_after_fusion();
        true
    }

    /// Restores the covariance and state invariants after a raw update.
    pub(crate) fn condition_after_fusion(&mut self) {
        let active = self.active_states();
        self.store.fix_covariance_errors(&active, self.dt_ekf_avg);
        self.store
            .constrain_states(self.dt_ekf_avg, self.params.acc_bias_lim);
    }

    /// Gates and then sequentially fuses `N` scalar observations.
    ///
    /// `model(state, axis)` returns the innovation (measured minus
    /// predicted) and the Jacobian row of axis `axis` against `state`. The
    /// gate is evaluated for all axes against the current state first; if
    /// any axis fails nothing is fused. Accepted axes are then fused in order,
    /// re-evaluating the model after each update so later axes see the
    /// corrected state and covariance.
    pub(crate) fn fuse_axis_group<const N: usize, F>(
        &mut self,
        obs_var: [f32; N],
        gate: f32,
        model: F,
    ) -> GroupFusion<N>
    where
        F: Fn(&StateSample, usize) -> (f32, StateVector),
    {
        let mut result = GroupFusion {
            innov: [0.0; N],
            innov_var: [0.0; N],
            test_ratio: [0.0; N],
            accepted: false,
            failed_axis: None,
        };

        for axis in 0..N {
            let (innov, h) = model(&self.store.state, axis);
            let innov_var = self.store.innovation_variance(&h, obs_var[axis]);
            result.innov[axis] = innov;
            result.innov_var[axis] = innov_var;
            if !(innov_var >= obs_var[axis]) || !innov.is_finite() {
                result.failed_axis = Some(axis);
                return result;
            }
            result.test_ratio[axis] = test_ratio(innov, innov_var, gate);
        }

        result.accepted = result.test_ratio.iter().all(|r| *r <= 1.0);
        if !result.accepted {
            return result;
        }

        for axis in 0..N {
            let (innov, h) = model(&self.store.state, axis);
            let innov_var = self.store.innovation_variance(&h, obs_var[axis]);
            if !(innov_var >= obs_var[axis]) || !self.fuse_scalar(&h, innov, innov_var) {
                result.failed_axis = Some(axis);
                break;
            }
        }
        result
    }

    /// Whether drag fusion is selected and the vehicle is a multirotor.
    pub(crate) fn drag_fusion_selected(&self) -> bool {
        self.params.uses(fusion_mask::USE_DRAG) && !self.control.fixed_wing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::layout::{POS_N, VEL_E};
    use approx::assert_abs_diff_eq;

    #[test]
    fn numeric_jacobian_of_linear_model_is_exact() {
        let state = StateSample::default();
        let h = numeric_jacobian(&state, |s| 2.0 * s.pos[0] - s.vel[1]);
        assert_abs_diff_eq!(h[POS_N], 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(h[VEL_E], -1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(h.sum(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_ratio_is_one_at_the_gate() {
        assert_abs_diff_eq!(test_ratio(3.0, 1.0, 3.0), 1.0);
        assert!(test_ratio(3.1, 1.0, 3.0) > 1.0);
    }

    fn ekf() -> Ekf {
        let mut ekf = Ekf::new(crate::params::EkfParams::default()).expect("default parameters are valid");
        ekf.store.set_diag(POS_N..POS_N + 3, 1.0);
        ekf
    }

    fn position_axis(measured: [f32; 2]) -> impl Fn(&StateSample, usize) -> (f32, StateVector) {
        move |state, axis| {
            let mut h = StateVector::zeros();
            h[POS_N + axis] = 1.0;
            (measured[axis] - state.pos[axis], h)
        }
    }

    #[test]
    fn rejected_group_leaves_the_filter_untouched() {
        let mut ekf = ekf();
        let before = ekf.store.clone();
        // The second axis fails its gate, so neither axis may be fused.
        let result = ekf.fuse_axis_group([0.25; 2], 3.0, position_axis([0.5, 50.0]));
        assert!(!result.accepted);
        assert!(result.test_ratio[1] > 1.0);
        assert_eq!(ekf.store, before);
    }

    #[test]
    fn accepted_group_moves_the_state() {
        let mut ekf = ekf();
        let result = ekf.fuse_axis_group([0.25; 2], 3.0, position_axis([0.5, -0.5]));
        assert!(result.fused());
        assert!(ekf.store.state.pos[0] > 0.3);
        assert!(ekf.store.state.pos[1] < -0.3);
        assert!(ekf.store.p[(POS_N, POS_N)] < 1.0);
    }

    #[test]
    fn group_helpers() {
        let group = GroupFusion {
            innov: [0.0; 2],
            innov_var: [1.0; 2],
            test_ratio: [0.2, 0.7],
            accepted: true,
            failed_axis: None,
        };
        assert!(group.fused());
        assert_abs_diff_eq!(group.max_test_ratio(), 0.7);
    }
}
