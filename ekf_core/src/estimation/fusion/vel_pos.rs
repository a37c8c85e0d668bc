// ekf_core/src/estimation/fusion/vel_pos.rs

use tracing::{debug, warn};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::{test_ratio, GroupFusion};
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::layout::{POS_D, POS_N, VEL_D, VEL_N};
use crate::types::{sq, StateVector};

/// Time bad vertical accelerometer data keeps being assumed after the last
/// detection (us).
const BAD_ACC_PROBATION_US: u64 = 10_000_000;

/// Directly measured components of the state, with their noise and gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisObservation<const N: usize> {
    pub measurement: [f32; N],
    pub obs_var: [f32; N],
    /// Gate size in standard deviations.
    pub gate: f32,
}

/// The velocity and position observations to fuse this cycle. Groups left
/// at `None` are not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelPosObservations {
    /// North/East velocity (m/s).
    pub hor_vel: Option<AxisObservation<2>>,
    /// Down velocity (m/s).
    pub vert_vel: Option<AxisObservation<1>>,
    /// North/East position (m).
    pub hor_pos: Option<AxisObservation<2>>,
    /// Down position (m).
    pub height: Option<AxisObservation<1>>,
}

/// Which groups made it into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VelPosFused {
    pub hor_vel: bool,
    pub vert_vel: bool,
    pub hor_pos: bool,
    pub height: bool,
}

/// Model of an observation of states `first..first + N`.
pub(crate) fn direct_observation<const N: usize>(
    first: usize,
    measured: [f32; N],
) -> impl Fn(&StateSample, usize) -> (f32, StateVector) {
    move |state, axis| {
        let index = first + axis;
        let mut h = StateVector::zeros();
        h[index] = 1.0;
        (measured[axis] - state.to_vector()[index], h)
    }
}

impl Ekf {
    /// Fuses the selected velocity, position and height observations,
    /// each group gated on its own.
    pub(crate) fn fuse_vel_pos_height(&mut self, obs: &VelPosObservations) -> VelPosFused {
        let now = self.imu_sample_delayed.time_us;
        let mut fused = VelPosFused::default();

        self.check_vertical_accel_health(obs);
        let vertical_gate = |gate: f32, bad_acc: bool| if bad_acc { f32::INFINITY } else { gate };

        if obs.hor_vel.is_some() || obs.vert_vel.is_some() {
            self.innov_check_fail_status &= !innovation_fault::VEL_NED;
        }

        if let Some(o) = obs.hor_vel {
            let result = self.fuse_axis_group(o.obs_var, o.gate, direct_observation(VEL_N, o.measurement));
            self.record_vel_pos(0, &result);
            self.faults.bad_vel_n = result.failed_axis == Some(0);
            self.faults.bad_vel_e = result.failed_axis == Some(1);
            if !result.accepted {
                self.innov_check_fail_status |= innovation_fault::VEL_NED;
            }
            fused.hor_vel = result.fused();
        }

        if let Some(o) = obs.vert_vel {
            let gate = vertical_gate(o.gate, self.bad_vert_accel_detected);
            let result = self.fuse_axis_group(o.obs_var, gate, direct_observation(VEL_D, o.measurement));
            self.record_vel_pos(2, &result);
            self.faults.bad_vel_d = result.failed_axis.is_some();
            if !result.accepted {
                self.innov_check_fail_status |= innovation_fault::VEL_NED;
            }
            fused.vert_vel = result.fused();
        }

        if let Some(o) = obs.hor_pos {
            self.innov_check_fail_status &= !innovation_fault::POS_NE;
            let result = self.fuse_axis_group(o.obs_var, o.gate, direct_observation(POS_N, o.measurement));
            self.record_vel_pos(3, &result);
            self.faults.bad_pos_n = result.failed_axis == Some(0);
            self.faults.bad_pos_e = result.failed_axis == Some(1);
            if !result.accepted {
                self.innov_check_fail_status |= innovation_fault::POS_NE;
                debug!(ratio = result.max_test_ratio(), "horizontal position rejected");
            }
            fused.hor_pos = result.fused();
        }

        if let Some(o) = obs.height {
            self.innov_check_fail_status &= !innovation_fault::POS_D;
            let gate = vertical_gate(o.gate, self.bad_vert_accel_detected);
            let result = self.fuse_axis_group(o.obs_var, gate, direct_observation(POS_D, o.measurement));
            self.record_vel_pos(5, &result);
            self.faults.bad_pos_d = result.failed_axis.is_some();
            if !result.accepted {
                self.innov_check_fail_status |= innovation_fault::POS_D;
            }
            fused.height = result.fused();
        }

        if fused.hor_vel || fused.vert_vel {
            self.timers.last_vel_fuse = now;
        }
        if fused.hor_pos {
            self.timers.last_pos_fuse = now;
        }
        if fused.height {
            self.timers.last_hgt_fuse = now;
        }
        fused
    }

    fn record_vel_pos<const N: usize>(&mut self, first: usize, result: &GroupFusion<N>) {
        for axis in 0..N {
            self.innov.vel_pos[first + axis] = result.innov[axis];
            self.innov.vel_pos_var[first + axis] = result.innov_var[axis];
            self.innov.vel_pos_test_ratio[first + axis] = result.test_ratio[axis];
        }
    }

    /// Declares the vertical accelerometer bad when the vertical velocity
    /// and height innovations both fail in the same direction, which an
    /// accelerometer offset produces and an independent sensor glitch
    /// rarely does.
    fn check_vertical_accel_health(&mut self, obs: &VelPosObservations) {
        let now = self.imu_sample_delayed.time_us;
        if let (Some(vel), Some(hgt)) = (obs.vert_vel, obs.height) {
            let vel_innov = vel.measurement[0] - self.store.state.vel[2];
            let hgt_innov = hgt.measurement[0] - self.store.state.pos[2];
            let mut h = StateVector::zeros();
            h[VEL_D] = 1.0;
            let vel_var = self.store.innovation_variance(&h, vel.obs_var[0]);
            h[VEL_D] = 0.0;
            h[POS_D] = 1.0;
            let hgt_var = self.store.innovation_variance(&h, hgt.obs_var[0]);

            let failing = test_ratio(vel_innov, vel_var, vel.gate) > 1.0
                && test_ratio(hgt_innov, hgt_var, hgt.gate) > 1.0;
            if failing && vel_innov * hgt_innov > 0.0 {
                if !self.bad_vert_accel_detected {
                    warn!("bad vertical accelerometer data detected");
                }
                self.bad_vert_accel_detected = true;
                self.time_bad_vert_accel = now;
            }
        }
        if self.bad_vert_accel_detected
            && now.saturating_sub(self.time_bad_vert_accel) > BAD_ACC_PROBATION_US
        {
            self.bad_vert_accel_detected = false;
        }
        self.faults.bad_acc_vertical = self.bad_vert_accel_detected;
    }

    /// Fuses a North/East velocity from an auxiliary source.
    pub(crate) fn fuse_aux_vel(&mut self, vel_ne: [f32; 2], vel_var_ne: [f32; 2]) -> bool {
        let obs_var = [
            vel_var_ne[0].max(sq(self.params.gps_vel_noise) * 0.01),
            vel_var_ne[1].max(sq(self.params.gps_vel_noise) * 0.01),
        ];
        let result = self.fuse_axis_group(
            obs_var,
            self.params.aux_vel_innov_gate,
            direct_observation(VEL_N, vel_ne),
        );
        self.innov.aux_vel = result.innov;
        self.innov.aux_vel_var = result.innov_var;
        self.innov.aux_vel_test_ratio = result.test_ratio;
        if result.accepted {
            self.innov_check_fail_status &= !innovation_fault::AUX_VEL;
        } else {
            self.innov_check_fail_status |= innovation_fault::AUX_VEL;
        }
        if result.fused() {
            self.timers.last_aux_vel_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }
}
