// ekf_core/src/estimation/fusion/optflow.rs

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::numeric_jacobian;
use crate::estimation::state::StateSample;
use crate::estimation::status::innovation_fault;
use crate::frames::quat_to_dcm;
use crate::messages::FlowSample;
use crate::types::{constrain, sq, TimeUs, Vector2f, Vector3f};

/// Lower bound on the flow observation noise (rad/s).
const MIN_FLOW_NOISE: f32 = 0.05;

/// Optical flow bookkeeping: the sensor gyro bias learned against the IMU,
/// the IMU rotation accumulated over the current flow period, and the
/// limits the host sets for the sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowState {
    /// Flow sensor gyro bias relative to the IMU (rad/s).
    pub gyro_bias: Vector3f,
    /// Bias corrected IMU delta angle since the last flow sample (rad).
    pub imu_del_ang: Vector3f,
    pub imu_delta_time: f32,
    /// Flow with the body rotation removed (rad).
    pub compensated_xy: Vector2f,
    /// Sensor limits set by the host.
    pub max_rate: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    /// Flow use is inhibited because motion is excessive or the vehicle is
    /// at rest on the ground.
    pub inhibit_use: bool,
    pub time_bad_motion_us: TimeUs,
    pub time_good_motion_us: TimeUs,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            gyro_bias: Vector3f::zeros(),
            imu_del_ang: Vector3f::zeros(),
            imu_delta_time: 0.0,
            compensated_xy: Vector2f::zeros(),
            max_rate: 2.5,
            min_distance: 0.0,
            max_distance: 20.0,
            inhibit_use: false,
            time_bad_motion_us: 0,
            time_good_motion_us: 0,
        }
    }
}

/// Inputs to the flow measurement model that are not states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FlowGeometry {
    /// Vertical position of the terrain (m, NED).
    pub terrain_vpos: f32,
    pub gnd_clearance: f32,
    /// Sensor position relative to the IMU, body frame (m).
    pub pos_offset_body: Vector3f,
    /// Sensor velocity caused by body rotation, body frame (m/s).
    pub vel_rel_imu_body: Vector3f,
}

/// Line of sight rates about the sensor X and Y axes for the given state.
/// Positive rates are right handed rotations of the scene.
pub(crate) fn predicted_los_rate(state: &StateSample, geom: &FlowGeometry) -> Vector2f {
    let r = quat_to_dcm(&state.quat_nominal);
    let vel_earth = state.vel + r * geom.vel_rel_imu_body;
    let vel_body = r.transpose() * vel_earth;

    let pos_offset_earth = r * geom.pos_offset_body;
    let height = (geom.terrain_vpos - state.pos[2]).max(geom.gnd_clearance) - pos_offset_earth[2];
    let height = height.max(geom.gnd_clearance);
    let range = height / r[(2, 2)].max(0.1);

    Vector2f::new(vel_body[1] / range, -vel_body[0] / range)
}

impl Ekf {
    /// Observation noise variance of a flow sample, interpolated between the
    /// best and worst noise across the usable quality range.
    pub(crate) fn calc_opt_flow_meas_var(&self, quality: u8) -> f32 {
        let best = self.params.flow_noise.max(MIN_FLOW_NOISE);
        let worst = self.params.flow_noise_qual_min.max(MIN_FLOW_NOISE);
        let span = 255.0 - f32::from(self.params.flow_qual_min);
        let weighting = if span >= 1.0 {
            constrain(
                (f32::from(quality) - f32::from(self.params.flow_qual_min)) / span,
                0.0,
                1.0,
            )
        } else {
            0.0
        };
        sq(best * weighting + worst * (1.0 - weighting))
    }

    /// Learns the flow sensor gyro bias against the IMU rotation accumulated
    /// over the flow period and removes body rotation from the flow.
    pub(crate) fn calc_opt_flow_body_rate_comp(&mut self, sample: &mut FlowSample) {
        let flow = &mut self.flow;
        if flow.imu_delta_time > 0.01 && sample.dt > 0.0 && flow.imu_del_ang.norm() > 0.0 {
            let reference_rate = flow.imu_del_ang / flow.imu_delta_time;
            let measured_rate = sample.gyro_xyz / sample.dt;
            let error = (measured_rate - reference_rate).map(|e| constrain(e, -0.1, 0.1));
            flow.gyro_bias = flow.gyro_bias * 0.99 + error * 0.01;
        }
        flow.imu_del_ang = Vector3f::zeros();
        flow.imu_delta_time = 0.0;

        sample.gyro_xyz -= flow.gyro_bias * sample.dt;
        flow.compensated_xy = sample.flow_xy_rad - sample.gyro_xyz.xy();
    }

    /// Fuses the compensated line of sight rates of one flow sample.
    pub(crate) fn fuse_opt_flow(&mut self, sample: &FlowSample) -> bool {
        if sample.dt <= 0.0 {
            return false;
        }
        let pos_offset_body = self.params.flow_pos_body - self.params.imu_pos_body;
        let geom = FlowGeometry {
            terrain_vpos: self.terrain.vpos(),
            gnd_clearance: self.params.rng_gnd_clearance,
            pos_offset_body,
            vel_rel_imu_body: (sample.gyro_xyz / sample.dt).cross(&pos_offset_body),
        };
        let measured = self.flow.compensated_xy / sample.dt;
        let obs_var = [self.calc_opt_flow_meas_var(sample.quality); 2];

        let result = self.fuse_axis_group(obs_var, self.params.flow_innov_gate, move |s, axis| {
            let predicted = predicted_los_rate(s, &geom)[axis];
            let h = numeric_jacobian(s, |p| predicted_los_rate(p, &geom)[axis]);
            (measured[axis] - predicted, h)
        });

        self.innov.flow = result.innov;
        self.innov.flow_var = result.innov_var;
        self.innov.flow_test_ratio = result.test_ratio;
        self.faults.bad_optflow_x = result.failed_axis == Some(0);
        self.faults.bad_optflow_y = result.failed_axis == Some(1);
        for (axis, bit) in [innovation_fault::OPTFLOW_X, innovation_fault::OPTFLOW_Y]
            .into_iter()
            .enumerate()
        {
            if result.test_ratio[axis] > 1.0 {
                self.innov_check_fail_status |= bit;
            } else {
                self.innov_check_fail_status &= !bit;
            }
        }
        if result.fused() {
            self.timers.last_of_fuse = self.imu_sample_delayed.time_us;
        }
        result.fused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn forward_flight_produces_negative_y_rate() {
        let state = StateSample {
            vel: Vector3f::new(2.0, 0.0, 0.0),
            pos: Vector3f::new(0.0, 0.0, -4.0),
            ..Default::default()
        };
        let geom = FlowGeometry {
            terrain_vpos: 0.0,
            gnd_clearance: 0.1,
            pos_offset_body: Vector3f::zeros(),
            vel_rel_imu_body: Vector3f::zeros(),
        };
        let los = predicted_los_rate(&state, &geom);
        assert_abs_diff_eq!(los[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(los[1], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn height_is_floored_at_ground_clearance() {
        let state = StateSample {
            vel: Vector3f::new(0.0, 1.0, 0.0),
            pos: Vector3f::new(0.0, 0.0, 1.0),
            ..Default::default()
        };
        let geom = FlowGeometry {
            terrain_vpos: 0.0,
            gnd_clearance: 0.5,
            pos_offset_body: Vector3f::zeros(),
            vel_rel_imu_body: Vector3f::zeros(),
        };
        assert_abs_diff_eq!(predicted_los_rate(&state, &geom)[0], 2.0, epsilon = 1e-6);
    }
}
