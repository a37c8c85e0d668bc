// ekf_core/src/estimation/control/air_data.rs

//! Wind estimation from airspeed, synthetic sideslip and multirotor drag.

use tracing::{debug, info};

use crate::estimation::ekf::Ekf;
use crate::messages::ImuSample;
use crate::types::{elapsed_us, TimeUs, Vector2f, Vector3f};

/// Interval between synthetic sideslip observations (us).
const BETA_FUSION_INTERVAL_US: u64 = 150_000;

/// Specific force is averaged over this long before each drag fusion (s).
const DRAG_SAMPLE_PERIOD: f32 = 0.1;

/// Accumulates bias-corrected specific force for drag fusion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct DragSampler {
    del_vel_sum: Vector3f,
    time_sum: f32,
}

impl DragSampler {
    /// Adds one delayed IMU sample. Returns the mean body X/Y specific force
    /// once enough time has been collected.
    pub fn accumulate(&mut self, imu: &ImuSample, dvel_bias: &Vector3f) -> Option<Vector2f> {
        if imu.delta_vel_dt <= 0.0 {
            return None;
        }
        self.del_vel_sum += imu.delta_vel - dvel_bias;
        self.time_sum += imu.delta_vel_dt;
        if self.time_sum < DRAG_SAMPLE_PERIOD {
            return None;
        }
        let mean = self.del_vel_sum / self.time_sum;
        *self = Self::default();
        Some(Vector2f::new(mean[0], mean[1]))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl Ekf {
    /// Starts, stops and fuses true airspeed.
    pub(crate) fn control_air_data_fusion(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let airspeed_timed_out =
            elapsed_us(now, self.timers.last_arsp_fuse) > self.params.valid_timeout_max;
        let sideslip_timed_out =
            elapsed_us(now, self.timers.last_beta_fuse) > self.params.valid_timeout_max;

        if self.control.fuse_aspd && airspeed_timed_out {
            self.control.fuse_aspd = false;
            debug!("airspeed fusion timeout");
        }

        // Wind is unobservable on the ground and without any air data.
        if self.control.wind
            && (!self.control.in_air
                || (airspeed_timed_out && sideslip_timed_out && !self.control.fuse_drag))
        {
            self.stop_wind_estimation();
        }

        if !(self.delayed.tas_ready && self.control.in_air && self.control.fixed_wing) {
            return;
        }
        if !self.control.wind {
            self.start_wind_estimation();
        }
        let sample = self.delayed.airspeed;
        if self.fuse_airspeed(&sample) {
            self.control.fuse_aspd = true;
        }
    }

    /// Fuses zero sideslip on fixed wing vehicles in flight at a fixed rate.
    pub(crate) fn control_beta_fusion(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        self.control.fuse_beta = self.control.fixed_wing && self.control.in_air;
        if !self.control.fuse_beta {
            return;
        }
        if elapsed_us(now, self.timers.last_beta_fuse) < BETA_FUSION_INTERVAL_US {
            return;
        }
        if !self.control.wind {
            self.start_wind_estimation();
        }
        // The timer also throttles rejected observations.
        if !self.fuse_sideslip() {
            self.timers.last_beta_fuse = now;
        }
    }

    /// Fuses the drag specific force of a multirotor in flight.
    pub(crate) fn control_drag_fusion(&mut self) {
        self.control.fuse_drag = self.drag_fusion_selected() && self.control.in_air;
        if !self.control.fuse_drag {
            self.drag_sampler.clear();
            return;
        }
        if !self.control.wind {
            self.start_wind_estimation();
        }
        let imu = self.imu_sample_delayed;
        let bias = self.store.state.delta_vel_bias;
        if let Some(specific_force) = self.drag_sampler.accumulate(&imu, &bias) {
            self.fuse_drag(&specific_force);
        }
    }

    fn start_wind_estimation(&mut self) {
        self.control.wind = true;
        self.reset_wind_states();
        let now: TimeUs = self.imu_sample_delayed.time_us;
        self.timers.last_arsp_fuse = now;
        self.timers.last_beta_fuse = now;
        info!("starting wind estimation");
    }

    fn stop_wind_estimation(&mut self) {
        self.control.wind = false;
        self.control.fuse_aspd = false;
        info!("wind estimation stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn imu(dvel: Vector3f, dt: f32) -> ImuSample {
        ImuSample {
            delta_vel: dvel,
            delta_vel_dt: dt,
            delta_ang_dt: dt,
            ..Default::default()
        }
    }

    #[test]
    fn drag_sampler_averages_over_the_period() {
        let mut sampler = DragSampler::default();
        let bias = Vector3f::new(0.001, 0.0, 0.0);
        let sample = imu(Vector3f::new(0.011, -0.02, -0.098), 0.01);
        let force = (0..20)
            .find_map(|_| sampler.accumulate(&sample, &bias))
            .expect("sample after 0.1 s");
        assert_abs_diff_eq!(force[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(force[1], -2.0, epsilon = 1e-3);
        assert_eq!(sampler, DragSampler::default());
    }

    #[test]
    fn drag_sampler_ignores_zero_interval() {
        let mut sampler = DragSampler::default();
        assert!(sampler.accumulate(&imu(Vector3f::x(), 0.0), &Vector3f::zeros()).is_none());
        assert_eq!(sampler, DragSampler::default());
    }
}
