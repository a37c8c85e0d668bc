// ekf_sim/src/simulation/sensors/imu.rs

use ekf_core::messages::ImuSample;
use ekf_core::types::{TimeUs, Vector3f};
use rand_distr::Normal;

use crate::errors::SimResult;
use crate::simulation::config::ImuConfig;
use crate::simulation::prng::{zero_mean, SimulationRng};
use crate::simulation::trajectory::TruthSample;

/// Integrating gyro and accelerometer with white noise and constant biases.
#[derive(Debug, Clone)]
pub struct ImuSim {
    gyro_noise: Normal<f32>,
    accel_noise: Normal<f32>,
    gyro_bias: Vector3f,
    accel_bias: Vector3f,
}

impl ImuSim {
    pub fn new(config: &ImuConfig) -> SimResult<Self> {
        Ok(Self {
            gyro_noise: zero_mean("gyro", config.gyro_noise)?,
            accel_noise: zero_mean("accelerometer", config.accel_noise)?,
            gyro_bias: Vector3f::from(config.gyro_bias),
            accel_bias: Vector3f::from(config.accel_bias),
        })
    }

    /// Delta angle and delta velocity over `dt` ending at `time_us`, using
    /// the truth at the middle of the interval.
    pub fn sample(
        &self,
        truth_mid: &TruthSample,
        dt: f32,
        time_us: TimeUs,
        rng: &mut SimulationRng,
    ) -> ImuSample {
        let rate = truth_mid.body_rate() + self.gyro_bias + rng.vector3(&self.gyro_noise);
        let force = truth_mid.specific_force_body() + self.accel_bias + rng.vector3(&self.accel_noise);
        ImuSample {
            delta_ang: rate * dt,
            delta_vel: force * dt,
            delta_ang_dt: dt,
            delta_vel_dt: dt,
            time_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::trajectory::TrajectoryConfig;
    use approx::assert_abs_diff_eq;
    use ekf_core::types::GRAVITY;

    #[test]
    fn noiseless_imu_at_rest_measures_gravity() {
        let config = ImuConfig {
            gyro_noise: 0.0,
            accel_noise: 0.0,
            gyro_bias: [0.0, 0.0, 0.01],
            ..Default::default()
        };
        let imu = ImuSim::new(&config).expect("valid noise");
        let truth = TrajectoryConfig::default().sample(0.0);
        let sample = imu.sample(&truth, 0.004, 4_000, &mut SimulationRng::from_seed(0));
        assert_abs_diff_eq!(sample.delta_vel[2], -GRAVITY * 0.004, epsilon = 1e-6);
        assert_abs_diff_eq!(sample.delta_ang[2], 0.01 * 0.004, epsilon = 1e-9);
        assert_eq!(sample.time_us, 4_000);
    }
}
