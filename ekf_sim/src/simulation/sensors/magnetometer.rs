// ekf_sim/src/simulation/sensors/magnetometer.rs

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::messages::MagSample;
use ekf_core::types::Vector3f;
use rand_distr::Normal;

use super::{Schedule, SensorContext, SimSensor};
use crate::errors::SimResult;
use crate::simulation::config::MagConfig;
use crate::simulation::prng::{zero_mean, SimulationRng};

#[derive(Debug, Clone)]
pub struct MagSim {
    schedule: Schedule,
    noise: Normal<f32>,
    bias: Vector3f,
}

impl MagSim {
    pub fn new(config: &MagConfig) -> SimResult<Self> {
        Ok(Self {
            schedule: Schedule::from_rate(config.rate_hz),
            noise: zero_mean("mag", config.noise)?,
            bias: Vector3f::from(config.bias),
        })
    }
}

impl SimSensor for MagSim {
    fn name(&self) -> &'static str {
        "mag"
    }

    fn schedule(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()> {
        let field_earth = Vector3f::from(ctx.world.mag_field_ned);
        let mag = ctx.truth.body_to_earth().transpose() * field_earth + self.bias + rng.vector3(&self.noise);
        ekf.set_mag_data(&MagSample { time_us: ctx.time_us, mag })
    }
}
