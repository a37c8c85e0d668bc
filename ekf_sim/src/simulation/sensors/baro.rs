// ekf_sim/src/simulation/sensors/baro.rs

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::messages::BaroSample;
use rand_distr::Normal;

use super::{Schedule, SensorContext, SimSensor};
use crate::errors::SimResult;
use crate::simulation::config::BaroConfig;
use crate::simulation::prng::{zero_mean, SimulationRng};

#[derive(Debug, Clone)]
pub struct BaroSim {
    schedule: Schedule,
    noise: Normal<f32>,
    offset: f32,
}

impl BaroSim {
    pub fn new(config: &BaroConfig) -> SimResult<Self> {
        Ok(Self {
            schedule: Schedule::from_rate(config.rate_hz),
            noise: zero_mean("baro", config.noise)?,
            offset: config.offset,
        })
    }
}

impl SimSensor for BaroSim {
    fn name(&self) -> &'static str {
        "baro"
    }

    fn schedule(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()> {
        let hgt = -ctx.truth.pos[2] + self.offset + rng.sample(&self.noise);
        ekf.set_baro_data(&BaroSample { time_us: ctx.time_us, hgt })
    }
}
