// ekf_sim/src/simulation/sensors/airspeed.rs

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::messages::AirspeedSample;
use ekf_core::types::Vector2f;
use rand_distr::Normal;

use super::{Schedule, SensorContext, SimSensor};
use crate::errors::SimResult;
use crate::simulation::config::AirspeedConfig;
use crate::simulation::prng::{zero_mean, SimulationRng};

#[derive(Debug, Clone)]
pub struct AirspeedSim {
    schedule: Schedule,
    noise: Normal<f32>,
}

impl AirspeedSim {
    pub fn new(config: &AirspeedConfig) -> SimResult<Self> {
        Ok(Self {
            schedule: Schedule::from_rate(config.rate_hz),
            noise: zero_mean("airspeed", config.noise)?,
        })
    }
}

impl SimSensor for AirspeedSim {
    fn name(&self) -> &'static str {
        "airspeed"
    }

    fn schedule(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()> {
        let wind = Vector2f::from(ctx.world.wind_ne);
        let relative = ctx.truth.vel.xy() - wind;
        let true_airspeed = (relative.norm() + rng.sample(&self.noise)).max(0.0);
        ekf.set_airspeed_data(&AirspeedSample {
            time_us: ctx.time_us,
            true_airspeed,
            eas2tas: 1.0,
        })
    }
}
