// ekf_sim/src/simulation/sensors/range.rs

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::messages::RangeSample;
use rand_distr::Normal;

use super::{Schedule, SensorContext, SimSensor};
use crate::errors::SimResult;
use crate::simulation::config::RangeConfig;
use crate::simulation::prng::{zero_mean, SimulationRng};

/// Downward range finder over flat ground at the origin height.
#[derive(Debug, Clone)]
pub struct RangeSim {
    schedule: Schedule,
    noise: Normal<f32>,
    min_distance: f32,
    max_distance: f32,
}

impl RangeSim {
    pub fn new(config: &RangeConfig) -> SimResult<Self> {
        Ok(Self {
            schedule: Schedule::from_rate(config.rate_hz),
            noise: zero_mean("range", config.noise)?,
            min_distance: config.min_distance,
            max_distance: config.max_distance,
        })
    }
}

impl SimSensor for RangeSim {
    fn name(&self) -> &'static str {
        "range"
    }

    fn schedule(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()> {
        // The vehicle is kept level, so the beam length is the height.
        let height = -ctx.truth.pos[2] + rng.sample(&self.noise);
        let rng_m = height.clamp(self.min_distance, self.max_distance);
        ekf.set_range_data(&RangeSample { time_us: ctx.time_us, rng: rng_m })
    }
}
