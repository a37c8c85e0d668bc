// ekf_sim/src/simulation/sensors/mod.rs

//! Synthetic sensors. Each one samples the truth on its own schedule, adds
//! noise from the shared generator and hands the result to the filter.

pub mod airspeed;
pub mod baro;
pub mod gps;
pub mod imu;
pub mod magnetometer;
pub mod range;

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::types::TimeUs;

use crate::errors::SimResult;
use crate::simulation::config::{ScenarioConfig, WorldSection};
use crate::simulation::prng::SimulationRng;
use crate::simulation::trajectory::TruthSample;

/// Fixed rate trigger in the simulation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    interval_us: u64,
    next_us: TimeUs,
}

impl Schedule {
    pub fn from_rate(rate_hz: f32) -> Self {
        Self {
            interval_us: (1e6 / rate_hz).round().max(1.0) as u64,
            next_us: 0,
        }
    }

    pub fn interval_us(&self) -> u64 {
        self.interval_us
    }

    /// True once per interval, at the first call at or after each due time.
    pub fn due(&mut self, now_us: TimeUs) -> bool {
        if now_us < self.next_us {
            return false;
        }
        self.next_us = (self.next_us + self.interval_us).max(now_us + 1);
        true
    }
}

/// What a sensor sees at one instant.
#[derive(Debug, Clone, Copy)]
pub struct SensorContext<'a> {
    pub time_us: TimeUs,
    pub truth: &'a TruthSample,
    pub world: &'a WorldSection,
}

impl SensorContext<'_> {
    pub fn time_s(&self) -> f32 {
        self.time_us as f32 * 1e-6
    }
}

/// A sensor other than the IMU.
pub trait SimSensor: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn schedule(&mut self) -> &mut Schedule;

    /// Measures the truth and pushes the sample into the filter.
    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()>;
}

/// Builds every sensor the scenario enables.
pub fn build_sensors(config: &ScenarioConfig) -> SimResult<Vec<Box<dyn SimSensor>>> {
    let s = &config.sensors;
    let mut sensors: Vec<Box<dyn SimSensor>> = Vec::new();
    if s.mag.enabled {
        sensors.push(Box::new(magnetometer::MagSim::new(&s.mag)?));
    }
    if s.baro.enabled {
        sensors.push(Box::new(baro::BaroSim::new(&s.baro)?));
    }
    if s.gps.enabled {
        sensors.push(Box::new(gps::GpsSim::new(&s.gps, &config.world)?));
    }
    if s.range.enabled {
        sensors.push(Box::new(range::RangeSim::new(&s.range)?));
    }
    if s.airspeed.enabled {
        sensors.push(Box::new(airspeed::AirspeedSim::new(&s.airspeed)?));
    }
    Ok(sensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_fires_once_per_interval() {
        let mut schedule = Schedule::from_rate(50.0);
        assert_eq!(schedule.interval_us(), 20_000);
        let fired: Vec<TimeUs> = (0..25)
            .map(|i| i * 4_000)
            .filter(|t| schedule.due(*t))
            .collect();
        assert_eq!(fired, vec![0, 20_000, 40_000, 60_000, 80_000]);
    }

    #[test]
    fn default_scenario_builds_mag_baro_and_gps() {
        let sensors = build_sensors(&ScenarioConfig::default()).expect("valid noise");
        let names: Vec<_> = sensors.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["mag", "baro", "gps"]);
    }
}
