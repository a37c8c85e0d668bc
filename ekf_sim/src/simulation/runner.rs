// ekf_sim/src/simulation/runner.rs

//! Drives one filter through a scenario and scores it against the truth.

use ekf_core::estimation::reset::ResetStatus;
use ekf_core::estimation::Ekf;
use ekf_core::frames::geo::MapProjection;
use ekf_core::frames::{quat_to_dcm, yaw_from_dcm};
use ekf_core::types::{wrap_pi, TimeUs, Vector3f};
use tracing::{debug, info, warn};

use crate::errors::SimResult;
use crate::simulation::config::ScenarioConfig;
use crate::simulation::prng::SimulationRng;
use crate::simulation::sensors::imu::ImuSim;
use crate::simulation::sensors::{build_sensors, SensorContext, SimSensor};
use crate::simulation::trajectory::TruthSample;

/// Difference between the real-time solution and the truth.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackingError {
    pub horiz_m: f32,
    pub vert_m: f32,
    pub vel_m_s: f32,
    pub yaw_deg: f32,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub seed: u64,
    pub duration_s: f32,
    pub filter_updates: u64,
    pub initialised_at_s: Option<f32>,
    pub gps_fusion_at_s: Option<f32>,
    pub final_error: TrackingError,
    /// Largest horizontal error after initialisation (m).
    pub max_horiz_error_m: f32,
    pub resets: ResetStatus,
    pub solution_status: u16,
    pub control_status: u32,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            seed = self.seed,
            duration_s = self.duration_s,
            updates = self.filter_updates,
            initialised_at_s = ?self.initialised_at_s,
            gps_fusion_at_s = ?self.gps_fusion_at_s,
            "run complete"
        );
        info!(
            horiz_m = self.final_error.horiz_m,
            vert_m = self.final_error.vert_m,
            vel_m_s = self.final_error.vel_m_s,
            yaw_deg = self.final_error.yaw_deg,
            max_horiz_m = self.max_horiz_error_m,
            "final tracking error"
        );
        info!(
            vel_ne = self.resets.vel_ne_counter,
            vel_d = self.resets.vel_d_counter,
            pos_ne = self.resets.pos_ne_counter,
            pos_d = self.resets.pos_d_counter,
            yaw = self.resets.quat_counter,
            solution_status = %format!("{:#06x}", self.solution_status),
            control_status = %format!("{:#010x}", self.control_status),
            "filter status"
        );
    }
}

/// A filter, its sensors and the simulated vehicle.
#[derive(Debug)]
pub struct Simulation {
    config: ScenarioConfig,
    ekf: Ekf,
    imu: ImuSim,
    sensors: Vec<Box<dyn SimSensor>>,
    rng: SimulationRng,
    time_us: TimeUs,
    imu_interval_us: u64,
    /// Projection of the scenario's local frame.
    world_origin: MapProjection,
    /// Truth when the filter initialised; anchors the filter frame until
    /// it has a WGS-84 origin.
    truth_at_init: Option<TruthSample>,
    summary: RunSummary,
}

impl Simulation {
    pub fn new(config: &ScenarioConfig, seed: u64) -> SimResult<Self> {
        let mut ekf = Ekf::new(config.filter.clone())?;
        ekf.init(0);
        ekf.set_is_fixed_wing(config.vehicle.fixed_wing);
        if config.sensors.range.enabled {
            let range = &config.sensors.range;
            ekf.set_rangefinder_limits(range.min_distance, range.max_distance);
        }

        let world = &config.world;
        Ok(Self {
            imu: ImuSim::new(&config.sensors.imu)?,
            sensors: build_sensors(config)?,
            rng: SimulationRng::from_seed(seed),
            time_us: 0,
            imu_interval_us: (1e6 / config.simulation.imu_rate_hz).round() as u64,
            world_origin: MapProjection::new(world.origin_lat_deg, world.origin_lon_deg, 0),
            truth_at_init: None,
            summary: RunSummary {
                seed,
                ..Default::default()
            },
            config: config.clone(),
            ekf,
        })
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    pub fn time_s(&self) -> f32 {
        self.time_us as f32 * 1e-6
    }

    /// Advances one IMU interval. Returns `true` when the filter produced a
    /// new corrected state.
    pub fn step(&mut self) -> SimResult<bool> {
        let dt = self.imu_interval_us as f32 * 1e-6;
        self.time_us += self.imu_interval_us;
        let t = self.time_s();
        let trajectory = &self.config.trajectory;

        let truth_mid = trajectory.sample(t - 0.5 * dt);
        let imu = self.imu.sample(&truth_mid, dt, self.time_us, &mut self.rng);
        self.ekf.set_imu_data(&imu)?;

        let truth = trajectory.sample(t);
        let in_air = self.config.vehicle.in_air_at(t);
        self.ekf.set_in_air_status(in_air);
        self.ekf
            .set_vehicle_at_rest(!in_air && truth.vel.norm() < 0.01 && truth.yaw_rate == 0.0);

        let ctx = SensorContext {
            time_us: self.time_us,
            truth: &truth,
            world: &self.config.world,
        };
        for sensor in &mut self.sensors {
            if sensor.schedule().due(ctx.time_us) {
                sensor.emit(&ctx, &mut self.rng, &mut self.ekf)?;
            }
        }

        let updated = self.ekf.update();
        if updated {
            self.summary.filter_updates += 1;
        }
        self.track(&truth, t);
        Ok(updated)
    }

    /// Runs for `duration_s` simulated seconds.
    pub fn run(&mut self, duration_s: f32) -> SimResult<RunSummary> {
        let end_us = self.time_us + (duration_s * 1e6) as u64;
        let report_us = (self.config.simulation.report_interval_s.max(0.1) * 1e6) as u64;
        let mut next_report_us = self.time_us + report_us;

        while self.time_us < end_us {
            self.step()?;
            if self.time_us >= next_report_us {
                next_report_us += report_us;
                self.report();
            }
        }

        self.summary.duration_s = self.time_s();
        self.summary.resets = *self.ekf.reset_status();
        self.summary.solution_status = self.ekf.get_ekf_soln_status();
        self.summary.control_status = self.ekf.control_status().value();
        if let Some(truth) = self.truth_now() {
            self.summary.final_error = self.tracking_error(&truth);
        }
        Ok(self.summary.clone())
    }

    fn truth_now(&self) -> Option<TruthSample> {
        self.ekf
            .is_initialised()
            .then(|| self.config.trajectory.sample(self.time_s()))
    }

    fn track(&mut self, truth: &TruthSample, t: f32) {
        if !self.ekf.is_initialised() {
            return;
        }
        if self.truth_at_init.is_none() {
            self.truth_at_init = Some(*truth);
            self.summary.initialised_at_s = Some(t);
            info!(time_s = t, "filter initialised");
        }
        if self.summary.gps_fusion_at_s.is_none() && self.ekf.control_status().gps {
            self.summary.gps_fusion_at_s = Some(t);
            info!(time_s = t, "GPS fusion started");
        }
        let error = self.tracking_error(truth);
        self.summary.max_horiz_error_m = self.summary.max_horiz_error_m.max(error.horiz_m);
    }

    /// Real-time position estimate expressed in the scenario frame.
    fn estimated_position(&self) -> Vector3f {
        let pos = self.ekf.get_position();
        if let Some(origin) = self.ekf.get_ekf_origin() {
            let filter_frame = MapProjection::new(origin.lat_deg, origin.lon_deg, 0);
            let (lat, lon) = filter_frame.reproject(pos[0], pos[1]);
            let (north, east) = self.world_origin.project(lat, lon);
            let alt = origin.alt - pos[2];
            return Vector3f::new(north, east, self.config.world.origin_alt_m - alt);
        }
        let anchor = self.truth_at_init.map(|t| t.pos).unwrap_or_else(Vector3f::zeros);
        pos + anchor
    }

    fn tracking_error(&self, truth: &TruthSample) -> TrackingError {
        let error = self.estimated_position() - truth.pos;
        let yaw = yaw_from_dcm(&quat_to_dcm(&self.ekf.get_quaternion()));
        TrackingError {
            horiz_m: error.xy().norm(),
            vert_m: error[2].abs(),
            vel_m_s: (self.ekf.get_velocity() - truth.vel).norm(),
            yaw_deg: wrap_pi(yaw - truth.yaw).to_degrees().abs(),
        }
    }

    fn report(&self) {
        let Some(truth) = self.truth_now() else {
            debug!(time_s = self.time_s(), "waiting for filter initialisation");
            return;
        };
        let error = self.tracking_error(&truth);
        let test = self.ekf.get_innovation_test_status();
        if test.status != 0 {
            warn!(
                time_s = self.time_s(),
                faults = %format!("{:#06x}", test.status),
                "innovation checks failing"
            );
        }
        info!(
            time_s = self.time_s(),
            horiz_m = error.horiz_m,
            vert_m = error.vert_m,
            yaw_deg = error.yaw_deg,
            gps = self.ekf.control_status().gps,
            "progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::config::SimulationSection;
    use ekf_core::params::{EkfParams, MagFuseType};

    fn quiet_stationary() -> ScenarioConfig {
        let mut config = ScenarioConfig {
            simulation: SimulationSection {
                seed: Some(11),
                ..Default::default()
            },
            ..Default::default()
        };
        config.sensors.gps.enabled = false;
        config.sensors.mag.enabled = false;
        config.filter = EkfParams {
            fusion_mode: 0,
            mag_fusion_type: MagFuseType::None,
            ..Default::default()
        };
        config
    }

    #[test]
    fn stationary_run_initialises_and_stays_near_truth() {
        let mut sim = Simulation::new(&quiet_stationary(), 11).expect("valid scenario");
        let summary = sim.run(10.0).expect("run succeeds");
        assert!(summary.initialised_at_s.is_some_and(|t| t < 3.0));
        assert!(summary.filter_updates > 500);
        assert!(summary.final_error.horiz_m < 1.0, "{:?}", summary.final_error);
        assert!(summary.final_error.vert_m < 2.0, "{:?}", summary.final_error);
        assert!(summary.gps_fusion_at_s.is_none());
    }

    #[test]
    fn runs_are_reproducible_for_a_seed() {
        let config = quiet_stationary();
        let a = Simulation::new(&config, 5).and_then(|mut s| s.run(3.0)).expect("run a");
        let b = Simulation::new(&config, 5).and_then(|mut s| s.run(3.0)).expect("run b");
        assert_eq!(a, b);
    }
}
