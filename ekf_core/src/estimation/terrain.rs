// ekf_core/src/estimation/terrain.rs

//! Single state terrain height estimator.
//!
//! The vertical position of the ground below the vehicle is tracked as a
//! scalar with its own variance, outside the main covariance. Range finder
//! height above ground is fused into it; flow fusion and height-above-ground
//! reporting read it back.

use tracing::{debug, info};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::test_ratio;
use crate::estimation::status::innovation_fault;
use crate::frames::layout::POS_D;
use crate::types::{constrain, elapsed_us, sq, TimeUs, Vector3f};

/// Ceiling on the terrain variance (m^2).
const MAX_TERRAIN_VAR: f32 = 1e4;

/// Longest time without range fusion for which the terrain stays valid (us).
const TERRAIN_VALID_TIMEOUT_US: u64 = 5_000_000;

/// Oldest range sample usable for initialisation (us).
const INIT_RANGE_MAX_AGE_US: u64 = 200_000;

/// Where the terrain estimate is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerrainStatus {
    #[default]
    Uninitialised,
    /// Initialised and recently corrected by range data.
    Tracking,
    /// Initialised but no longer supported by range data.
    Invalid,
}

/// Result of one height above ground fusion attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaglFusion {
    pub innov: f32,
    pub innov_var: f32,
    pub test_ratio: f32,
    pub fused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainEstimator {
    vpos: f32,
    var: f32,
    status: TerrainStatus,
    time_last_fuse: TimeUs,
}

impl Default for TerrainEstimator {
    fn default() -> Self {
        Self {
            vpos: 0.0,
            var: MAX_TERRAIN_VAR,
            status: TerrainStatus::Uninitialised,
            time_last_fuse: 0,
        }
    }
}

impl TerrainEstimator {
    /// Vertical position of the terrain (m, NED).
    pub fn vpos(&self) -> f32 {
        self.vpos
    }

    pub fn var(&self) -> f32 {
        self.var
    }

    pub fn status(&self) -> TerrainStatus {
        self.status
    }

    pub fn is_initialised(&self) -> bool {
        self.status != TerrainStatus::Uninitialised
    }

    pub fn is_valid(&self) -> bool {
        self.status == TerrainStatus::Tracking
    }

    pub fn time_last_fuse(&self) -> TimeUs {
        self.time_last_fuse
    }

    /// Starts the estimate at `vpos` with variance `var`.
    pub fn initialise(&mut self, vpos: f32, var: f32, now: TimeUs) {
        self.vpos = vpos;
        self.var = constrain(var, 0.0, MAX_TERRAIN_VAR);
        self.status = TerrainStatus::Tracking;
        self.time_last_fuse = now;
    }

    /// Grows the variance for vehicle height error and for terrain
    /// gradient sampled at the current ground speed.
    pub fn predict(&mut self, dt: f32, vel: &Vector3f, p_noise: f32, gradient: f32) {
        self.var += sq(dt * p_noise);
        self.var += sq(dt * gradient) * (sq(vel[0]) + sq(vel[1]));
        self.var = constrain(self.var, 0.0, MAX_TERRAIN_VAR);
    }

    /// Scalar update with a measured height above ground. `obs_var` should
    /// include the variance of the vehicle's own vertical position.
    pub fn fuse(
        &mut self,
        pos_d: f32,
        meas_hagl: f32,
        obs_var: f32,
        gate: f32,
        now: TimeUs,
    ) -> HaglFusion {
        let pred_hagl = self.vpos - pos_d;
        let innov = meas_hagl - pred_hagl;
        let innov_var = (self.var + obs_var).max(obs_var);
        let ratio = test_ratio(innov, innov_var, gate.max(1.0));
        let fused = ratio <= 1.0 && innov_var > 0.0;
        if fused {
            let gain = self.var / innov_var;
            self.vpos += gain * innov;
            self.var = (self.var * (1.0 - gain)).max(0.0);
            self.time_last_fuse = now;
        }
        HaglFusion {
            innov,
            innov_var,
            test_ratio: ratio,
            fused,
        }
    }

    /// Keeps the terrain at least `clearance` below the vehicle.
    pub fn limit_to_clearance(&mut self, pos_d: f32, clearance: f32) {
        if self.vpos - pos_d < clearance {
            self.vpos = pos_d + clearance;
        }
    }

    /// Valid while range data keeps arriving and being fused.
    pub fn update_valid(&mut self, range_usable: bool, now: TimeUs) {
        if self.status == TerrainStatus::Uninitialised {
            return;
        }
        let recent = elapsed_us(now, self.time_last_fuse) < TERRAIN_VALID_TIMEOUT_US;
        self.status = if range_usable && recent {
            TerrainStatus::Tracking
        } else {
            TerrainStatus::Invalid
        };
    }
}

impl Ekf {
    /// Initialises the terrain estimate from a fresh range sample, or from
    /// the ground clearance while on the ground.
    pub(crate) fn init_hagl(&mut self) -> bool {
        let now = self.imu_sample_delayed.time_us;
        let pos_d = self.store.state.pos[2];
        let cos_tilt = self.range_checks.r_rng_to_earth_2_2;
        let latest = self.buffers.range.newest().copied();

        let fresh_range = latest.filter(|s| {
            elapsed_us(self.time_last_imu, s.time_us) < INIT_RANGE_MAX_AGE_US
                && cos_tilt > self.params.range_cos_max_tilt
        });
        if let Some(sample) = fresh_range {
            self.terrain
                .initialise(pos_d + sample.rng * cos_tilt, sq(self.params.range_noise), now);
        } else if !self.control.in_air {
            let clearance = self.params.rng_gnd_clearance;
            self.terrain.initialise(pos_d + clearance, sq(clearance), now);
        } else {
            return false;
        }
        info!(vpos = self.terrain.vpos(), "terrain estimate initialised");
        true
    }

    /// Terrain estimator step, run once per filter cycle after fusion.
    pub(crate) fn run_terrain_estimator(&mut self) {
        if !self.terrain.is_initialised() {
            self.init_hagl();
        } else {
            // Coming back from invalid needs a fresh, continuous, untilted
            // range signal.
            if self.terrain.status() == TerrainStatus::Invalid
                && self.delayed.range_ready
                && self.range_usable()
            {
                debug!("re-initialising terrain from range");
                self.init_hagl();
            }

            self.terrain.predict(
                self.imu_sample_delayed.delta_vel_dt,
                &self.store.state.vel,
                self.params.terrain_p_noise,
                self.params.terrain_gradient,
            );

            if self.delayed.range_ready && !self.range_checks.rng_hgt_faulty {
                self.fuse_hagl();
            }

            self.terrain
                .limit_to_clearance(self.store.state.pos[2], self.params.rng_gnd_clearance);
        }
        self.update_terrain_valid();
    }

    /// Fuses the delayed range sample as a height above ground.
    pub(crate) fn fuse_hagl(&mut self) -> bool {
        let cos_tilt = self.range_checks.r_rng_to_earth_2_2;
        if cos_tilt <= self.params.range_cos_max_tilt {
            self.innov_check_fail_status |= innovation_fault::HAGL;
            return false;
        }

        let rng = self.delayed.range.rng;
        let meas_hagl = rng * cos_tilt;
        let obs_var = self.store.p[(POS_D, POS_D)].max(0.0)
            + sq(self.params.range_noise)
            + sq(self.params.range_noise_scaler * rng);
        let result = self.terrain.fuse(
            self.store.state.pos[2],
            meas_hagl,
            obs_var,
            self.params.range_innov_gate,
            self.imu_sample_delayed.time_us,
        );

        self.innov.hagl = result.innov;
        self.innov.hagl_var = result.innov_var;
        self.innov.hagl_test_ratio = result.test_ratio;
        if result.fused {
            self.innov_check_fail_status &= !innovation_fault::HAGL;
        } else {
            self.innov_check_fail_status |= innovation_fault::HAGL;
        }
        result.fused
    }

    pub(crate) fn update_terrain_valid(&mut self) {
        let usable = self.range_checks.range_data_continuous && !self.control.rng_stuck;
        self.terrain
            .update_valid(usable, self.imu_sample_delayed.time_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn fusion_moves_terrain_towards_the_measurement() {
        let mut terrain = TerrainEstimator::default();
        terrain.initialise(0.0, 1.0, 0);
        // Vehicle at 5 m altitude measures 6 m to the ground.
        let result = terrain.fuse(-5.0, 6.0, 0.01, 5.0, 1_000);
        assert!(result.fused);
        assert_abs_diff_eq!(result.innov, 1.0, epsilon = 1e-6);
        assert!(terrain.vpos() > 0.9);
        assert!(terrain.var() < 1.0);
        assert_eq!(terrain.time_last_fuse(), 1_000);
    }

    #[test]
    fn gated_measurement_is_rejected() {
        let mut terrain = TerrainEstimator::default();
        terrain.initialise(0.0, 0.01, 0);
        let before = terrain;
        let result = terrain.fuse(-5.0, 50.0, 0.01, 5.0, 1_000);
        assert!(!result.fused);
        assert!(result.test_ratio > 1.0);
        assert_eq!(terrain, before);
    }

    #[test]
    fn variance_grows_with_speed() {
        let mut slow = TerrainEstimator::default();
        slow.initialise(0.0, 0.0, 0);
        let mut fast = slow;
        slow.predict(0.01, &Vector3f::zeros(), 5.0, 0.5);
        fast.predict(0.01, &Vector3f::new(10.0, 0.0, 0.0), 5.0, 0.5);
        assert!(fast.var() > slow.var());
        assert!(slow.var() > 0.0);
    }

    #[test]
    fn terrain_stays_below_the_vehicle() {
        let mut terrain = TerrainEstimator::default();
        terrain.initialise(-10.0, 1.0, 0);
        terrain.limit_to_clearance(-5.0, 0.1);
        assert_abs_diff_eq!(terrain.vpos(), -4.9, epsilon = 1e-6);
    }

    #[test]
    fn validity_lapses_without_fusion() {
        let mut terrain = TerrainEstimator::default();
        terrain.update_valid(true, 0);
        assert_eq!(terrain.status(), TerrainStatus::Uninitialised);

        terrain.initialise(0.0, 1.0, 0);
        terrain.update_valid(true, 1_000_000);
        assert!(terrain.is_valid());
        terrain.update_valid(true, 6_000_000);
        assert_eq!(terrain.status(), TerrainStatus::Invalid);
        assert!(terrain.is_initialised());
    }
}
