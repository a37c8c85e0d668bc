// ekf_sim/src/simulation/sensors/gps.rs

use ekf_core::errors::EkfResult;
use ekf_core::estimation::Ekf;
use ekf_core::frames::geo::MapProjection;
use ekf_core::messages::GpsMessage;
use ekf_core::types::Vector2f;
use rand_distr::Normal;
use tracing::info;

use super::{Schedule, SensorContext, SimSensor};
use crate::errors::SimResult;
use crate::simulation::config::{GpsConfig, GpsGlitch, WorldSection};
use crate::simulation::prng::{zero_mean, SimulationRng};

/// GPS receiver reporting WGS-84 position and NED velocity.
#[derive(Debug, Clone)]
pub struct GpsSim {
    schedule: Schedule,
    config: GpsConfig,
    origin: MapProjection,
    origin_alt: f32,
    pos_noise: Normal<f32>,
    alt_noise: Normal<f32>,
    vel_noise: Normal<f32>,
    /// Glitch still waiting to be injected.
    glitch: Option<GpsGlitch>,
}

impl GpsSim {
    pub fn new(config: &GpsConfig, world: &WorldSection) -> SimResult<Self> {
        Ok(Self {
            schedule: Schedule::from_rate(config.rate_hz),
            origin: MapProjection::new(world.origin_lat_deg, world.origin_lon_deg, 0),
            origin_alt: world.origin_alt_m,
            pos_noise: zero_mean("gps position", config.pos_noise)?,
            alt_noise: zero_mean("gps altitude", config.alt_noise)?,
            vel_noise: zero_mean("gps velocity", config.vel_noise)?,
            glitch: config.glitch,
            config: config.clone(),
        })
    }

    fn message(&mut self, ctx: &SensorContext, rng: &mut SimulationRng) -> GpsMessage {
        let truth = ctx.truth;
        let mut pos_ne = truth.pos.xy() + rng.vector2(&self.pos_noise);
        if let Some(glitch) = self.glitch.filter(|g| ctx.time_s() >= g.at_s) {
            pos_ne += Vector2f::from(glitch.offset_ne);
            self.glitch = None;
            info!(
                time_s = ctx.time_s(),
                north = glitch.offset_ne[0],
                east = glitch.offset_ne[1],
                "injecting GPS glitch"
            );
        }
        let (lat, lon) = self.origin.reproject(pos_ne[0], pos_ne[1]);
        let vel_ned = truth.vel + rng.vector3(&self.vel_noise);
        let c = &self.config;
        GpsMessage {
            time_us: ctx.time_us,
            lat,
            lon,
            alt: self.origin_alt - truth.pos[2] + rng.sample(&self.alt_noise),
            yaw: None,
            fix_type: c.fix_type,
            eph: c.eph,
            epv: c.epv,
            sacc: c.sacc,
            vel_m_s: vel_ned.xy().norm(),
            vel_ned,
            vel_ned_valid: true,
            nsats: c.nsats,
            pdop: c.pdop,
        }
    }
}

impl SimSensor for GpsSim {
    fn name(&self) -> &'static str {
        "gps"
    }

    fn schedule(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    fn emit(&mut self, ctx: &SensorContext, rng: &mut SimulationRng, ekf: &mut Ekf) -> EkfResult<()> {
        let msg = self.message(ctx, rng);
        ekf.set_gps_data(&msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::trajectory::TrajectoryConfig;
    use approx::assert_abs_diff_eq;

    fn noiseless() -> GpsConfig {
        GpsConfig {
            pos_noise: 0.0,
            alt_noise: 0.0,
            vel_noise: 0.0,
            glitch: Some(GpsGlitch {
                at_s: 1.0,
                offset_ne: [30.0, 0.0],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn glitch_is_injected_once() {
        let world = WorldSection::default();
        let mut gps = GpsSim::new(&noiseless(), &world).expect("valid noise");
        let truth = TrajectoryConfig::default().sample(0.0);
        let mut rng = SimulationRng::from_seed(1);
        let origin = MapProjection::new(world.origin_lat_deg, world.origin_lon_deg, 0);

        let north_at = |gps: &mut GpsSim, rng: &mut SimulationRng, time_us| {
            let ctx = SensorContext { time_us, truth: &truth, world: &world };
            let msg = gps.message(&ctx, rng);
            origin.project(msg.lat, msg.lon).0
        };
        assert_abs_diff_eq!(north_at(&mut gps, &mut rng, 800_000), 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(north_at(&mut gps, &mut rng, 1_000_000), 30.0, epsilon = 0.01);
        assert_abs_diff_eq!(north_at(&mut gps, &mut rng, 1_200_000), 0.0, epsilon = 0.01);
    }

    #[test]
    fn altitude_is_relative_to_the_origin() {
        let world = WorldSection::default();
        let mut gps = GpsSim::new(&noiseless(), &world).expect("valid noise");
        let truth = TrajectoryConfig::Stationary {
            altitude_m: 15.0,
            heading_deg: 0.0,
        }
        .sample(0.0);
        let ctx = SensorContext { time_us: 0, truth: &truth, world: &world };
        let msg = gps.message(&ctx, &mut SimulationRng::from_seed(1));
        assert_abs_diff_eq!(msg.alt, world.origin_alt_m + 15.0, epsilon = 1e-3);
        assert_eq!(msg.fix_type, 3);
    }
}
