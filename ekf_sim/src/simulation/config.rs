// ekf_sim/src/simulation/config.rs

use std::path::Path;

use ekf_core::params::EkfParams;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{SimError, SimResult};
use crate::simulation::trajectory::TrajectoryConfig;

// =========================================================================
// == Top-Level Scenario ==
// =========================================================================

/// Everything a run needs, parsed from a scenario TOML file layered over
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub world: WorldSection,
    #[serde(default)]
    pub vehicle: VehicleSection,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
    #[serde(default)]
    pub sensors: SensorsSection,
    /// Filter parameters; unset fields keep their defaults.
    #[serde(default)]
    pub filter: EkfParams,
}

impl ScenarioConfig {
    /// Loads a scenario file on top of the built-in defaults.
    pub fn load(path: &Path) -> SimResult<Self> {
        Self::from_figment(Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path)))
    }

    /// Parses a scenario from TOML text on top of the built-in defaults.
    pub fn from_toml_str(toml: &str) -> SimResult<Self> {
        Self::from_figment(Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> SimResult<Self> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SimResult<()> {
        let sim = &self.simulation;
        if !(sim.duration_seconds.is_finite() && sim.duration_seconds > 0.0) {
            return Err(SimError::Scenario("duration_seconds must be positive".into()));
        }
        if !(sim.imu_rate_hz >= 50.0 && sim.imu_rate_hz <= 2000.0) {
            return Err(SimError::Scenario("imu_rate_hz must lie in 50..=2000".into()));
        }
        let rates = [
            ("mag", self.sensors.mag.enabled, self.sensors.mag.rate_hz),
            ("baro", self.sensors.baro.enabled, self.sensors.baro.rate_hz),
            ("gps", self.sensors.gps.enabled, self.sensors.gps.rate_hz),
            ("range", self.sensors.range.enabled, self.sensors.range.rate_hz),
            ("airspeed", self.sensors.airspeed.enabled, self.sensors.airspeed.rate_hz),
        ];
        for (name, enabled, rate) in rates {
            if enabled && !(rate > 0.0 && rate <= sim.imu_rate_hz) {
                return Err(SimError::Scenario(format!(
                    "{name} rate must be positive and no faster than the IMU"
                )));
            }
        }
        let s = &self.sensors;
        let noises = [
            ("imu.gyro_noise", s.imu.gyro_noise),
            ("imu.accel_noise", s.imu.accel_noise),
            ("mag.noise", s.mag.noise),
            ("baro.noise", s.baro.noise),
            ("gps.pos_noise", s.gps.pos_noise),
            ("gps.alt_noise", s.gps.alt_noise),
            ("gps.vel_noise", s.gps.vel_noise),
            ("range.noise", s.range.noise),
            ("airspeed.noise", s.airspeed.noise),
        ];
        if let Some((name, _)) = noises.iter().find(|(_, dev)| !(dev.is_finite() && *dev >= 0.0)) {
            return Err(SimError::Scenario(format!(
                "sensors.{name} must be a finite non-negative deviation"
            )));
        }
        self.trajectory.validate()
    }
}

// =========================================================================
// == Configuration Sections ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationSection {
    /// Seed for the sensor noise. A random seed is drawn and logged when
    /// unset.
    pub seed: Option<u64>,
    /// Simulated duration (s).
    pub duration_seconds: f32,
    pub imu_rate_hz: f32,
    /// Interval between progress log lines (s).
    pub report_interval_s: f32,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            seed: None,
            duration_seconds: 60.0,
            imu_rate_hz: 250.0,
            report_interval_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorldSection {
    /// WGS-84 position of the local frame origin.
    pub origin_lat_deg: f64,
    pub origin_lon_deg: f64,
    /// Altitude of the local origin above mean sea level (m).
    pub origin_alt_m: f32,
    /// Earth magnetic field in NED (Gauss).
    pub mag_field_ned: [f32; 3],
    /// Horizontal wind in NE (m/s).
    pub wind_ne: [f32; 2],
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            origin_lat_deg: 47.397_742,
            origin_lon_deg: 8.545_594,
            origin_alt_m: 488.0,
            mag_field_ned: [0.21, 0.0, 0.43],
            wind_ne: [0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct VehicleSection {
    pub fixed_wing: bool,
    /// Time at which the vehicle is reported in the air (s). Never in the
    /// air when unset.
    pub in_air_after_s: Option<f32>,
}

impl VehicleSection {
    pub fn in_air_at(&self, t: f32) -> bool {
        self.in_air_after_s.is_some_and(|after| t >= after)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SensorsSection {
    pub imu: ImuConfig,
    pub mag: MagConfig,
    pub baro: BaroConfig,
    pub gps: GpsConfig,
    pub range: RangeConfig,
    pub airspeed: AirspeedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ImuConfig {
    /// Gyro white noise (rad/s).
    pub gyro_noise: f32,
    /// Accelerometer white noise (m/s^2).
    pub accel_noise: f32,
    /// Constant gyro bias (rad/s).
    pub gyro_bias: [f32; 3],
    /// Constant accelerometer bias (m/s^2).
    pub accel_bias: [f32; 3],
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            gyro_noise: 0.005,
            accel_noise: 0.05,
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MagConfig {
    pub enabled: bool,
    pub rate_hz: f32,
    /// White noise per axis (Gauss).
    pub noise: f32,
    /// Body frame hard iron offset (Gauss).
    pub bias: [f32; 3],
}

impl Default for MagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_hz: 50.0,
            noise: 0.005,
            bias: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BaroConfig {
    pub enabled: bool,
    pub rate_hz: f32,
    /// White noise (m).
    pub noise: f32,
    /// Constant reading offset (m).
    pub offset: f32,
}

impl Default for BaroConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_hz: 50.0,
            noise: 0.3,
            offset: 0.0,
        }
    }
}

/// A one-off position jump injected into the GPS stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpsGlitch {
    /// Time of the glitched message (s).
    pub at_s: f32,
    /// Position error of the glitched message (m, NE).
    pub offset_ne: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GpsConfig {
    pub enabled: bool,
    pub rate_hz: f32,
    /// Horizontal position noise (m).
    pub pos_noise: f32,
    /// Vertical position noise (m).
    pub alt_noise: f32,
    /// Velocity noise per axis (m/s).
    pub vel_noise: f32,
    /// Reported accuracies.
    pub eph: f32,
    pub epv: f32,
    pub sacc: f32,
    pub nsats: u8,
    pub pdop: f32,
    pub fix_type: u8,
    pub glitch: Option<GpsGlitch>,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_hz: 5.0,
            pos_noise: 0.3,
            alt_noise: 0.5,
            vel_noise: 0.1,
            eph: 0.8,
            epv: 1.2,
            sacc: 0.3,
            nsats: 12,
            pdop: 1.2,
            fix_type: 3,
            glitch: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RangeConfig {
    pub enabled: bool,
    pub rate_hz: f32,
    /// White noise (m).
    pub noise: f32,
    pub min_distance: f32,
    pub max_distance: f32,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_hz: 20.0,
            noise: 0.02,
            min_distance: 0.1,
            max_distance: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AirspeedConfig {
    pub enabled: bool,
    pub rate_hz: f32,
    /// White noise (m/s).
    pub noise: f32,
}

impl Default for AirspeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_hz: 20.0,
            noise: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekf_core::params::MagFuseType;

    #[test]
    fn empty_scenario_uses_defaults() {
        let config = ScenarioConfig::from_toml_str("").expect("defaults are valid");
        assert_eq!(config, ScenarioConfig::default());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = ScenarioConfig::from_toml_str(
            r#"
            [simulation]
            seed = 42
            duration_seconds = 30.0

            [sensors.gps]
            nsats = 4

            [filter]
            mag_fusion_type = "none"
            gps_delay_ms = 80.0
            "#,
        )
        .expect("scenario parses");
        assert_eq!(config.simulation.seed, Some(42));
        assert_eq!(config.simulation.imu_rate_hz, 250.0);
        assert_eq!(config.sensors.gps.nsats, 4);
        assert_eq!(config.sensors.gps.rate_hz, 5.0);
        assert_eq!(config.filter.mag_fusion_type, MagFuseType::None);
        assert_eq!(config.filter.gps_delay_ms, 80.0);
        assert_eq!(config.filter.baro_noise, EkfParams::default().baro_noise);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ScenarioConfig::from_toml_str("[sensors.baro]\nnoize = 1.0\n");
        assert!(matches!(err, Err(SimError::Config(_))));
    }

    #[test]
    fn sensor_faster_than_imu_is_rejected() {
        let err = ScenarioConfig::from_toml_str("[sensors.mag]\nrate_hz = 1000.0\n");
        assert!(matches!(err, Err(SimError::Scenario(_))));
    }

    #[test]
    fn negative_noise_is_rejected() {
        let err = ScenarioConfig::from_toml_str("[sensors.gps]\nvel_noise = -0.1\n");
        assert!(matches!(err, Err(SimError::Scenario(msg)) if msg.contains("gps.vel_noise")));
    }

    #[test]
    fn in_air_only_after_takeoff() {
        let vehicle = VehicleSection {
            in_air_after_s: Some(2.0),
            ..Default::default()
        };
        assert!(!vehicle.in_air_at(1.9));
        assert!(vehicle.in_air_at(2.0));
        assert!(!VehicleSection::default().in_air_at(100.0));
    }
}
