// ekf_core/tests/common/mod.rs

//! A stationary test bench that drives an [`Ekf`] with synthetic sensors.

#![allow(dead_code)]

use ekf_core::prelude::*;
use ekf_core::types::{StateCovariance, GRAVITY};

/// Raw IMU interval (us).
pub const IMU_INTERVAL_US: u64 = 4_000;

/// Earth field seen by a level vehicle facing north (Gauss).
pub const MAG_FIELD: [f32; 3] = [0.21, 0.0, 0.43];

pub const ORIGIN_LAT: f64 = 47.397_742;
pub const ORIGIN_LON: f64 = 8.545_594;
pub const ORIGIN_ALT: f32 = 488.0;

pub struct Bench {
    pub ekf: Ekf,
    pub time_us: TimeUs,
    pub baro_interval_us: u64,
    pub mag_interval_us: u64,
    pub gps_interval_us: u64,
    /// Template for the generated GPS messages; `None` disables GPS.
    pub gps: Option<GpsMessage>,
    /// Offset added to the next GPS position only (m, north).
    pub gps_glitch_north: Option<f32>,
}

impl Bench {
    pub fn new(params: EkfParams) -> Self {
        let mut ekf = Ekf::new(params).expect("test parameters are valid");
        ekf.init(0);
        Self {
            ekf,
            time_us: 0,
            baro_interval_us: 20_000,
            mag_interval_us: 20_000,
            gps_interval_us: 200_000,
            gps: None,
            gps_glitch_north: None,
        }
    }

    /// A healthy 3D fix at the origin.
    pub fn good_gps() -> GpsMessage {
        GpsMessage {
            lat: ORIGIN_LAT,
            lon: ORIGIN_LON,
            alt: ORIGIN_ALT,
            fix_type: 3,
            eph: 0.5,
            epv: 0.8,
            sacc: 0.2,
            vel_ned_valid: true,
            nsats: 12,
            pdop: 1.2,
            ..Default::default()
        }
    }

    /// Advances one IMU interval with the given body rate and specific force
    /// offsets on top of a level, stationary vehicle, then updates the
    /// filter. Returns what [`Ekf::update`] returned.
    pub fn step_with(&mut self, gyro: Vector3f, accel: Vector3f) -> bool {
        self.time_us += IMU_INTERVAL_US;
        let dt = IMU_INTERVAL_US as f32 * 1e-6;
        let imu = ImuSample {
            time_us: self.time_us,
            delta_ang: gyro * dt,
            delta_vel: (Vector3f::new(0.0, 0.0, -GRAVITY) + accel) * dt,
            delta_ang_dt: dt,
            delta_vel_dt: dt,
        };
        self.ekf.set_imu_data(&imu).expect("imu sample accepted");
        self.feed_sensors();
        self.ekf.update()
    }

    pub fn step(&mut self) -> bool {
        self.step_with(Vector3f::zeros(), Vector3f::zeros())
    }

    /// Runs for `seconds`, calling `check` after every filter update.
    pub fn run_checked(&mut self, seconds: f32, mut check: impl FnMut(&Ekf)) {
        let steps = (seconds * 1e6 / IMU_INTERVAL_US as f32) as usize;
        for _ in 0..steps {
            if self.step() {
                check(&self.ekf);
            }
        }
    }

    pub fn run(&mut self, seconds: f32) {
        self.run_checked(seconds, |_| {});
    }

    fn due(&self, interval_us: u64) -> bool {
        self.time_us % interval_us == 0
    }

    fn feed_sensors(&mut self) {
        let t = self.time_us;
        if self.due(self.baro_interval_us) {
            self.ekf
                .set_baro_data(&BaroSample { time_us: t, hgt: 0.0 })
                .expect("baro sample accepted");
        }
        if self.due(self.mag_interval_us) {
            self.ekf
                .set_mag_data(&MagSample { time_us: t, mag: Vector3f::from(MAG_FIELD) })
                .expect("mag sample accepted");
        }
        if let Some(template) = self.gps {
            if self.due(self.gps_interval_us) {
                let mut msg = GpsMessage { time_us: t, ..template };
                if let Some(north) = self.gps_glitch_north.take() {
                    msg.lat += f64::from(north / 6_371_000.0).to_degrees();
                }
                self.ekf.set_gps_data(&msg).expect("gps message accepted");
            }
        }
    }
}

/// Quaternion norm, covariance symmetry and non-negative variances.
pub fn assert_healthy(ekf: &Ekf) {
    let q = ekf.state().quat_nominal;
    assert!((q.norm() - 1.0).abs() < 1e-3, "quaternion norm {}", q.norm());
    assert_covariance_valid(ekf.covariances());
}

pub fn assert_covariance_valid(p: &StateCovariance) {
    let scale = p.amax().max(1e-6);
    let asymmetry = (p - p.transpose()).amax();
    assert!(asymmetry <= 1e-5 * scale, "covariance asymmetry {asymmetry}");
    for (i, var) in p.diagonal().iter().enumerate() {
        assert!(*var >= 0.0 && var.is_finite(), "variance {i} is {var}");
    }
}
