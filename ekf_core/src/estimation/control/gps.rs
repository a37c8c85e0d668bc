// ekf_core/src/estimation/control/gps.rs

//! GPS quality checks, origin selection and GPS fusion control.

use tracing::{debug, info, warn};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::vel_pos::AxisObservation;
use crate::frames::geo::{earth_rate_ned, MapProjection};
use crate::messages::{GpsMessage, GpsSample};
use crate::params::{fusion_mask, gps_check_mask};
use crate::types::{constrain, elapsed_us, sq, TimeUs, Vector2f};

/// Time constant of the on-ground drift filters (s).
const DRIFT_FILTER_TAU: f32 = 10.0;

/// Filtered vertical speed disagreement allowed, as a multiple of
/// `req_vdrift`.
const VSPEED_LIMIT_SCALE: f32 = 1.5;

/// GPS reporting is considered lost after this time without a pass (us).
const GPS_LOST_TIMEOUT_US: u64 = 10_000_000;

/// Which quality checks the last GPS message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpsCheckFail {
    pub fix: bool,
    pub nsats: bool,
    pub pdop: bool,
    pub hacc: bool,
    pub vacc: bool,
    pub sacc: bool,
    pub hdrift: bool,
    pub vdrift: bool,
    pub hspeed: bool,
    pub vspeed: bool,
}

impl GpsCheckFail {
    /// Packs the failures, `fix` in bit 0 and the masked checks above it in
    /// [`gps_check_mask`] order.
    pub fn value(&self) -> u16 {
        [
            self.fix,
            self.nsats,
            self.pdop,
            self.hacc,
            self.vacc,
            self.sacc,
            self.hdrift,
            self.vdrift,
            self.hspeed,
            self.vspeed,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, &set)| acc | (u16::from(set) << bit))
    }

    /// True when the fix is bad or any check selected by `mask` failed.
    pub fn any_selected(&self, mask: u16) -> bool {
        let masked = [
            (self.nsats, gps_check_mask::NSATS),
            (self.pdop, gps_check_mask::PDOP),
            (self.hacc, gps_check_mask::HACC),
            (self.vacc, gps_check_mask::VACC),
            (self.sacc, gps_check_mask::SACC),
            (self.hdrift, gps_check_mask::HDRIFT),
            (self.vdrift, gps_check_mask::VDRIFT),
            (self.hspeed, gps_check_mask::HSPD),
            (self.vspeed, gps_check_mask::VSPD),
        ];
        self.fix || masked.iter().any(|(failed, bit)| *failed && mask & bit != 0)
    }
}

/// Filtered drift rates measured while the vehicle is on the ground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsDriftMetrics {
    /// Horizontal position drift rate (m/s).
    pub hpos_drift_rate: f32,
    /// Vertical position drift rate (m/s).
    pub vpos_drift_rate: f32,
    /// Filtered horizontal speed (m/s).
    pub hspd: f32,
    /// Drift checks are suspended because the vehicle is moving.
    pub blocked: bool,
}

/// State of the GPS quality checks between messages.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GpsChecks {
    pub fail: GpsCheckFail,
    pub passed: bool,
    pub last_fail_us: Option<TimeUs>,
    pub last_pass_us: TimeUs,
    /// Reported accuracy relative to the required accuracy, worst of
    /// position and speed.
    pub error_norm: f32,
    /// Position and altitude of the previous message, for drift rates.
    pub pos_prev: Option<MapProjection>,
    pub alt_prev: f32,
    pub drift_rate_filt: Vector2f,
    pub vel_ne_filt: Vector2f,
    pub vel_d_filt: f32,
    pub vel_d_diff_filt: f32,
    pub drift_metrics: [f32; 3],
    pub drift_updated: bool,
    pub drift_blocked: bool,
}

impl Default for GpsChecks {
    fn default() -> Self {
        Self {
            fail: GpsCheckFail::default(),
            passed: false,
            last_fail_us: None,
            last_pass_us: 0,
            error_norm: 0.0,
            pos_prev: None,
            alt_prev: 0.0,
            drift_rate_filt: Vector2f::zeros(),
            vel_ne_filt: Vector2f::zeros(),
            vel_d_filt: 0.0,
            vel_d_diff_filt: 0.0,
            drift_metrics: [0.0; 3],
            drift_updated: false,
            drift_blocked: false,
        }
    }
}

impl Ekf {
    /// Runs the quality checks on a GPS message. Returns `true` once GPS has
    /// passed every selected check continuously for `min_gps_health_us`.
    pub(crate) fn gps_is_good(&mut self, gps: &GpsMessage) -> bool {
        let p = &self.params;
        let now = self.time_last_imu;
        let in_air = self.control.in_air;
        let vel_d_est = self.store.state.vel[2];
        let checks = &mut self.gps_checks;
        let fail = &mut checks.fail;

        fail.fix = gps.fix_type < 3;
        fail.nsats = gps.nsats < p.req_nsats;
        fail.pdop = gps.pdop > p.req_pdop;
        fail.hacc = gps.eph > p.req_hacc;
        fail.vacc = gps.epv > p.req_vacc;
        fail.sacc = gps.sacc > p.req_sacc;
        checks.error_norm = (gps.eph / p.req_hacc.max(0.01)).max(gps.sacc / p.req_sacc.max(0.01));

        let (prev, alt_prev) = match checks.pos_prev {
            Some(prev) => (prev, checks.alt_prev),
            None => (MapProjection::new(gps.lat, gps.lon, now), gps.alt),
        };
        let dt = constrain(elapsed_us(now, prev.timestamp_us) as f32 * 1e-6, 0.001, 1.0);
        let alpha = dt / (dt + DRIFT_FILTER_TAU);
        checks.pos_prev = Some(MapProjection::new(gps.lat, gps.lon, now));
        checks.alt_prev = gps.alt;

        // Drift is only meaningful while the vehicle is stationary.
        if !in_air {
            let (delta_n, delta_e) = prev.project(gps.lat, gps.lon);
            let drift_rate = Vector2f::new(delta_n, delta_e) / dt;
            checks.drift_rate_filt = drift_rate * alpha + checks.drift_rate_filt * (1.0 - alpha);
            checks.drift_metrics[0] = checks.drift_rate_filt.norm();
            fail.hdrift = checks.drift_metrics[0] > p.req_hdrift;

            let vel_d_drift = (alt_prev - gps.alt) / dt;
            checks.vel_d_filt = vel_d_drift * alpha + checks.vel_d_filt * (1.0 - alpha);
            checks.drift_metrics[1] = checks.vel_d_filt.abs();
            fail.vdrift = checks.drift_metrics[1] > p.req_vdrift;

            let limit = 10.0 * p.req_hdrift;
            let vel_ne = Vector2f::new(gps.vel_ned[0], gps.vel_ned[1]).map(|v| constrain(v, -limit, limit));
            checks.vel_ne_filt = vel_ne * alpha + checks.vel_ne_filt * (1.0 - alpha);
            checks.drift_metrics[2] = checks.vel_ne_filt.norm();
            fail.hspeed = checks.drift_metrics[2] > p.req_hdrift;

            checks.drift_updated = true;
            checks.drift_blocked = false;
        } else {
            fail.hdrift = false;
            fail.vdrift = false;
            fail.hspeed = false;
            checks.drift_rate_filt = Vector2f::zeros();
            checks.vel_ne_filt = Vector2f::zeros();
            checks.vel_d_filt = 0.0;
            checks.drift_updated = false;
            checks.drift_blocked = true;
        }

        // Filtered disagreement between GPS and filter vertical velocity.
        let limit = 10.0 * p.req_vdrift;
        let vel_d_diff = constrain(gps.vel_ned[2] - vel_d_est, -limit, limit);
        checks.vel_d_diff_filt = vel_d_diff * alpha + checks.vel_d_diff_filt * (1.0 - alpha);
        fail.vspeed = gps.vel_ned_valid
            && checks.vel_d_diff_filt.abs() > VSPEED_LIMIT_SCALE * p.req_vdrift;

        if fail.any_selected(p.gps_check_mask) {
            if checks.last_fail_us.is_none() || checks.passed {
                debug!(status = fail.value(), "GPS quality checks failed");
            }
            checks.last_fail_us = Some(now);
        } else {
            checks.last_pass_us = now;
        }
        let last_fail = *checks.last_fail_us.get_or_insert(now);
        elapsed_us(now, last_fail) > p.min_gps_health_us
    }

    /// Quality checks and origin selection for one GPS message. Returns
    /// `true` when the message should be stored for fusion.
    pub(crate) fn collect_gps(&mut self, gps: &GpsMessage) -> bool {
        self.gps_checks.passed = self.gps_is_good(gps);

        if self.pos_ref.is_none() && self.gps_checks.passed {
            let now = self.time_last_imu;
            let mut origin = MapProjection::new(gps.lat, gps.lon, now);
            // Already navigating on a relative source: shift the origin back
            // to where the filter started.
            if self.control.opt_flow || self.control.ev_pos {
                let (lat, lon) =
                    origin.reproject(-self.store.state.pos[0], -self.store.state.pos[1]);
                origin = MapProjection::new(lat, lon, now);
            }
            self.gps_alt_ref = gps.alt + self.store.state.pos[2];
            self.earth_rate_ned = earth_rate_ned(origin.lat_deg().to_radians() as f32);
            self.pos_ref = Some(origin);
            info!(
                lat = origin.lat_deg(),
                lon = origin.lon_deg(),
                alt = self.gps_alt_ref,
                "GPS checks passed, origin set"
            );
        }

        self.pos_ref.is_some() && gps.fix_type >= 3
    }

    /// Converts a collected message into a fusion sample on the local frame.
    pub(crate) fn gps_sample_from(&self, gps: &GpsMessage, time_us: TimeUs) -> Option<GpsSample> {
        let origin = self.pos_ref.as_ref()?;
        let (north, east) = origin.project(gps.lat, gps.lon);
        Some(GpsSample {
            time_us,
            pos: Vector2f::new(north, east),
            hgt: gps.alt - self.gps_alt_ref,
            vel: gps.vel_ned,
            yaw: gps.yaw,
            hacc: gps.eph,
            vacc: gps.epv,
            sacc: gps.sacc,
        })
    }

    /// Whether GPS data has been passing its checks recently.
    pub(crate) fn gps_recently_good(&self) -> bool {
        self.gps_checks.passed
            && elapsed_us(self.time_last_imu, self.gps_checks.last_pass_us) < GPS_LOST_TIMEOUT_US
    }

    /// Starts, runs and stops GPS position and velocity fusion, plus dual
    /// antenna yaw fusion when selected.
    pub(crate) fn control_gps_fusion(&mut self) {
        if !self.delayed.gps_ready {
            self.check_gps_timeout();
            return;
        }

        self.control_gps_yaw_fusion();

        if self.params.uses(fusion_mask::USE_GPS) && !self.control.gps {
            if self.control.tilt_align && self.pos_ref.is_some() && self.gps_checks.passed {
                // A yaw that cannot be trusted is realigned to the course
                // first on fixed wing vehicles.
                if !self.control.yaw_align && self.control.fixed_wing {
                    self.realign_yaw_gps();
                }
                if self.control.yaw_align {
                    self.start_gps_fusion();
                }
            }
        } else if self.control.gps && !self.params.uses(fusion_mask::USE_GPS) {
            self.control.gps = false;
            info!("GPS fusion stopped by parameter");
        }

        if self.control.gps {
            self.collect_gps_observations();
        }
        self.check_gps_timeout();
    }

    fn start_gps_fusion(&mut self) {
        // Relative aiding keeps its frame; only a standalone start resets.
        if !(self.control.opt_flow || self.control.ev_pos) {
            self.control.gps = true;
            self.reset_velocity();
            self.reset_position();
        } else {
            self.control.gps = true;
        }
        self.timers.last_vel_fuse = self.imu_sample_delayed.time_us;
        self.timers.last_pos_fuse = self.imu_sample_delayed.time_us;
        info!("starting GPS fusion");
    }

    /// Queues the delayed GPS sample's velocity and position observations.
    fn collect_gps_observations(&mut self) {
        let gps = self.delayed.gps;
        let p = &self.params;

        let lower_limit = p.gps_pos_noise.max(0.01);
        let upper_limit = lower_limit.max(p.pos_noaid_noise);
        let pos_var = sq(constrain(gps.hacc, lower_limit, upper_limit));
        let vel_var = sq(gps.sacc.max(p.gps_vel_noise).max(0.01));

        // Compensate the antenna offset from the IMU.
        let pos_offset_earth = self.r_to_earth * (p.gps_pos_body - p.imu_pos_body);
        let vel_offset_earth = self.output.vel_imu_rel_body_ned();
        let vel = gps.vel - vel_offset_earth;
        let pos = gps.pos - pos_offset_earth.xy();

        self.pending.hor_vel = Some(AxisObservation {
            measurement: [vel[0], vel[1]],
            obs_var: [vel_var; 2],
            gate: p.vel_innov_gate.max(1.0),
        });
        self.pending.vert_vel = Some(AxisObservation {
            measurement: [vel[2]],
            obs_var: [vel_var * sq(1.5)],
            gate: p.vel_innov_gate.max(1.0),
        });
        self.pending.hor_pos = Some(AxisObservation {
            measurement: [pos[0], pos[1]],
            obs_var: [pos_var; 2],
            gate: p.pos_ne_innov_gate.max(1.0),
        });
    }

    /// Resets to GPS when velocity and position have been rejected for too
    /// long, or stops GPS fusion when reporting has been lost.
    fn check_gps_timeout(&mut self) {
        if !self.control.gps {
            return;
        }
        let now = self.imu_sample_delayed.time_us;
        let timeout = self.params.valid_timeout_max;
        let pos_stale = elapsed_us(now, self.timers.last_pos_fuse) > timeout;
        let vel_stale = elapsed_us(now, self.timers.last_vel_fuse) > timeout;
        if !(pos_stale && vel_stale) {
            return;
        }

        let other_aiding = self.control.opt_flow || self.control.ev_pos;
        if !self.gps_recently_good() {
            self.control.gps = false;
            warn!("GPS data lost, stopping GPS fusion");
            if !other_aiding {
                self.last_known_pos_ne =
                    Vector2f::new(self.store.state.pos[0], self.store.state.pos[1]);
            }
        } else if !other_aiding || self.aiding.deadreckon_time_exceeded {
            if self.control.fixed_wing {
                self.realign_yaw_gps();
            }
            self.reset_velocity();
            self.reset_position();
            self.timers.last_vel_fuse = now;
            self.timers.last_pos_fuse = now;
            warn!("GPS fusion timeout, reset to GPS");
        }
    }

    /// Dual antenna yaw: aligns yaw on start and fuses it each sample.
    fn control_gps_yaw_fusion(&mut self) {
        if !self.params.uses(fusion_mask::USE_GPS_YAW) {
            if self.control.gps_yaw {
                self.control.gps_yaw = false;
                info!("GPS yaw fusion stopped by parameter");
            }
            return;
        }
        let Some(gps_yaw) = self.delayed.gps.yaw.filter(|y| y.is_finite()) else {
            return;
        };

        if !self.control.gps_yaw && self.control.tilt_align && self.gps_checks.passed {
            if self.reset_gps_ant_yaw() {
                self.control.gps_yaw = true;
                self.control.yaw_align = true;
                // Dual antenna yaw replaces the magnetometer.
                self.control.mag_hdg = false;
                self.control.mag_3d = false;
                self.control.mag_dec = false;
                self.control.ev_yaw = false;
                info!("starting GPS yaw fusion");
            }
        }

        if self.control.gps_yaw {
            self.fuse_gps_ant_yaw(gps_yaw);
            let now = self.imu_sample_delayed.time_us;
            if elapsed_us(now, self.timers.last_gps_yaw_fuse) > self.params.valid_timeout_max {
                self.control.gps_yaw = false;
                warn!("GPS yaw fusion timeout");
            }
        }
    }

    /// Whether GPS height may be used as the height reference.
    pub(crate) fn gps_height_usable(&self) -> bool {
        self.pos_ref.is_some()
            && self.gps_recently_good()
            && elapsed_us(self.imu_sample_delayed.time_us, self.delayed.gps.time_us)
                < 2 * self.params.valid_timeout_max
    }

    /// One-shot drift metrics: returns the metrics once after each update
    /// computed on the ground, `None` otherwise.
    pub fn get_gps_drift_metrics(&mut self) -> Option<GpsDriftMetrics> {
        let checks = &mut self.gps_checks;
        if !checks.drift_updated {
            return None;
        }
        checks.drift_updated = false;
        Some(GpsDriftMetrics {
            hpos_drift_rate: checks.drift_metrics[0],
            vpos_drift_rate: checks.drift_metrics[1],
            hspd: checks.drift_metrics[2],
            blocked: checks.drift_blocked,
        })
    }

    /// Bitmask of the GPS checks that failed on the last message.
    pub fn get_gps_check_status(&self) -> u16 {
        self.gps_checks.fail.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_failure_always_counts() {
        let fail = GpsCheckFail {
            fix: true,
            ..Default::default()
        };
        assert!(fail.any_selected(0));
        assert_eq!(fail.value(), 1);
    }

    #[test]
    fn unselected_checks_are_ignored() {
        let fail = GpsCheckFail {
            pdop: true,
            ..Default::default()
        };
        assert!(!fail.any_selected(gps_check_mask::NSATS));
        assert!(fail.any_selected(gps_check_mask::PDOP));
        assert_eq!(fail.value(), 1 << 2);
    }
}
