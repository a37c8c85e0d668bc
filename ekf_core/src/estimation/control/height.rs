// ekf_core/src/estimation/control/height.rs

//! Height source selection, range finder checks and height fusion control.
//!
//! Every source is turned into a down position through an offset:
//! `pos_d = -(h - offset)`. The barometer keeps its own offset, the other
//! sources share one. On every switch the new source's offset is chosen so
//! that the measured position matches the current estimate, which keeps the
//! vertical position continuous across transitions.

use tracing::{debug, info, warn};

use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::test_ratio;
use crate::estimation::fusion::vel_pos::AxisObservation;
use crate::frames::layout::POS_D;
use crate::params::HeightSensor;
use crate::types::{constrain, elapsed_us, sq, TimeUs};

/// Height fusion gap after which the height is reset (us).
const HGT_FUSION_TIMEOUT_US: u64 = 5_000_000;

/// Sensor data older than this is treated as unavailable (us).
const SENSOR_DATA_TIMEOUT_US: u64 = 1_000_000;

/// Filtered range sample interval below which range data is continuous (us).
const RANGE_CONTINUITY_LIMIT_US: f32 = 2e6;

/// Ceiling of the filtered range sample interval (us).
const RANGE_INTERVAL_FILT_MAX_US: f32 = 4e6;

/// Time in flight without range variation before it is declared stuck (us).
const RANGE_STUCK_WINDOW_US: u64 = 10_000_000;

/// Entry into range aid requires this fraction of the height and speed
/// limits, exit happens at the full limits.
const RANGE_AID_HYSTERESIS: f32 = 0.7;

/// Rate limit of the barometer offset tracking while another source is the
/// height reference (m/s).
const BARO_OFFSET_RATE_MAX: f32 = 0.1;

/// Which height sources could serve as the reference right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeightAvailability {
    pub baro: bool,
    pub gps: bool,
    pub range: bool,
    pub ev: bool,
    /// Conditions for using the range finder in place of the primary
    /// sensor are met.
    pub range_aid: bool,
}

/// Picks the height reference for the next cycle.
///
/// The primary sensor is used whenever it is available. Range aid may
/// replace a baro or GPS primary at low height and speed. When the primary
/// is lost the barometer is the fallback, and GPS is the fallback for a
/// lost barometer. With nothing usable the current source is kept.
pub fn select_height_source(
    primary: HeightSensor,
    avail: &HeightAvailability,
    current: HeightSensor,
) -> HeightSensor {
    use HeightSensor::*;
    let range_aid = avail.range_aid && avail.range;
    match primary {
        Baro if range_aid => Range,
        Baro if avail.baro => Baro,
        Baro if avail.gps => Gps,
        Range if avail.range => Range,
        Range if avail.baro => Baro,
        Gps if range_aid => Range,
        Gps if avail.gps => Gps,
        Gps if avail.baro => Baro,
        Vision if avail.ev => Vision,
        Vision if avail.baro => Baro,
        _ => current,
    }
}

/// Range finder health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RangeChecks {
    /// Earth Z component of the sensor axis; the cosine of its tilt.
    pub r_rng_to_earth_2_2: f32,
    /// Latest sample is out of limits or the sensor is tilted too far.
    pub rng_hgt_faulty: bool,
    pub range_data_continuous: bool,
    pub dt_last_range_update_filt_us: f32,
    pub time_last_rng_ready: TimeUs,
    pub stuck_window_start: TimeUs,
    pub stuck_min: f32,
    pub stuck_max: f32,
    /// Limits set by the host (m).
    pub valid_min: f32,
    pub valid_max: f32,
    /// Range aid was active on the previous cycle.
    pub range_aid_enabled: bool,
}

impl Default for RangeChecks {
    fn default() -> Self {
        Self {
            r_rng_to_earth_2_2: 1.0,
            rng_hgt_faulty: true,
            range_data_continuous: false,
            dt_last_range_update_filt_us: RANGE_INTERVAL_FILT_MAX_US,
            time_last_rng_ready: 0,
            stuck_window_start: 0,
            stuck_min: f32::MAX,
            stuck_max: f32::MIN,
            valid_min: 0.0,
            valid_max: f32::MAX,
            range_aid_enabled: false,
        }
    }
}

impl Ekf {
    // --- Range finder checks ---

    /// Continuity every cycle, validity whenever a new sample arrived.
    pub(crate) fn update_range_checks(&mut self) {
        let pitch = self.params.rng_sens_pitch;
        self.range_checks.r_rng_to_earth_2_2 =
            self.r_to_earth[(2, 0)] * -pitch.sin() + self.r_to_earth[(2, 2)] * pitch.cos();
        self.check_range_data_continuity();
        if self.delayed.range_ready {
            self.check_range_data_validity();
        }
    }

    /// Low passes the time since the last range sample; data is continuous
    /// while that stays below two seconds.
    pub(crate) fn check_range_data_continuity(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let alpha = constrain(0.5 * self.imu_sample_delayed.delta_vel_dt, 0.0, 1.0);
        let age = elapsed_us(now, self.delayed.range.time_us) as f32;
        let c = &mut self.range_checks;
        c.dt_last_range_update_filt_us = (c.dt_last_range_update_filt_us * (1.0 - alpha)
            + alpha * age)
            .min(RANGE_INTERVAL_FILT_MAX_US);
        c.range_data_continuous = c.dt_last_range_update_filt_us < RANGE_CONTINUITY_LIMIT_US;
    }

    /// Checks the delayed range sample against the sensor limits and tilt
    /// and watches for a sensor stuck on one reading.
    pub(crate) fn check_range_data_validity(&mut self) {
        let sample = self.delayed.range;
        let in_air = self.control.in_air;
        let tilt_ok = self.range_checks.r_rng_to_earth_2_2 > self.params.range_cos_max_tilt;
        let c = &mut self.range_checks;

        let in_limits = sample.rng >= c.valid_min && sample.rng <= c.valid_max;
        // On the ground a short reading is the sensor at its clearance.
        let on_ground_short = !in_air && sample.rng < c.valid_min;
        let was_faulty = c.rng_hgt_faulty;
        c.rng_hgt_faulty = !(tilt_ok && (in_limits || on_ground_short));
        if !c.rng_hgt_faulty {
            c.time_last_rng_ready = sample.time_us;
        }
        if c.rng_hgt_faulty != was_faulty {
            debug!(faulty = c.rng_hgt_faulty, rng = sample.rng, "range finder validity changed");
        }

        if !in_air {
            c.stuck_window_start = sample.time_us;
            c.stuck_min = sample.rng;
            c.stuck_max = sample.rng;
            self.control.rng_stuck = false;
            return;
        }
        c.stuck_min = c.stuck_min.min(sample.rng);
        c.stuck_max = c.stuck_max.max(sample.rng);
        if c.stuck_max - c.stuck_min > self.params.range_stuck_threshold {
            if self.control.rng_stuck {
                info!("range finder readings varying again");
            }
            self.control.rng_stuck = false;
            c.stuck_window_start = sample.time_us;
            c.stuck_min = sample.rng;
            c.stuck_max = sample.rng;
        } else if elapsed_us(sample.time_us, c.stuck_window_start) > RANGE_STUCK_WINDOW_US
            && !self.control.rng_stuck
        {
            warn!(rng = sample.rng, "range finder stuck");
            self.control.rng_stuck = true;
        }
    }

    /// Range data is continuous, within limits and not stuck.
    pub(crate) fn range_usable(&self) -> bool {
        self.range_checks.range_data_continuous
            && !self.range_checks.rng_hgt_faulty
            && !self.control.rng_stuck
    }

    /// Whether the range finder may replace the primary height sensor:
    /// in the air, close to the ground, slow, over a consistent terrain
    /// estimate. Entry uses tighter limits than exit.
    pub(crate) fn range_aid_conditions_met(&mut self) -> bool {
        let p = &self.params;
        let c = &self.range_checks;
        if !(p.range_aid && self.control.in_air && !c.rng_hgt_faulty) {
            self.range_checks.range_aid_enabled = false;
            return false;
        }

        let entry_scale = if c.range_aid_enabled { 1.0 } else { RANGE_AID_HYSTERESIS };
        let hagl = self.terrain.vpos() - self.store.state.pos[2];
        let mut can_use = hagl < entry_scale * p.max_hagl_for_range_aid && self.terrain.is_valid();

        let horz_vel_valid = (self.control.gps || self.control.ev_pos || self.control.opt_flow)
            && self.faults.value() == 0;
        if horz_vel_valid {
            let ground_speed = self.store.state.vel.xy().norm();
            can_use &= ground_speed < entry_scale * p.max_vel_for_range_aid;
        } else {
            can_use = false;
        }

        let ratio = if self.innov.hagl_var > 0.0 {
            test_ratio(self.innov.hagl, self.innov.hagl_var, p.range_aid_innov_gate.max(0.1))
        } else {
            f32::INFINITY
        };
        can_use &= if c.range_aid_enabled { ratio < 1.0 } else { ratio < 0.01 };

        self.range_checks.range_aid_enabled = can_use;
        can_use
    }

    // --- Height measurements ---

    /// Raw height of a source, positive up (m).
    fn sensor_height(&self, source: HeightSensor) -> Option<f32> {
        let d = &self.delayed;
        match source {
            HeightSensor::Baro => (d.baro.time_us > 0).then_some(d.baro.hgt),
            HeightSensor::Gps => {
                (d.gps.time_us > 0 && self.pos_ref.is_some()).then_some(d.gps.hgt)
            }
            HeightSensor::Range => (d.range.time_us > 0).then(|| {
                (d.range.rng * self.range_checks.r_rng_to_earth_2_2)
                    .max(self.params.rng_gnd_clearance)
            }),
            HeightSensor::Vision => {
                (d.ev.time_us > 0).then(|| -self.ev_position_ned(&d.ev.pos)[2])
            }
        }
    }

    fn height_offset(&self, source: HeightSensor) -> f32 {
        match source {
            HeightSensor::Baro => self.baro_hgt_offset,
            _ => self.hgt_sensor_offset,
        }
    }

    /// Down position measured by `source` on its current offset.
    pub(crate) fn latest_height_measurement(&self, source: HeightSensor) -> Option<f32> {
        self.sensor_height(source)
            .map(|h| -(h - self.height_offset(source)))
    }

    /// Observation variance of `source` for the delayed sample (m^2).
    pub(crate) fn height_obs_var(&self, source: HeightSensor) -> f32 {
        let p = &self.params;
        match source {
            HeightSensor::Baro => sq(p.baro_noise.max(0.01)),
            HeightSensor::Gps => {
                let lower = p.gps_pos_noise.max(0.01);
                let upper = p.pos_noaid_noise.max(lower);
                sq(1.5 * constrain(self.delayed.gps.vacc, lower, upper))
            }
            HeightSensor::Range => (sq(p.range_noise)
                + sq(p.range_noise_scaler * self.delayed.range.rng))
            .max(0.01),
            HeightSensor::Vision => sq(self.delayed.ev.pos_err.max(p.ev_pos_noise).max(0.01)),
        }
    }

    fn height_gate(&self, source: HeightSensor) -> f32 {
        let p = &self.params;
        match source {
            HeightSensor::Baro | HeightSensor::Gps => p.baro_innov_gate,
            HeightSensor::Range => p.range_innov_gate,
            HeightSensor::Vision => p.ev_innov_gate,
        }
        .max(1.0)
    }

    fn height_sample_ready(&self, source: HeightSensor) -> bool {
        let d = &self.delayed;
        match source {
            HeightSensor::Baro => d.baro_ready,
            HeightSensor::Gps => d.gps_ready && self.pos_ref.is_some(),
            HeightSensor::Range => d.range_ready && !self.range_checks.rng_hgt_faulty,
            HeightSensor::Vision => d.ev_ready,
        }
    }

    fn height_availability(&mut self) -> HeightAvailability {
        let now = self.time_last_imu;
        let recent = |arrival: TimeUs| arrival > 0 && elapsed_us(now, arrival) < SENSOR_DATA_TIMEOUT_US;
        HeightAvailability {
            baro: recent(self.arrivals.baro),
            gps: self.gps_height_usable(),
            range: self.range_usable(),
            ev: recent(self.arrivals.ev),
            range_aid: self.range_aid_conditions_met(),
        }
    }

    // --- Height control ---

    /// Selects the height reference, handles transitions and queues the
    /// delayed height observation for fusion.
    pub(crate) fn control_height_fusion(&mut self) {
        let avail = self.height_availability();
        let next = select_height_source(
            self.params.vdist_sensor_type,
            &avail,
            self.control.height_source,
        );
        if next != self.control.height_source {
            self.switch_height_source(next);
        }

        self.track_baro_offset();

        let source = self.control.height_source;
        if !self.height_sample_ready(source) {
            return;
        }
        let Some(measured) = self.latest_height_measurement(source) else {
            return;
        };

        let innov = measured - self.store.state.pos[2];
        if source == HeightSensor::Gps
            && self.params.hgt_reset_lim > 0.0
            && innov.abs() > self.params.hgt_reset_lim
        {
            warn!(innov, "GPS height innovation over reset limit");
            self.reset_height();
            return;
        }

        self.pending.height = Some(AxisObservation {
            measurement: [measured],
            obs_var: [self.height_obs_var(source)],
            gate: self.height_gate(source),
        });
    }

    /// Re-references the new source so the height stays continuous and
    /// restarts the vertical position uncertainty from that source.
    fn switch_height_source(&mut self, next: HeightSensor) {
        let previous = self.control.height_source;
        let pos_d = self.store.state.pos[2];
        if let Some(h) = self.sensor_height(next) {
            match next {
                HeightSensor::Baro => self.baro_hgt_offset = h + pos_d,
                _ => self.hgt_sensor_offset = h + pos_d,
            }
        }
        self.control.height_source = next;
        let var = self.height_obs_var(next);
        self.store.set_diag(POS_D..POS_D + 1, var);
        info!(from = ?previous, to = ?next, "height source changed");
    }

    /// Keeps the barometer offset following the estimate while another
    /// source is the reference, so a fall back to baro starts consistent.
    fn track_baro_offset(&mut self) {
        if self.control.baro_hgt() || !self.delayed.baro_ready {
            return;
        }
        let dt = self.imu_sample_delayed.delta_vel_dt;
        let error = self.delayed.baro.hgt + self.store.state.pos[2] - self.baro_hgt_offset;
        self.baro_hgt_offset +=
            dt * constrain(0.1 * error, -BARO_OFFSET_RATE_MAX, BARO_OFFSET_RATE_MAX);
    }

    /// Resets the height when it has not been fused for too long, moving to
    /// a fallback source first if the current one has gone quiet.
    pub(crate) fn control_height_sensor_timeouts(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        if elapsed_us(now, self.timers.last_hgt_fuse) <= HGT_FUSION_TIMEOUT_US {
            return;
        }

        let mut avail = self.height_availability();
        let current = self.control.height_source;
        match current {
            HeightSensor::Baro => avail.baro = false,
            HeightSensor::Gps => avail.gps = false,
            HeightSensor::Range => avail.range = false,
            HeightSensor::Vision => avail.ev = false,
        }
        if self.latest_height_measurement(current).is_none()
            || elapsed_us(now, self.height_sample_time(current)) > HGT_FUSION_TIMEOUT_US
        {
            let fallback = select_height_source(self.params.vdist_sensor_type, &avail, current);
            if fallback != current {
                self.switch_height_source(fallback);
            }
        }

        warn!(source = ?self.control.height_source, "height fusion timeout");
        self.reset_height();
        self.timers.last_hgt_fuse = now;
    }

    fn height_sample_time(&self, source: HeightSensor) -> TimeUs {
        let d = &self.delayed;
        match source {
            HeightSensor::Baro => d.baro.time_us,
            HeightSensor::Gps => d.gps.time_us,
            HeightSensor::Range => d.range.time_us,
            HeightSensor::Vision => d.ev.time_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HeightSensor::*;

    fn all() -> HeightAvailability {
        HeightAvailability {
            baro: true,
            gps: true,
            range: true,
            ev: true,
            range_aid: false,
        }
    }

    #[test]
    fn available_primary_is_used() {
        for primary in [Baro, Gps, Range, Vision] {
            assert_eq!(select_height_source(primary, &all(), Baro), primary);
        }
    }

    #[test]
    fn range_aid_replaces_baro_and_gps_only() {
        let avail = HeightAvailability {
            range_aid: true,
            ..all()
        };
        assert_eq!(select_height_source(Baro, &avail, Baro), Range);
        assert_eq!(select_height_source(Gps, &avail, Gps), Range);
        assert_eq!(select_height_source(Vision, &avail, Vision), Vision);

        let no_range = HeightAvailability { range: false, ..avail };
        assert_eq!(select_height_source(Baro, &no_range, Range), Baro);
    }

    #[test]
    fn lost_primary_falls_back() {
        let no_baro = HeightAvailability { baro: false, ..all() };
        assert_eq!(select_height_source(Baro, &no_baro, Baro), Gps);

        let no_range = HeightAvailability { range: false, ..all() };
        assert_eq!(select_height_source(Range, &no_range, Range), Baro);

        let no_ev = HeightAvailability { ev: false, ..all() };
        assert_eq!(select_height_source(Vision, &no_ev, Vision), Baro);
    }

    #[test]
    fn nothing_available_keeps_current() {
        let none = HeightAvailability::default();
        assert_eq!(select_height_source(Baro, &none, Gps), Gps);
        assert_eq!(select_height_source(Range, &none, Range), Range);
    }
}
