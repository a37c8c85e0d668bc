// ekf_core/src/estimation/interface.rs

//! Host facing surface of [`Ekf`]: sensor inputs, vehicle status setters and
//! the solution getters.
//!
//! Sensor samples carry the time they were measured in the IMU clock. Each
//! setter moves the sample back by the configured sensor delay plus half a
//! filter period and stores it until the fusion horizon reaches it. Samples
//! arriving faster than the delay lines can hold are dropped silently.

use nalgebra::{Matrix3, Matrix4};
use tracing::{debug, info};

use crate::errors::{EkfError, EkfResult};
use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::airspeed::air_relative_velocity;
use crate::estimation::reset::ResetStatus;
use crate::estimation::state::StateSample;
use crate::estimation::status::{
    solution_status, ControlStatus, FaultStatus, InnovationTestStatus,
};
use crate::frames::geo::{earth_rate_ned, MapProjection};
use crate::frames::layout::{POS, POS_D, POS_E, POS_N, QUAT, VEL, VEL_D, VEL_E, VEL_N, WIND};
use crate::frames::{normalized, quat_from_rotation_vector};
use crate::messages::{
    AirspeedSample, AuxVelSample, BaroSample, ExtVisionSample, FlowSample, GpsMessage, ImuSample,
    MagSample, OutputSample, RangeSample,
};
use crate::params::{fusion_mask, HeightSensor};
use crate::types::{
    constrain, elapsed_us, sq, Quatf, StateCovariance, StateVector, TimeUs, Vector2f, Vector3f,
};

/// Shortest accepted input IMU interval (s).
const IMU_DT_MIN: f32 = 1e-4;

/// Longest accepted input IMU interval (s).
const IMU_DT_MAX: f32 = 0.02;

/// WGS-84 origin of the local frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EkfOrigin {
    /// IMU time at which the origin was set (us).
    pub time_us: TimeUs,
    pub lat_deg: f64,
    pub lon_deg: f64,
    /// Altitude of the origin above mean sea level (m).
    pub alt: f32,
}

/// Limits a controller should respect to keep the current aiding sources
/// usable. `None` means no limit applies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlLimits {
    /// Horizontal ground speed (m/s).
    pub vxy_max: Option<f32>,
    /// Vertical speed (m/s).
    pub vz_max: Option<f32>,
    /// Height above ground (m).
    pub hagl_min: Option<f32>,
    pub hagl_max: Option<f32>,
}

fn finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
}

fn finite3(v: &Vector3f) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Rejects samples older than the previous one and drops samples that
/// arrive within `min_interval_us` of it.
fn admit(sensor: &'static str, time_us: TimeUs, last_us: TimeUs, min_interval_us: u64) -> EkfResult<bool> {
    if time_us < last_us {
        return Err(EkfError::OutOfOrderSample { sensor, time_us });
    }
    Ok(last_us == 0 || elapsed_us(time_us, last_us) > min_interval_us)
}

impl Ekf {
    // =====================================================================
    // == Sensor Inputs ==
    // =====================================================================

    /// Fusion horizon time of a sample measured at `time_us`.
    fn observation_time(&self, time_us: TimeUs, delay_ms: f32) -> TimeUs {
        let delay_us = (delay_ms * 1e3) as u64 + self.params.filter_update_period_us / 2;
        time_us
            .saturating_sub(delay_us)
            .max(self.imu_sample_delayed.time_us)
    }

    /// Adds a raw IMU sample. Call [`Ekf::update`] after every sample.
    pub fn set_imu_data(&mut self, imu: &ImuSample) -> EkfResult<()> {
        if !(finite3(&imu.delta_ang)
            && finite3(&imu.delta_vel)
            && finite(&[imu.delta_ang_dt, imu.delta_vel_dt])
            && imu.delta_ang_dt > 0.0
            && imu.delta_vel_dt > 0.0)
        {
            return Err(EkfError::InvalidSample { sensor: "imu" });
        }
        if self.time_last_imu > 0 && imu.time_us <= self.time_last_imu {
            return Err(EkfError::OutOfOrderSample { sensor: "imu", time_us: imu.time_us });
        }

        if self.time_last_imu > 0 {
            let dt = constrain(
                elapsed_us(imu.time_us, self.time_last_imu) as f32 * 1e-6,
                IMU_DT_MIN,
                IMU_DT_MAX,
            );
            self.dt_imu_avg = 0.8 * self.dt_imu_avg + 0.2 * dt;
        }
        self.time_last_imu = imu.time_us;
        self.imu_sample_new = *imu;

        let target_dt = self.params.filter_update_period_s();
        self.imu_updated = match self.imu_down_sampler.collect(imu, target_dt) {
            Some(sample) => {
                self.buffers.imu.push(sample);
                if let Some(oldest) = self.buffers.imu.oldest() {
                    self.imu_sample_delayed = *oldest;
                }
                let span = elapsed_us(imu.time_us, self.imu_sample_delayed.time_us);
                self.min_obs_interval_us = span / (self.obs_buffer_length as u64 - 1);
                true
            }
            None => false,
        };
        Ok(())
    }

    pub fn set_mag_data(&mut self, sample: &MagSample) -> EkfResult<()> {
        if !finite3(&sample.mag) {
            return Err(EkfError::InvalidSample { sensor: "mag" });
        }
        if !admit("mag", sample.time_us, self.arrivals.mag, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.mag = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.mag_delay_ms);
        self.buffers.mag.push(MagSample { time_us, ..*sample });
        Ok(())
    }

    /// Adds a barometric height sample (m, positive up).
    pub fn set_baro_data(&mut self, sample: &BaroSample) -> EkfResult<()> {
        if !sample.hgt.is_finite() {
            return Err(EkfError::InvalidSample { sensor: "baro" });
        }
        if !admit("baro", sample.time_us, self.arrivals.baro, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.baro = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.baro_delay_ms);
        self.buffers.baro.push(BaroSample { time_us, ..*sample });
        Ok(())
    }

    /// Adds a GPS solution. The quality checks run on every message; only
    /// messages accepted once the origin is set are stored for fusion.
    pub fn set_gps_data(&mut self, gps: &GpsMessage) -> EkfResult<()> {
        let need_gps = self.params.uses(fusion_mask::USE_GPS)
            || self.params.vdist_sensor_type == HeightSensor::Gps;
        if !need_gps {
            return Ok(());
        }
        if !(gps.lat.is_finite()
            && gps.lon.is_finite()
            && finite(&[gps.alt, gps.eph, gps.epv, gps.sacc, gps.pdop])
            && finite3(&gps.vel_ned))
        {
            return Err(EkfError::InvalidSample { sensor: "gps" });
        }
        if !admit("gps", gps.time_us, self.arrivals.gps, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.gps = gps.time_us;

        if self.collect_gps(gps) {
            let time_us = self.observation_time(gps.time_us, self.params.gps_delay_ms);
            if let Some(sample) = self.gps_sample_from(gps, time_us) {
                self.buffers.gps.push(sample);
            }
        }
        Ok(())
    }

    /// Adds a range finder sample (m, along the sensor axis).
    pub fn set_range_data(&mut self, sample: &RangeSample) -> EkfResult<()> {
        if !sample.rng.is_finite() {
            return Err(EkfError::InvalidSample { sensor: "range" });
        }
        if !admit("range", sample.time_us, self.arrivals.range, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.range = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.range_delay_ms);
        self.buffers.range.push(RangeSample { time_us, ..*sample });
        Ok(())
    }

    /// Adds an optical flow sample. Samples with too short an integration
    /// time, poor quality or a saturated rate are dropped in flight; on the
    /// ground poor quality is stored as zero flow.
    pub fn set_optical_flow_data(&mut self, sample: &FlowSample) -> EkfResult<()> {
        if !(finite(&[sample.flow_xy_rad[0], sample.flow_xy_rad[1], sample.dt])
            && finite3(&sample.gyro_xyz))
        {
            return Err(EkfError::InvalidSample { sensor: "flow" });
        }
        if !admit("flow", sample.time_us, self.arrivals.flow, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.flow = sample.time_us;

        let dt_min = 0.5e-6 * self.min_obs_interval_us as f32;
        let dt_good = sample.dt >= dt_min;
        let dt = sample.dt.max(dt_min).max(1e-4);
        let rate_good = !dt_good || sample.flow_xy_rad.norm() / dt <= self.flow.max_rate;
        let quality_good = sample.quality >= self.params.flow_qual_min;
        let relying_on_flow = !self.control.gps && !self.control.ev_pos;

        if !((dt_good && quality_good && (rate_good || relying_on_flow)) || !self.control.in_air) {
            return Ok(());
        }
        let flow_xy_rad = if !quality_good && !self.control.in_air {
            Vector2f::zeros()
        } else {
            sample.flow_xy_rad
        };
        let time_us = self.observation_time(sample.time_us, self.params.flow_delay_ms);
        self.buffers.flow.push(FlowSample {
            time_us,
            flow_xy_rad,
            dt,
            ..*sample
        });
        Ok(())
    }

    pub fn set_airspeed_data(&mut self, sample: &AirspeedSample) -> EkfResult<()> {
        if !finite(&[sample.true_airspeed, sample.eas2tas]) {
            return Err(EkfError::InvalidSample { sensor: "airspeed" });
        }
        if !admit("airspeed", sample.time_us, self.arrivals.airspeed, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.airspeed = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.airspeed_delay_ms);
        self.buffers.airspeed.push(AirspeedSample { time_us, ..*sample });
        Ok(())
    }

    /// Adds an external vision pose in the vision reference frame.
    pub fn set_ext_vision_data(&mut self, sample: &ExtVisionSample) -> EkfResult<()> {
        let q = &sample.quat;
        if !(finite3(&sample.pos) && finite(&[q.w, q.i, q.j, q.k, sample.pos_err, sample.ang_err])) {
            return Err(EkfError::InvalidSample { sensor: "external vision" });
        }
        if !admit("external vision", sample.time_us, self.arrivals.ev, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.ev = sample.time_us;
        self.timers.last_ext_vision = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.ev_delay_ms);
        self.buffers.ev.push(ExtVisionSample {
            time_us,
            quat: normalized(&sample.quat),
            ..*sample
        });
        Ok(())
    }

    /// Adds a horizontal velocity from an auxiliary source (m/s, NE).
    pub fn set_aux_vel_data(&mut self, sample: &AuxVelSample) -> EkfResult<()> {
        let v = [
            sample.vel_ne[0],
            sample.vel_ne[1],
            sample.vel_var_ne[0],
            sample.vel_var_ne[1],
        ];
        if !finite(&v) {
            return Err(EkfError::InvalidSample { sensor: "auxiliary velocity" });
        }
        if !admit("auxiliary velocity", sample.time_us, self.arrivals.aux_vel, self.min_obs_interval_us)? {
            return Ok(());
        }
        self.arrivals.aux_vel = sample.time_us;
        let time_us = self.observation_time(sample.time_us, self.params.aux_vel_delay_ms);
        self.buffers.aux_vel.push(AuxVelSample { time_us, ..*sample });
        Ok(())
    }

    // =====================================================================
    // == Vehicle Status ==
    // =====================================================================

    pub fn set_in_air_status(&mut self, in_air: bool) {
        if in_air != self.control.in_air {
            debug!(in_air, "in air status changed");
        }
        self.control.in_air = in_air;
    }

    pub fn set_is_fixed_wing(&mut self, fixed_wing: bool) {
        self.control.fixed_wing = fixed_wing;
    }

    pub fn set_vehicle_at_rest(&mut self, at_rest: bool) {
        self.control.vehicle_at_rest = at_rest;
    }

    /// Sets the air density used by drag fusion (kg/m^3).
    pub fn set_air_density(&mut self, air_density: f32) {
        if air_density.is_finite() && air_density > 0.0 {
            self.air_density = air_density;
        }
    }

    /// Sets the valid measurement range of the range finder (m).
    pub fn set_rangefinder_limits(&mut self, min_distance: f32, max_distance: f32) {
        self.range_checks.valid_min = min_distance;
        self.range_checks.valid_max = max_distance;
    }

    /// Sets the largest measurable flow rate (rad/s) and the height range
    /// over which the flow sensor focuses (m).
    pub fn set_optical_flow_limits(&mut self, max_flow_rate: f32, min_distance: f32, max_distance: f32) {
        self.flow.max_rate = max_flow_rate;
        self.flow.min_distance = min_distance;
        self.flow.max_distance = max_distance;
    }

    // =====================================================================
    // == Origin ==
    // =====================================================================

    pub fn get_ekf_origin(&self) -> Option<EkfOrigin> {
        self.pos_ref.as_ref().map(|origin| EkfOrigin {
            time_us: origin.timestamp_us,
            lat_deg: origin.lat_deg(),
            lon_deg: origin.lon_deg(),
            alt: self.gps_alt_ref,
        })
    }

    /// Sets the WGS-84 origin of the local frame. The origin can be set only
    /// once, whether by the host or by the first GPS fix that passes its
    /// checks.
    pub fn set_ekf_origin(&mut self, lat_deg: f64, lon_deg: f64, alt: f32) -> EkfResult<()> {
        if self.pos_ref.is_some() {
            return Err(EkfError::OriginAlreadySet);
        }
        if !(lat_deg.is_finite() && lon_deg.is_finite() && alt.is_finite()) {
            return Err(EkfError::InvalidParameter {
                name: "origin",
                reason: "coordinates must be finite",
            });
        }
        let origin = MapProjection::new(lat_deg, lon_deg, self.time_last_imu);
        self.pos_ref = Some(origin);
        self.gps_alt_ref = alt;
        self.earth_rate_ned = earth_rate_ned(lat_deg.to_radians() as f32);
        info!(lat_deg, lon_deg, alt, "origin set by host");
        Ok(())
    }

    // =====================================================================
    // == Innovations ==
    // =====================================================================

    pub fn get_vel_pos_innov(&self) -> [f32; 6] {
        self.innov.vel_pos
    }

    pub fn get_vel_pos_innov_var(&self) -> [f32; 6] {
        self.innov.vel_pos_var
    }

    pub fn get_aux_vel_innov(&self) -> [f32; 2] {
        self.innov.aux_vel
    }

    pub fn get_mag_innov(&self) -> [f32; 3] {
        self.innov.mag
    }

    pub fn get_mag_innov_var(&self) -> [f32; 3] {
        self.innov.mag_var
    }

    pub fn get_heading_innov(&self) -> f32 {
        self.innov.heading
    }

    pub fn get_heading_innov_var(&self) -> f32 {
        self.innov.heading_var
    }

    pub fn get_airspeed_innov(&self) -> f32 {
        self.innov.airspeed
    }

    pub fn get_airspeed_innov_var(&self) -> f32 {
        self.innov.airspeed_var
    }

    pub fn get_beta_innov(&self) -> f32 {
        self.innov.beta
    }

    pub fn get_beta_innov_var(&self) -> f32 {
        self.innov.beta_var
    }

    pub fn get_flow_innov(&self) -> [f32; 2] {
        self.innov.flow
    }

    pub fn get_flow_innov_var(&self) -> [f32; 2] {
        self.innov.flow_var
    }

    pub fn get_drag_innov(&self) -> [f32; 2] {
        self.innov.drag
    }

    pub fn get_drag_innov_var(&self) -> [f32; 2] {
        self.innov.drag_var
    }

    pub fn get_hagl_innov(&self) -> f32 {
        self.innov.hagl
    }

    pub fn get_hagl_innov_var(&self) -> f32 {
        self.innov.hagl_var
    }

    /// Failed innovation checks plus the normalised innovation magnitude of
    /// each class, the square root of its largest test ratio.
    pub fn get_innovation_test_status(&self) -> InnovationTestStatus {
        let r = &self.innov;
        let max = |values: &[f32]| values.iter().copied().fold(0.0_f32, f32::max);
        InnovationTestStatus {
            status: self.innov_check_fail_status,
            mag: max(&[r.mag_test_ratio[0], r.mag_test_ratio[1], r.mag_test_ratio[2], r.yaw_test_ratio])
                .sqrt(),
            vel: max(&r.vel_pos_test_ratio[0..3]).sqrt(),
            pos: max(&r.vel_pos_test_ratio[3..5]).sqrt(),
            hgt: r.vel_pos_test_ratio[5].sqrt(),
            tas: r.tas_test_ratio.sqrt(),
            hagl: r.hagl_test_ratio.sqrt(),
            beta: r.beta_test_ratio.sqrt(),
        }
    }

    // =====================================================================
    // == Status ==
    // =====================================================================

    pub fn control_status(&self) -> &ControlStatus {
        &self.control
    }

    pub fn fault_status(&self) -> &FaultStatus {
        &self.faults
    }

    /// The horizontal solution is supported by nothing but the inertial
    /// prediction.
    pub fn inertial_dead_reckoning(&self) -> bool {
        self.aiding.is_dead_reckoning
    }

    /// The filter fuses the last known position in place of real aiding.
    pub fn using_synthetic_position(&self) -> bool {
        self.aiding.using_synthetic_position
    }

    /// [`solution_status`] bits describing which parts of the solution are
    /// usable.
    pub fn get_ekf_soln_status(&self) -> u16 {
        use solution_status::*;
        let c = &self.control;
        let no_faults = self.faults.value() == 0;
        let r = &self.innov;

        let attitude = c.tilt_align && c.yaw_align && no_faults;
        let vel_horiz = (c.gps || c.ev_pos || c.opt_flow || (c.fuse_beta && c.fuse_aspd)) && no_faults;
        let vel_vert = no_faults;
        let pos_horiz_rel = (c.gps || c.ev_pos || c.opt_flow) && no_faults;
        let pos_horiz_abs = (c.gps || c.ev_pos) && no_faults;

        let gps_vel_bad = r.vel_pos_test_ratio[0] > 1.0 || r.vel_pos_test_ratio[1] > 1.0;
        let gps_pos_bad = r.vel_pos_test_ratio[3] > 1.0 || r.vel_pos_test_ratio[4] > 1.0;
        let mag_good = r.mag_test_ratio.iter().all(|t| *t < 1.0) && r.yaw_test_ratio < 1.0;

        [
            (ATTITUDE, attitude),
            (VELOCITY_HORIZ, vel_horiz),
            (VELOCITY_VERT, vel_vert),
            (POS_HORIZ_REL, pos_horiz_rel),
            (POS_HORIZ_ABS, pos_horiz_abs),
            (POS_VERT_ABS, vel_vert),
            (POS_VERT_AGL, self.terrain.is_valid()),
            (CONST_POS_MODE, !vel_horiz),
            (PRED_POS_HORIZ_REL, pos_horiz_rel),
            (PRED_POS_HORIZ_ABS, pos_horiz_abs),
            (GPS_GLITCH, (gps_vel_bad || gps_pos_bad) && mag_good),
            (ACCEL_ERROR, self.bad_vert_accel_detected),
        ]
        .into_iter()
        .filter(|(_, set)| *set)
        .fold(0, |acc, (bit, _)| acc | bit)
    }

    // =====================================================================
    // == State and Covariance ==
    // =====================================================================

    /// Delayed state, corrected by the latest fusion.
    pub fn state(&self) -> &StateSample {
        &self.store.state
    }

    pub fn get_state_delayed(&self) -> StateVector {
        self.store.state.to_vector()
    }

    pub fn covariances(&self) -> &StateCovariance {
        &self.store.p
    }

    pub fn covariances_diagonal(&self) -> StateVector {
        self.store.diagonal()
    }

    pub fn orientation_covariances(&self) -> Matrix4<f32> {
        self.store.p.fixed_view::<4, 4>(QUAT, QUAT).into_owned()
    }

    pub fn velocity_covariances(&self) -> Matrix3<f32> {
        self.store.p.fixed_view::<3, 3>(VEL, VEL).into_owned()
    }

    pub fn position_covariances(&self) -> Matrix3<f32> {
        self.store.p.fixed_view::<3, 3>(POS, POS).into_owned()
    }

    pub fn get_vel_var(&self) -> Vector3f {
        let p = &self.store.p;
        Vector3f::new(p[(VEL_N, VEL_N)], p[(VEL_E, VEL_E)], p[(VEL_D, VEL_D)])
    }

    pub fn get_pos_var(&self) -> Vector3f {
        let p = &self.store.p;
        Vector3f::new(p[(POS_N, POS_N)], p[(POS_E, POS_E)], p[(POS_D, POS_D)])
    }

    /// Gyro bias (rad/s).
    pub fn get_gyro_bias(&self) -> Vector3f {
        self.store.state.delta_ang_bias / self.dt_ekf_avg
    }

    /// Accelerometer bias (m/s^2).
    pub fn get_accel_bias(&self) -> Vector3f {
        self.store.state.delta_vel_bias / self.dt_ekf_avg
    }

    pub fn get_wind_velocity(&self) -> Vector2f {
        self.store.state.wind_vel
    }

    pub fn get_wind_velocity_var(&self) -> Vector2f {
        Vector2f::new(self.store.p[(WIND, WIND)], self.store.p[(WIND + 1, WIND + 1)])
    }

    pub fn get_true_airspeed(&self) -> f32 {
        air_relative_velocity(&self.store.state).norm()
    }

    /// Coning, high frequency gyro and high frequency accel vibration.
    pub fn get_imu_vibe_metrics(&self) -> [f32; 3] {
        self.imu_down_sampler.vibe_metrics
    }

    /// Horizontal and vertical position accuracy (m). While dead reckoning
    /// on a position source the rejected innovations bound the horizontal
    /// error from below.
    pub fn get_ekf_lpos_accuracy(&self) -> (f32, f32) {
        let p = &self.store.p;
        let mut hpos_err = (p[(POS_N, POS_N)] + p[(POS_E, POS_E)]).sqrt();
        if self.aiding.is_dead_reckoning && (self.control.gps || self.control.ev_pos) {
            let innov = &self.innov.vel_pos;
            hpos_err = hpos_err.max((sq(innov[3]) + sq(innov[4])).sqrt());
        }
        (hpos_err, p[(POS_D, POS_D)].sqrt())
    }

    /// Horizontal and vertical velocity accuracy (m/s).
    pub fn get_ekf_vel_accuracy(&self) -> (f32, f32) {
        let p = &self.store.p;
        let mut hvel_err = (p[(VEL_N, VEL_N)] + p[(VEL_E, VEL_E)]).sqrt();
        if self.aiding.is_dead_reckoning {
            let mut conservative = 0.0_f32;
            if self.control.opt_flow {
                let clearance = self.params.rng_gnd_clearance.max(0.1);
                let hagl = (self.terrain.vpos() - self.store.state.pos[2]).max(clearance);
                let flow = &self.innov.flow;
                conservative = hagl * (sq(flow[0]) + sq(flow[1])).sqrt();
            }
            if self.control.gps || self.control.ev_pos {
                let innov = &self.innov.vel_pos;
                conservative = conservative.max((sq(innov[0]) + sq(innov[1])).sqrt());
            }
            hvel_err = hvel_err.max(conservative);
        }
        (hvel_err, p[(VEL_D, VEL_D)].sqrt())
    }

    /// Limits that keep the range finder and optical flow within their
    /// working envelope while the solution depends on them.
    pub fn get_ekf_ctrl_limits(&self) -> ControlLimits {
        let rng_hagl_min = self.range_checks.valid_min;
        // Leave a quarter of the range for angular motion.
        let rng_hagl_max = 0.75 * self.range_checks.valid_max;
        let hagl = self.terrain.vpos() - self.store.state.pos[2];
        let flow_vxy_max = (0.5 * self.flow.max_rate * hagl).max(0.0);

        let mut limits = ControlLimits::default();
        if self.control.rng_hgt() {
            limits.hagl_min = Some(rng_hagl_min);
            limits.hagl_max = Some(rng_hagl_max);
        }
        if self.control.opt_flow && !(self.control.gps || self.control.ev_pos) {
            limits.vxy_max = Some(flow_vxy_max);
            limits.hagl_min = Some(rng_hagl_min.max(self.flow.min_distance));
            limits.hagl_max = Some(rng_hagl_max.min(self.flow.max_distance));
        }
        limits
    }

    // =====================================================================
    // == Terrain ==
    // =====================================================================

    pub fn get_terrain_valid(&self) -> bool {
        self.terrain.is_valid()
    }

    /// Vertical position of the terrain (m, NED).
    pub fn get_terrain_vert_pos(&self) -> f32 {
        self.terrain.vpos()
    }

    pub fn get_terrain_var(&self) -> f32 {
        self.terrain.var()
    }

    // =====================================================================
    // == Resets ==
    // =====================================================================

    pub fn reset_status(&self) -> &ResetStatus {
        &self.reset
    }

    pub fn get_pos_d_reset(&self) -> (f32, u8) {
        (self.reset.pos_d_change, self.reset.pos_d_counter)
    }

    pub fn get_vel_d_reset(&self) -> (f32, u8) {
        (self.reset.vel_d_change, self.reset.vel_d_counter)
    }

    pub fn get_pos_ne_reset(&self) -> (Vector2f, u8) {
        (self.reset.pos_ne_change, self.reset.pos_ne_counter)
    }

    pub fn get_vel_ne_reset(&self) -> (Vector2f, u8) {
        (self.reset.vel_ne_change, self.reset.vel_ne_counter)
    }

    /// Body frame quaternion step of the last yaw reset, with
    /// `q_post = q_pre * delta`.
    pub fn get_quat_reset(&self) -> (Quatf, u8) {
        (self.reset.quat_change, self.reset.quat_counter)
    }

    // =====================================================================
    // == Real-time Output ==
    // =====================================================================

    /// Latest real-time solution at the newest IMU sample.
    pub fn output(&self) -> &OutputSample {
        self.output.output()
    }

    pub fn get_quaternion(&self) -> Quatf {
        self.output.output().quat_nominal
    }

    pub fn get_velocity(&self) -> Vector3f {
        self.output.output().vel
    }

    pub fn get_position(&self) -> Vector3f {
        self.output.output().pos
    }

    /// NED acceleration of the real-time solution (m/s^2).
    pub fn get_vel_deriv_ned(&self) -> Vector3f {
        *self.output.vel_deriv_ned()
    }

    /// Attitude, velocity and position tracking error magnitudes of the
    /// output predictor.
    pub fn get_output_tracking_error(&self) -> [f32; 3] {
        self.output.tracking_error()
    }

    /// Real-time attitude advanced by the newest IMU sample, for hosts that
    /// publish attitude before calling [`Ekf::update`] on that sample.
    pub fn calculate_quaternion(&self) -> Quatf {
        let imu = &self.imu_sample_new;
        let scale = if self.dt_ekf_avg > 0.0 {
            self.dt_imu_avg / self.dt_ekf_avg
        } else {
            0.0
        };
        let delta_angle =
            imu.delta_ang - self.store.state.delta_ang_bias * scale + self.output.delta_angle_corr();
        normalized(&(self.output.output().quat_nominal * quat_from_rotation_vector(&delta_angle)))
    }

    /// Rotation from the navigation frame to the external vision frame.
    pub fn get_ekf2ev_quaternion(&self) -> Quatf {
        self.ekf_to_ev_quaternion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EkfParams;

    fn ekf() -> Ekf {
        Ekf::new(EkfParams::default()).expect("default parameters are valid")
    }

    #[test]
    fn non_finite_samples_are_refused() {
        let mut ekf = ekf();
        let imu = ImuSample {
            delta_ang: Vector3f::new(f32::NAN, 0.0, 0.0),
            time_us: 1_000,
            ..Default::default()
        };
        assert_eq!(ekf.set_imu_data(&imu), Err(EkfError::InvalidSample { sensor: "imu" }));
        let baro = BaroSample { time_us: 1_000, hgt: f32::INFINITY };
        assert!(matches!(ekf.set_baro_data(&baro), Err(EkfError::InvalidSample { .. })));
    }

    #[test]
    fn imu_sample_needs_a_positive_interval() {
        let mut ekf = ekf();
        let imu = ImuSample {
            time_us: 4_000,
            delta_vel: Vector3f::new(0.0, 0.0, -0.04),
            delta_ang_dt: 0.004,
            delta_vel_dt: 0.0,
            ..Default::default()
        };
        assert_eq!(ekf.set_imu_data(&imu), Err(EkfError::InvalidSample { sensor: "imu" }));
        let imu = ImuSample { delta_ang_dt: -0.004, delta_vel_dt: 0.004, ..imu };
        assert_eq!(ekf.set_imu_data(&imu), Err(EkfError::InvalidSample { sensor: "imu" }));
        assert_eq!(ekf.time_last_imu, 0);

        let imu = ImuSample { delta_ang_dt: 0.004, ..imu };
        assert_eq!(ekf.set_imu_data(&imu), Ok(()));
    }

    #[test]
    fn backwards_samples_are_refused() {
        let mut ekf = ekf();
        ekf.set_baro_data(&BaroSample { time_us: 50_000, hgt: 0.0 })
            .expect("first sample");
        assert_eq!(
            ekf.set_baro_data(&BaroSample { time_us: 40_000, hgt: 0.0 }),
            Err(EkfError::OutOfOrderSample { sensor: "baro", time_us: 40_000 })
        );
    }

    #[test]
    fn origin_can_only_be_set_once() {
        let mut ekf = ekf();
        assert!(ekf.get_ekf_origin().is_none());
        ekf.set_ekf_origin(47.4, 8.5, 400.0).expect("first origin");
        let origin = ekf.get_ekf_origin().expect("origin set");
        assert_eq!(origin.lat_deg, 47.4);
        assert_eq!(origin.alt, 400.0);
        assert_eq!(ekf.set_ekf_origin(0.0, 0.0, 0.0), Err(EkfError::OriginAlreadySet));
    }

    #[test]
    fn no_control_limits_without_range_or_flow_reliance() {
        let ekf = ekf();
        assert_eq!(ekf.get_ekf_ctrl_limits(), ControlLimits::default());
    }

    #[test]
    fn samples_are_moved_back_by_their_delay() {
        let ekf = ekf();
        let period = ekf.params.filter_update_period_us;
        assert_eq!(ekf.observation_time(500_000, 110.0), 500_000 - 110_000 - period / 2);
        assert_eq!(ekf.observation_time(1_000, 110.0), 0);
    }
}
