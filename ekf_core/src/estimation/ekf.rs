// ekf_core/src/estimation/ekf.rs

//! The filter instance.
//!
//! [`Ekf`] owns every component of the estimator: the state store, the
//! sensor delay lines, the mode controller bookkeeping, the terrain
//! estimator and the output predictor. All state lives in the instance, so
//! several filters can run side by side. A host feeds samples through the
//! `set_*` methods, calls [`Ekf::update`] after every IMU sample and reads
//! the solution back through the getters in [`crate::estimation::interface`].

use tracing::{debug, info};

use crate::buffers::ObservationBuffer;
use crate::errors::{EkfError, EkfResult};
use crate::estimation::control::aiding::ExtVisionFrame;
use crate::estimation::control::air_data::DragSampler;
use crate::estimation::control::gps::GpsChecks;
use crate::estimation::control::height::RangeChecks;
use crate::estimation::control::mag::MagControl;
use crate::estimation::control::{AidingStatus, FusionTimers};
use crate::estimation::fusion::optflow::FlowState;
use crate::estimation::fusion::vel_pos::VelPosObservations;
use crate::estimation::fusion::Innovations;
use crate::estimation::output::{OutputPredictor, TrackingGains, DELAY_BUFFER_CAPACITY};
use crate::estimation::predictor::ImuDownSampler;
use crate::estimation::reset::ResetStatus;
use crate::estimation::state::{StateSample, StateStore};
use crate::estimation::status::{ControlStatus, FaultStatus};
use crate::estimation::terrain::TerrainEstimator;
use crate::frames::geo::MapProjection;
use crate::frames::layout::{DANG_BIAS, DVEL_BIAS, MAG_I, POS_D, POS_N, VEL_D, VEL_N, WIND};
use crate::frames::{quat_from_euler, quat_to_dcm};
use crate::messages::{
    AirspeedSample, AuxVelSample, BaroSample, ExtVisionSample, FlowSample, GpsSample, ImuSample,
    MagSample, RangeSample,
};
use crate::params::{fusion_mask, EkfParams, HeightSensor, MagFuseType};
use crate::types::{sq, Matrix3f, TimeUs, Vector2f, Vector3f};

// --- Sensor bookkeeping ---

/// Delay lines holding samples until they reach the fusion horizon.
#[derive(Debug, Clone)]
pub(crate) struct SensorBuffers {
    pub imu: ObservationBuffer<ImuSample, DELAY_BUFFER_CAPACITY>,
    pub gps: ObservationBuffer<GpsSample, DELAY_BUFFER_CAPACITY>,
    pub mag: ObservationBuffer<MagSample, DELAY_BUFFER_CAPACITY>,
    pub baro: ObservationBuffer<BaroSample, DELAY_BUFFER_CAPACITY>,
    pub range: ObservationBuffer<RangeSample, DELAY_BUFFER_CAPACITY>,
    pub flow: ObservationBuffer<FlowSample, DELAY_BUFFER_CAPACITY>,
    pub airspeed: ObservationBuffer<AirspeedSample, DELAY_BUFFER_CAPACITY>,
    pub ev: ObservationBuffer<ExtVisionSample, DELAY_BUFFER_CAPACITY>,
    pub aux_vel: ObservationBuffer<AuxVelSample, DELAY_BUFFER_CAPACITY>,
}

impl SensorBuffers {
    fn new(imu_length: usize, obs_length: usize) -> Self {
        Self {
            imu: ObservationBuffer::with_length(imu_length),
            gps: ObservationBuffer::with_length(obs_length),
            mag: ObservationBuffer::with_length(obs_length),
            baro: ObservationBuffer::with_length(obs_length),
            range: ObservationBuffer::with_length(obs_length),
            flow: ObservationBuffer::with_length(obs_length),
            airspeed: ObservationBuffer::with_length(obs_length),
            ev: ObservationBuffer::with_length(obs_length),
            aux_vel: ObservationBuffer::with_length(obs_length),
        }
    }
}

/// Time each sensor last delivered data, in the IMU clock (us).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SensorArrivals {
    pub gps: TimeUs,
    pub mag: TimeUs,
    pub baro: TimeUs,
    pub range: TimeUs,
    pub flow: TimeUs,
    pub airspeed: TimeUs,
    pub ev: TimeUs,
    pub aux_vel: TimeUs,
}

/// The samples that reached the fusion horizon, with flags marking the ones
/// that are new this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct DelayedSamples {
    pub gps: GpsSample,
    pub gps_ready: bool,
    pub mag: MagSample,
    pub mag_ready: bool,
    pub baro: BaroSample,
    pub baro_ready: bool,
    pub range: RangeSample,
    pub range_ready: bool,
    pub flow: FlowSample,
    pub flow_ready: bool,
    pub airspeed: AirspeedSample,
    /// A new airspeed sample above the usable threshold.
    pub tas_ready: bool,
    pub ev: ExtVisionSample,
    pub ev_ready: bool,
    pub aux_vel: AuxVelSample,
    pub aux_vel_ready: bool,
}

/// Sensor averages collected while waiting to initialise.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct InitAccumulator {
    pub del_vel_sum: Vector3f,
    pub mag_filt: Vector3f,
    pub mag_count: usize,
    pub baro_filt: f32,
    pub baro_count: usize,
    pub range_filt: f32,
    pub range_count: usize,
    pub ev_count: usize,
}

impl InitAccumulator {
    /// The first readings after start-up are replaced rather than averaged
    /// until `settle` samples have been seen.
    fn blend(filt: f32, sample: f32, count: usize, settle: usize) -> f32 {
        if count <= settle {
            sample
        } else {
            0.9 * filt + 0.1 * sample
        }
    }
}

// =========================================================================
// == Filter Instance ==
// =========================================================================

/// A 24 state delayed-horizon navigation filter.
#[derive(Debug, Clone)]
pub struct Ekf {
    pub(crate) params: EkfParams,
    pub(crate) store: StateStore,
    pub(crate) filter_initialised: bool,
    pub(crate) start_time_us: TimeUs,
    /// Length of the IMU and output delay lines.
    pub(crate) imu_buffer_length: usize,
    /// Length of the observation delay lines.
    pub(crate) obs_buffer_length: usize,

    // --- Timing ---
    pub(crate) dt_ekf_avg: f32,
    pub(crate) dt_imu_avg: f32,
    pub(crate) time_last_imu: TimeUs,
    /// Observations arriving faster than this are dropped (us).
    pub(crate) min_obs_interval_us: u64,

    // --- Inertial data ---
    pub(crate) imu_down_sampler: ImuDownSampler,
    /// Newest raw IMU sample.
    pub(crate) imu_sample_new: ImuSample,
    /// Down-sampled IMU sample at the fusion horizon.
    pub(crate) imu_sample_delayed: ImuSample,
    /// A down-sampled sample was completed by the last IMU input.
    pub(crate) imu_updated: bool,
    pub(crate) r_to_earth: Matrix3f,
    pub(crate) earth_rate_ned: Vector3f,

    // --- Sensor data ---
    pub(crate) buffers: SensorBuffers,
    pub(crate) arrivals: SensorArrivals,
    pub(crate) delayed: DelayedSamples,
    pub(crate) init_accum: InitAccumulator,

    // --- Status ---
    pub(crate) control: ControlStatus,
    pub(crate) control_prev: ControlStatus,
    pub(crate) faults: FaultStatus,
    pub(crate) innov: Innovations,
    pub(crate) innov_check_fail_status: u16,
    pub(crate) timers: FusionTimers,
    pub(crate) reset: ResetStatus,
    pub(crate) aiding: AidingStatus,

    // --- Predictor by-products ---
    /// Filtered earth frame horizontal delta velocity (m/s).
    pub(crate) accel_lpf_ne: Vector2f,
    /// Filtered earth frame yaw rate (rad/s).
    pub(crate) yaw_rate_lpf_ef: f32,
    pub(crate) accel_bias_inhibit: bool,
    pub(crate) ang_rate_mag_filt: f32,
    pub(crate) accel_mag_filt: f32,
    /// Accel bias variances saved while learning is inhibited.
    pub(crate) prev_dvel_bias_var: Vector3f,
    pub(crate) bad_vert_accel_detected: bool,
    pub(crate) time_bad_vert_accel: TimeUs,

    // --- Components ---
    pub(crate) output: OutputPredictor,
    pub(crate) terrain: TerrainEstimator,
    pub(crate) flow: FlowState,
    pub(crate) gps_checks: GpsChecks,
    pub(crate) range_checks: RangeChecks,
    pub(crate) mag_ctrl: MagControl,
    pub(crate) ev_frame: ExtVisionFrame,
    pub(crate) drag_sampler: DragSampler,
    /// Observations queued by the source controllers this cycle.
    pub(crate) pending: VelPosObservations,

    // --- Reference frame ---
    pub(crate) pos_ref: Option<MapProjection>,
    /// GPS altitude of the local origin (m).
    pub(crate) gps_alt_ref: f32,
    pub(crate) baro_hgt_offset: f32,
    /// Offset shared by the GPS, range and vision height sources (m).
    pub(crate) hgt_sensor_offset: f32,
    pub(crate) last_on_ground_pos_d: f32,
    pub(crate) last_known_pos_ne: Vector2f,

    // --- Host supplied ---
    /// Air density (kg/m^3).
    pub(crate) air_density: f32,
    pub(crate) time_last_imu_bias_reset: Option<TimeUs>,
}

impl Ekf {
    /// Creates a filter after validating `params`. The filter initialises
    /// itself from sensor data once enough has arrived.
    pub fn new(params: EkfParams) -> EkfResult<Self> {
        params.validate()?;
        let period_ms = params.filter_update_period_us as f32 * 1e-3;
        let imu_buffer_length = (params.max_delay_ms() / period_ms).ceil() as usize + 1;
        if imu_buffer_length > DELAY_BUFFER_CAPACITY {
            return Err(EkfError::InvalidParameter {
                name: "filter_update_period_us",
                reason: "sensor delays exceed the delay line capacity",
            });
        }
        Ok(Self::with_buffer_length(params, imu_buffer_length))
    }

    fn with_buffer_length(params: EkfParams, imu_buffer_length: usize) -> Self {
        let obs_buffer_length = imu_buffer_length.max(2);
        let period = params.filter_update_period_s();
        Self {
            store: StateStore::default(),
            filter_initialised: false,
            start_time_us: 0,
            imu_buffer_length,
            obs_buffer_length,

            dt_ekf_avg: period,
            dt_imu_avg: period,
            time_last_imu: 0,
            min_obs_interval_us: 0,

            imu_down_sampler: ImuDownSampler::default(),
            imu_sample_new: ImuSample::default(),
            imu_sample_delayed: ImuSample::default(),
            imu_updated: false,
            r_to_earth: Matrix3f::identity(),
            earth_rate_ned: Vector3f::zeros(),

            buffers: SensorBuffers::new(imu_buffer_length, obs_buffer_length),
            arrivals: SensorArrivals::default(),
            delayed: DelayedSamples::default(),
            init_accum: InitAccumulator::default(),

            control: ControlStatus::default(),
            control_prev: ControlStatus::default(),
            faults: FaultStatus::default(),
            innov: Innovations::default(),
            innov_check_fail_status: 0,
            timers: FusionTimers::default(),
            reset: ResetStatus::default(),
            aiding: AidingStatus::default(),

            accel_lpf_ne: Vector2f::zeros(),
            yaw_rate_lpf_ef: 0.0,
            accel_bias_inhibit: false,
            ang_rate_mag_filt: 0.0,
            accel_mag_filt: 0.0,
            prev_dvel_bias_var: Vector3f::zeros(),
            bad_vert_accel_detected: false,
            time_bad_vert_accel: 0,

            output: OutputPredictor::with_length(imu_buffer_length),
            terrain: TerrainEstimator::default(),
            flow: FlowState::default(),
            gps_checks: GpsChecks::default(),
            range_checks: RangeChecks::default(),
            mag_ctrl: MagControl::default(),
            ev_frame: ExtVisionFrame::default(),
            drag_sampler: DragSampler::default(),
            pending: VelPosObservations::default(),

            pos_ref: None,
            gps_alt_ref: 0.0,
            baro_hgt_offset: 0.0,
            hgt_sensor_offset: 0.0,
            last_on_ground_pos_d: 0.0,
            last_known_pos_ne: Vector2f::zeros(),

            air_density: 1.225,
            time_last_imu_bias_reset: None,
            params,
        }
    }

    /// Returns the filter to its uninitialised state, discarding all
    /// buffered data, and records the start time.
    pub fn init(&mut self, timestamp_us: TimeUs) -> bool {
        let params = self.params.clone();
        *self = Self::with_buffer_length(params, self.imu_buffer_length);
        self.start_time_us = timestamp_us;
        debug!(timestamp_us, "filter reset to uninitialised");
        true
    }

    /// Runs one filter pass. The prediction and fusion steps only run when
    /// the last IMU input completed a down-sampled sample; the output
    /// predictor runs on every call. Returns `true` when a new corrected
    /// state was produced.
    pub fn update(&mut self) -> bool {
        if !self.filter_initialised {
            self.filter_initialised = self.initialise_filter();
            if !self.filter_initialised {
                return false;
            }
        }

        if self.imu_updated {
            let prior = self.store.state;
            self.predict_state();
            self.predict_covariance(&prior);
            self.control_fusion_modes();
            self.run_terrain_estimator();
        }

        self.calculate_output_states();
        self.imu_updated
    }

    pub fn is_initialised(&self) -> bool {
        self.filter_initialised
    }

    // --- Initialisation ---

    /// Collects sensor averages at the fusion horizon and, once enough of
    /// the required data is in, levels the attitude from gravity, aligns yaw
    /// to the magnetometer and sets the height references.
    fn initialise_filter(&mut self) -> bool {
        let horizon = self.imu_sample_delayed.time_us;
        let settle = self.obs_buffer_length + 1;
        let acc = &mut self.init_accum;

        if let Some(imu) = self.buffers.imu.newest() {
            acc.del_vel_sum += imu.delta_vel;
        }
        if let Some(mag) = self.buffers.mag.pop_first_older_than(horizon) {
            acc.mag_count += 1;
            acc.mag_filt = if acc.mag_count <= settle {
                mag.mag
            } else {
                acc.mag_filt * 0.9 + mag.mag * 0.1
            };
            self.delayed.mag = mag;
        }
        if let Some(baro) = self.buffers.baro.pop_first_older_than(horizon) {
            acc.baro_count += 1;
            acc.baro_filt = InitAccumulator::blend(acc.baro_filt, baro.hgt, acc.baro_count, settle);
            self.delayed.baro = baro;
        }
        if let Some(range) = self.buffers.range.pop_first_older_than(horizon) {
            acc.range_count += 1;
            let hgt = range.rng.max(self.params.rng_gnd_clearance);
            acc.range_filt = InitAccumulator::blend(acc.range_filt, hgt, acc.range_count, settle);
            self.delayed.range = range;
        }
        if let Some(ev) = self.buffers.ev.pop_first_older_than(horizon) {
            acc.ev_count += 1;
            self.delayed.ev = ev;
        }

        let required = 2 * self.obs_buffer_length;
        let range_primary = self.params.vdist_sensor_type == HeightSensor::Range;
        let hgt_count = if range_primary { acc.range_count } else { acc.baro_count };
        let needs_mag = self.params.mag_fusion_type != MagFuseType::None;
        let needs_ev = self.params.uses(fusion_mask::USE_EV_POS)
            || self.params.uses(fusion_mask::USE_EV_YAW);
        if hgt_count <= required
            || (needs_mag && acc.mag_count <= required)
            || (needs_ev && acc.ev_count <= required)
        {
            return false;
        }

        let del_vel_sum = acc.del_vel_sum;
        if del_vel_sum.norm() <= 0.001 {
            return false;
        }
        let gravity_dir = del_vel_sum.normalize();
        let pitch = gravity_dir[0].clamp(-1.0, 1.0).asin();
        let roll = (-gravity_dir[1]).atan2(-gravity_dir[2]);

        self.store.state = StateSample {
            quat_nominal: quat_from_euler(roll, pitch, 0.0),
            ..StateSample::default()
        };
        self.r_to_earth = quat_to_dcm(&self.store.state.quat_nominal);

        let acc = self.init_accum;
        self.baro_hgt_offset = acc.baro_filt;
        if range_primary {
            self.hgt_sensor_offset = acc.range_filt;
            self.control.height_source = HeightSensor::Range;
        } else {
            self.control.height_source = HeightSensor::Baro;
        }

        self.initialise_covariance();
        self.control.yaw_align = self.reset_mag_heading(&acc.mag_filt, false, false);
        self.init_hagl();

        let now = self.time_last_imu;
        self.timers.last_hgt_fuse = now;
        self.timers.last_pos_fuse = now;
        self.timers.last_vel_fuse = now;
        self.timers.last_of_fuse = now;
        self.align_output_filter();

        info!(
            roll = roll.to_degrees(),
            pitch = pitch.to_degrees(),
            yaw_aligned = self.control.yaw_align,
            "filter initialised"
        );
        true
    }

    /// Initial uncertainty of every state.
    fn initialise_covariance(&mut self) {
        let p = &self.params;
        let dt = p.filter_update_period_s();
        let vel_var = sq(p.gps_vel_noise.max(0.01));
        let pos_var = sq(p.gps_pos_noise.max(0.01));
        let hgt_var = sq(p.baro_noise.max(0.01));
        let dang_bias_var = sq(p.switch_on_gyro_bias * dt);
        let dvel_bias_var = sq(p.switch_on_accel_bias * dt);
        let mag_var = sq(p.mag_noise);
        let wind_var = sq(p.initial_wind_uncertainty);
        let tilt_var = sq(p.initial_tilt_err);

        let store = &mut self.store;
        store.p.fill(0.0);
        store.initialise_quat_covariances(&Vector3f::repeat(tilt_var));
        store.set_diag(VEL_N..VEL_D, vel_var);
        store.set_diag(VEL_D..VEL_D + 1, sq(1.5) * vel_var);
        store.set_diag(POS_N..POS_D, pos_var);
        store.set_diag(POS_D..POS_D + 1, hgt_var);
        store.set_diag(DANG_BIAS..DANG_BIAS + 3, dang_bias_var);
        store.set_diag(DVEL_BIAS..DVEL_BIAS + 3, dvel_bias_var);
        store.set_diag(MAG_I..MAG_I + 6, mag_var);
        store.set_diag(WIND..WIND + 2, wind_var);

        self.prev_dvel_bias_var = Vector3f::repeat(dvel_bias_var);
        self.mag_ctrl.saved_covariance = Some(self.store.save_mag_covariance());
    }

    // --- Output prediction ---

    /// Integrates the newest raw IMU sample into the real-time solution and,
    /// once per filter cycle, corrects it against the delayed state.
    fn calculate_output_states(&mut self) {
        let imu = self.imu_sample_new;
        let scale = if self.dt_ekf_avg > 0.0 {
            imu.delta_ang_dt / self.dt_ekf_avg
        } else {
            0.0
        };
        let dang_bias = self.store.state.delta_ang_bias * scale;
        let dvel_bias = self.store.state.delta_vel_bias * scale;
        self.output
            .integrate(&imu, &dang_bias, &dvel_bias, &self.params.imu_pos_body);

        if self.imu_updated {
            let gains = TrackingGains {
                dt_ekf_avg: self.dt_ekf_avg,
                dt_imu_avg: self.dt_imu_avg,
                time_delay: imu.time_us.saturating_sub(self.imu_sample_delayed.time_us) as f32 * 1e-6,
                vel_tau: self.params.vel_tau,
                pos_tau: self.params.pos_tau,
            };
            let state = self.store.state;
            self.output.correct(&state, &gains);
        }
    }

    /// Snaps the output predictor onto the delayed state.
    pub(crate) fn align_output_filter(&mut self) {
        let state = self.store.state;
        self.output.align(&state, self.time_last_imu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_lines_cover_the_longest_sensor_delay() {
        let ekf = Ekf::new(EkfParams::default()).expect("default parameters are valid");
        let params = EkfParams::default();
        let covered = (ekf.imu_buffer_length - 1) as u64 * params.filter_update_period_us;
        assert!(covered as f32 >= params.max_delay_ms() * 1e3);
        assert!(!ekf.is_initialised());
    }

    #[test]
    fn excessive_delay_is_refused() {
        let params = EkfParams {
            gps_delay_ms: 1000.0,
            filter_update_period_us: 5_000,
            ..Default::default()
        };
        assert!(matches!(
            Ekf::new(params),
            Err(EkfError::InvalidParameter { name: "filter_update_period_us", .. })
        ));
    }

    #[test]
    fn update_waits_for_sensor_data() {
        let mut ekf = Ekf::new(EkfParams::default()).expect("default parameters are valid");
        assert!(ekf.init(1_000));
        assert!(!ekf.update());
        assert_eq!(ekf.start_time_us, 1_000);
    }
}
