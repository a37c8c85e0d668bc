// ekf_core/src/estimation/control/mod.rs

//! Fusion mode controller.
//!
//! Runs once per filter cycle after the prediction. It pulls the samples
//! that have reached the fusion horizon, decides which aiding sources are
//! active, starts and stops fusion modes (resetting states on transitions)
//! and finally fuses the velocity, position and height observations
//! collected during the cycle.

pub mod aiding;
pub mod air_data;
pub mod gps;
pub mod height;
pub mod mag;

use tracing::{debug, info, warn};

use crate::buffers::{ObservationBuffer, Timestamped};
use crate::estimation::ekf::Ekf;
use crate::estimation::fusion::vel_pos::AxisObservation;
use crate::types::{elapsed_us, sq, TimeUs, Vector2f};

/// Interval between synthetic position observations (us).
const FAKE_POS_INTERVAL_US: u64 = 200_000;

/// Gap after which synthetic position fusion restarts with a reset (us).
const FAKE_POS_RESTART_US: u64 = 400_000;

/// Synthetic position noise while on the ground or before tilt alignment (m).
const FAKE_POS_NOISE_GROUND: f32 = 0.5;

/// Innovation gate used for synthetic position (SD).
const FAKE_POS_GATE: f32 = 100.0;

/// Tilt variance below which alignment is declared complete (rad^2).
const TILT_ALIGN_VAR: f32 = 0.05235 * 0.05235;

/// Time of the last successful fusion of each observation class, on the
/// delayed horizon (us).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionTimers {
    pub last_vel_fuse: TimeUs,
    pub last_pos_fuse: TimeUs,
    pub last_hgt_fuse: TimeUs,
    pub last_aux_vel_fuse: TimeUs,
    pub last_mag_fuse: TimeUs,
    pub last_heading_fuse: TimeUs,
    pub last_gps_yaw_fuse: TimeUs,
    pub last_arsp_fuse: TimeUs,
    pub last_beta_fuse: TimeUs,
    pub last_drag_fuse: TimeUs,
    pub last_of_fuse: TimeUs,
    pub last_fake_pos: TimeUs,
    /// Arrival of the last external vision sample.
    pub last_ext_vision: TimeUs,
    /// Start of the current period without aiding.
    pub ins_deadreckon_start: TimeUs,
}

/// How the horizontal solution is currently supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AidingStatus {
    /// The last known position is being fused in place of real aiding.
    pub using_synthetic_position: bool,
    /// No source constrains velocity drift.
    pub is_dead_reckoning: bool,
    /// Only air data constrains velocity drift.
    pub is_wind_dead_reckoning: bool,
    /// Inertial dead reckoning has lasted longer than `valid_timeout_max`.
    pub deadreckon_time_exceeded: bool,
}

/// Pops the oldest sample that has fallen behind `horizon` into `slot`.
fn pop_into<T: Timestamped + Copy, const N: usize>(
    buffer: &mut ObservationBuffer<T, N>,
    horizon: TimeUs,
    slot: &mut T,
) -> bool {
    match buffer.pop_first_older_than(horizon) {
        Some(sample) => {
            *slot = sample;
            true
        }
        None => false,
    }
}

impl Ekf {
    /// One pass of the mode controller.
    pub(crate) fn control_fusion_modes(&mut self) {
        self.control_prev = self.control;

        self.monitor_alignment();
        self.pop_delayed_samples();

        self.control_mag_fusion();
        self.control_optical_flow_fusion();
        self.control_gps_fusion();
        self.control_air_data_fusion();
        self.control_beta_fusion();
        self.control_drag_fusion();
        self.control_height_fusion();
        self.control_external_vision_fusion();
        self.control_aux_vel_fusion();

        self.control_vel_pos_fusion();
        self.control_height_sensor_timeouts();
        self.update_deadreckoning_status();
    }

    /// Declares tilt alignment once the tilt uncertainty has converged,
    /// then aligns yaw to the magnetometer if one is in use.
    fn monitor_alignment(&mut self) {
        if self.control.tilt_align {
            return;
        }
        let var = self.store.calc_rot_vec_variances();
        if var[0] + var[1] >= TILT_ALIGN_VAR {
            return;
        }
        self.control.tilt_align = true;
        info!("tilt alignment complete");

        if !self.control.yaw_align {
            let mag = self.delayed.mag.mag;
            self.control.yaw_align = self.reset_mag_heading(&mag, false, true);
            if self.control.yaw_align {
                info!("yaw alignment complete");
            }
        }
    }

    /// Moves every sample that has reached the fusion horizon out of its
    /// buffer and flags which sensors have fresh data this cycle.
    fn pop_delayed_samples(&mut self) {
        let horizon = self.imu_sample_delayed.time_us;
        let b = &mut self.buffers;
        let d = &mut self.delayed;

        d.mag_ready = pop_into(&mut b.mag, horizon, &mut d.mag);
        d.baro_ready = pop_into(&mut b.baro, horizon, &mut d.baro);
        d.gps_ready = pop_into(&mut b.gps, horizon, &mut d.gps);
        d.range_ready = pop_into(&mut b.range, horizon, &mut d.range);
        d.flow_ready = pop_into(&mut b.flow, horizon, &mut d.flow);
        d.ev_ready = pop_into(&mut b.ev, horizon, &mut d.ev);
        d.aux_vel_ready = pop_into(&mut b.aux_vel, horizon, &mut d.aux_vel);
        d.tas_ready = pop_into(&mut b.airspeed, horizon, &mut d.airspeed)
            && d.airspeed.true_airspeed > self.params.arsp_thr;

        // Bias corrected IMU rotation over the flow integration period.
        let imu = self.imu_sample_delayed;
        self.flow.imu_del_ang += imu.delta_ang - self.store.state.delta_ang_bias;
        self.flow.imu_delta_time += imu.delta_ang_dt;

        self.update_range_checks();
    }

    /// Fuses the velocity, position and height observations gathered by the
    /// source controllers. Without any horizontal aiding the last known
    /// position is fused instead, keeping the horizontal covariance bounded.
    fn control_vel_pos_fusion(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let aided = self.control.gps
            || self.control.opt_flow
            || self.control.ev_pos
            || (self.control.fuse_aspd && self.control.fuse_beta);

        if aided {
            self.aiding.using_synthetic_position = false;
        } else {
            if !self.aiding.using_synthetic_position {
                debug!("starting synthetic position fusion");
            }
            self.aiding.using_synthetic_position = true;

            let since_fake = elapsed_us(now, self.timers.last_fake_pos);
            if since_fake > FAKE_POS_INTERVAL_US || self.pending.height.is_some() {
                if since_fake > FAKE_POS_RESTART_US {
                    self.reset_position();
                    self.reset_velocity();
                }
                self.timers.last_fake_pos = now;

                let noise = if self.control.in_air && self.control.tilt_align {
                    self.params.pos_noaid_noise.max(self.params.gps_pos_noise)
                } else {
                    FAKE_POS_NOISE_GROUND
                };
                let pos = self.last_known_pos_ne;
                self.pending.hor_pos = Some(AxisObservation {
                    measurement: [pos[0], pos[1]],
                    obs_var: [sq(noise); 2],
                    gate: FAKE_POS_GATE,
                });
            }
        }

        let obs = std::mem::take(&mut self.pending);
        if obs.hor_vel.is_some()
            || obs.vert_vel.is_some()
            || obs.hor_pos.is_some()
            || obs.height.is_some()
        {
            self.fuse_vel_pos_height(&obs);
        }
    }

    /// Classifies how the solution is aided and tracks how long it has been
    /// dead reckoning.
    fn update_deadreckoning_status(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let timeout = self.params.no_aid_timeout_max;
        let recent = |last: TimeUs| last > 0 && elapsed_us(now, last) <= timeout;
        let t = &self.timers;

        let vel_pos_aiding = (self.control.gps || self.control.ev_pos)
            && (recent(t.last_pos_fuse) || recent(t.last_vel_fuse));
        let optflow_aiding = self.control.opt_flow && recent(t.last_of_fuse);
        let airdata_aiding =
            self.control.wind && recent(t.last_arsp_fuse) && recent(t.last_beta_fuse);

        let was_dead_reckoning = self.aiding.is_dead_reckoning;
        self.aiding.is_wind_dead_reckoning = !vel_pos_aiding && !optflow_aiding && airdata_aiding;
        self.aiding.is_dead_reckoning = !vel_pos_aiding && !optflow_aiding && !airdata_aiding;

        if !self.aiding.is_dead_reckoning {
            self.timers.ins_deadreckon_start = now.saturating_sub(timeout);
        }
        self.aiding.deadreckon_time_exceeded =
            elapsed_us(now, self.timers.ins_deadreckon_start) > self.params.valid_timeout_max;

        if vel_pos_aiding || optflow_aiding {
            self.last_known_pos_ne = Vector2f::new(self.store.state.pos[0], self.store.state.pos[1]);
        }

        if self.aiding.is_dead_reckoning && !was_dead_reckoning && self.control.in_air {
            warn!("inertial dead reckoning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::BaroSample;

    #[test]
    fn pop_into_takes_only_samples_behind_the_horizon() {
        let mut buffer: ObservationBuffer<BaroSample, 4> = ObservationBuffer::with_length(4);
        buffer.push(BaroSample { time_us: 10_000, hgt: 1.0 });
        buffer.push(BaroSample { time_us: 30_000, hgt: 2.0 });

        let mut slot = BaroSample::default();
        assert!(!pop_into(&mut buffer, 5_000, &mut slot));
        assert!(pop_into(&mut buffer, 20_000, &mut slot));
        assert_eq!(slot.hgt, 1.0);
        assert!(!pop_into(&mut buffer, 20_000, &mut slot));
        assert_eq!(buffer.len(), 1);
    }
}
