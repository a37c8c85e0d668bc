// ekf_core/src/estimation/control/mag.rs

//! Magnetometer mode selection.
//!
//! Heading fusion is robust against local field disturbances and is used on
//! the ground. 3-axis fusion also learns the earth and body fields but needs
//! the vehicle away from ground anomalies and moving enough for the fields
//! to be observable, so `Auto` only selects it in flight after an in-flight
//! field alignment.

use tracing::{debug, info};

use crate::estimation::ekf::Ekf;
use crate::estimation::state::SavedMagCovariance;
use crate::params::MagFuseType;
use crate::types::{elapsed_us, sq, TimeUs};

/// Climb above the last on-ground height that triggers the in-flight field
/// alignment (m).
const IN_FLIGHT_ALIGN_HEIGHT: f32 = 1.5;

/// 3-axis fusion continues for this long after the last observable motion
/// (us).
const MAG_3D_HOLD_US: u64 = 2_000_000;

/// Declination observation noise used alongside 3-axis fusion (rad).
const DECLINATION_SIGMA: f32 = 0.02;

/// Magnetometer controller state carried between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct MagControl {
    /// Field covariance stored when 3-axis fusion stops.
    pub saved_covariance: Option<SavedMagCovariance>,
    /// In-flight yaw errors detected against the GPS course.
    pub num_bad_flight_yaw_events: u8,
    /// Horizontal acceleration makes yaw observable.
    pub yaw_angle_observable: bool,
    /// Yaw rotation makes the body field biases observable.
    pub mag_bias_observable: bool,
    /// Earth frame yaw change since the last observability check (rad).
    pub yaw_delta_ef: f32,
    pub time_yaw_started: TimeUs,
    pub time_last_movement: TimeUs,
    /// A yaw and field reset is wanted once tilt is aligned.
    pub yaw_reset_req: bool,
}

impl Ekf {
    /// Selects and runs the magnetometer fusion mode for this cycle.
    pub(crate) fn control_mag_fusion(&mut self) {
        let imu = self.imu_sample_delayed;
        self.mag_ctrl.yaw_delta_ef += (self.r_to_earth.row(2) * imu.delta_ang)[0];

        if self.params.mag_fusion_type == MagFuseType::None || self.control.mag_fault {
            self.stop_mag_fusion();
            return;
        }

        if !self.control.in_air {
            self.last_on_ground_pos_d = self.store.state.pos[2];
            self.control.mag_aligned_in_flight = false;
            self.mag_ctrl.num_bad_flight_yaw_events = 0;
        }

        // Another yaw reference replaces the magnetometer.
        if self.control.ev_yaw || self.control.gps_yaw || !self.delayed.mag_ready {
            return;
        }

        let mag = self.delayed.mag.mag;
        let height_achieved =
            self.last_on_ground_pos_d - self.store.state.pos[2] > IN_FLIGHT_ALIGN_HEIGHT;
        self.mag_ctrl.yaw_reset_req |= !self.control.yaw_align;
        self.mag_ctrl.yaw_reset_req |= height_achieved && !self.control.mag_aligned_in_flight;

        if self.mag_ctrl.yaw_reset_req && self.control.tilt_align {
            let aligned = self.reset_mag_heading(&mag, self.control.in_air, true);
            self.control.yaw_align = aligned;
            if aligned && height_achieved {
                self.control.mag_aligned_in_flight = true;
                // Fields learned on the ground are discarded.
                self.mag_ctrl.saved_covariance = None;
                info!("in-flight magnetic field alignment");
            }
            self.mag_ctrl.yaw_reset_req = false;
        }

        let use_3d = match self.params.mag_fusion_type {
            MagFuseType::Auto => {
                self.update_mag_observability();
                self.control.tilt_align
                    && self.control.in_air
                    && self.control.mag_aligned_in_flight
                    && elapsed_us(imu.time_us, self.mag_ctrl.time_last_movement) < MAG_3D_HOLD_US
            }
            MagFuseType::ThreeAxis => true,
            _ => false,
        };
        self.select_mag_mode(use_3d);

        if !self.control.yaw_align {
            return;
        }
        if self.control.mag_3d {
            self.fuse_mag(&mag);
            if self.control.mag_dec {
                self.fuse_declination(DECLINATION_SIGMA);
            }
        } else if self.control.mag_hdg {
            let yaw = self.mag_heading_measurement(&mag);
            let var = sq(self.params.mag_heading_noise.max(1e-2));
            self.fuse_heading(yaw, var);
        }
    }

    /// Switches between heading and 3-axis fusion, carrying the field
    /// covariance across the switch.
    fn select_mag_mode(&mut self, use_3d: bool) {
        if use_3d {
            if !self.control.mag_3d {
                match self.mag_ctrl.saved_covariance {
                    Some(saved) => self.store.load_mag_covariance(&saved),
                    None => self.store.reset_mag_covariance(sq(self.params.mag_noise)),
                }
                debug!("3-axis magnetometer fusion");
            }
            self.control.mag_3d = true;
            self.control.mag_hdg = false;
        } else {
            if self.control.mag_3d {
                self.mag_ctrl.saved_covariance = Some(self.store.save_mag_covariance());
                debug!("magnetometer heading fusion");
            }
            self.control.mag_3d = false;
            self.control.mag_hdg = true;
        }
        self.control.mag_dec = self.control.mag_3d && self.params.fuse_declination;
    }

    /// Hysteresis on the manoeuvre metrics that make the yaw and the body
    /// field biases observable.
    fn update_mag_observability(&mut self) {
        let now = self.imu_sample_delayed.time_us;
        let gate = self.params.mag_acc_gate;
        let m = &mut self.mag_ctrl;

        let acc = self.accel_lpf_ne.norm();
        m.yaw_angle_observable = if m.yaw_angle_observable {
            acc > gate
        } else {
            acc > 2.0 * gate
        };
        m.yaw_angle_observable &= self.control.gps || self.control.ev_pos;

        let rate_gate = self.params.mag_yaw_rate_gate;
        if !m.mag_bias_observable && self.yaw_rate_lpf_ef.abs() > rate_gate {
            m.mag_bias_observable = true;
        } else if m.mag_bias_observable {
            // Sustained rotation of half the initial rate is required.
            let yaw_dt = elapsed_us(now, m.time_yaw_started) as f32 * 1e-6;
            m.mag_bias_observable = m.yaw_delta_ef.abs() > 0.5 * rate_gate * yaw_dt;
        }
        m.yaw_delta_ef = 0.0;
        m.time_yaw_started = now;

        if m.mag_bias_observable || m.yaw_angle_observable {
            m.time_last_movement = now;
        }
    }

    fn stop_mag_fusion(&mut self) {
        if self.control.mag_3d {
            self.mag_ctrl.saved_covariance = Some(self.store.save_mag_covariance());
        }
        if self.control.mag_hdg || self.control.mag_3d {
            info!("magnetometer fusion stopped");
        }
        self.control.mag_hdg = false;
        self.control.mag_3d = false;
        self.control.mag_dec = false;
    }
}
