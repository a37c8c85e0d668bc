// ekf_core/src/estimation/status.rs

//! Status records the estimator exposes to the host: which fusion modes are
//! active, which sensors have been flagged faulty, which innovation checks
//! failed on the last attempt, and the overall solution quality.

use crate::params::HeightSensor;

/// Bits of the innovation check failure mask. A bit is set when the last
/// observation of that class failed its innovation consistency check.
pub mod innovation_fault {
    pub const VEL_NED: u16 = 1 << 0;
    pub const POS_NE: u16 = 1 << 1;
    pub const POS_D: u16 = 1 << 2;
    pub const MAG_X: u16 = 1 << 3;
    pub const MAG_Y: u16 = 1 << 4;
    pub const MAG_Z: u16 = 1 << 5;
    pub const YAW: u16 = 1 << 6;
    pub const AIRSPEED: u16 = 1 << 7;
    pub const SIDESLIP: u16 = 1 << 8;
    pub const HAGL: u16 = 1 << 9;
    pub const OPTFLOW_X: u16 = 1 << 10;
    pub const OPTFLOW_Y: u16 = 1 << 11;
    pub const DRAG_X: u16 = 1 << 12;
    pub const DRAG_Y: u16 = 1 << 13;
    pub const AUX_VEL: u16 = 1 << 14;
}

/// Bits of the solution status word.
pub mod solution_status {
    /// Attitude estimate is good.
    pub const ATTITUDE: u16 = 1 << 0;
    pub const VELOCITY_HORIZ: u16 = 1 << 1;
    pub const VELOCITY_VERT: u16 = 1 << 2;
    pub const POS_HORIZ_REL: u16 = 1 << 3;
    pub const POS_HORIZ_ABS: u16 = 1 << 4;
    pub const POS_VERT_ABS: u16 = 1 << 5;
    pub const POS_VERT_AGL: u16 = 1 << 6;
    /// In constant position mode.
    pub const CONST_POS_MODE: u16 = 1 << 7;
    pub const PRED_POS_HORIZ_REL: u16 = 1 << 8;
    pub const PRED_POS_HORIZ_ABS: u16 = 1 << 9;
    pub const GPS_GLITCH: u16 = 1 << 10;
    pub const ACCEL_ERROR: u16 = 1 << 11;
}

/// Active fusion modes and vehicle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStatus {
    /// Tilt alignment is complete.
    pub tilt_align: bool,
    /// Yaw alignment is complete.
    pub yaw_align: bool,
    pub gps: bool,
    pub opt_flow: bool,
    pub mag_hdg: bool,
    pub mag_3d: bool,
    pub mag_dec: bool,
    pub in_air: bool,
    pub wind: bool,
    /// Height source currently used as the vertical reference.
    pub height_source: HeightSensor,
    pub ev_pos: bool,
    pub ev_yaw: bool,
    pub fuse_beta: bool,
    pub fuse_aspd: bool,
    pub fuse_drag: bool,
    pub fuse_aux_vel: bool,
    pub fixed_wing: bool,
    /// Magnetometer declared unusable.
    pub mag_fault: bool,
    pub rng_stuck: bool,
    pub gps_yaw: bool,
    pub mag_aligned_in_flight: bool,
    pub vehicle_at_rest: bool,
}

impl Default for ControlStatus {
    fn default() -> Self {
        Self {
            tilt_align: false,
            yaw_align: false,
            gps: false,
            opt_flow: false,
            mag_hdg: false,
            mag_3d: false,
            mag_dec: false,
            in_air: false,
            wind: false,
            height_source: HeightSensor::Baro,
            ev_pos: false,
            ev_yaw: false,
            fuse_beta: false,
            fuse_aspd: false,
            fuse_drag: false,
            fuse_aux_vel: false,
            fixed_wing: false,
            mag_fault: false,
            rng_stuck: false,
            gps_yaw: false,
            mag_aligned_in_flight: false,
            // Until told otherwise the vehicle is assumed to be on the ground.
            vehicle_at_rest: true,
        }
    }
}

impl ControlStatus {
    pub fn baro_hgt(&self) -> bool {
        self.height_source == HeightSensor::Baro
    }

    pub fn rng_hgt(&self) -> bool {
        self.height_source == HeightSensor::Range
    }

    pub fn gps_hgt(&self) -> bool {
        self.height_source == HeightSensor::Gps
    }

    pub fn ev_hgt(&self) -> bool {
        self.height_source == HeightSensor::Vision
    }

    /// Packs the flags into a bitmask, in declaration order.
    pub fn value(&self) -> u32 {
        let flags = [
            self.tilt_align,
            self.yaw_align,
            self.gps,
            self.opt_flow,
            self.mag_hdg,
            self.mag_3d,
            self.mag_dec,
            self.in_air,
            self.wind,
            self.baro_hgt(),
            self.rng_hgt(),
            self.gps_hgt(),
            self.ev_pos,
            self.ev_yaw,
            self.ev_hgt(),
            self.fuse_beta,
            self.fuse_aspd,
            self.fuse_drag,
            self.fuse_aux_vel,
            self.fixed_wing,
            self.mag_fault,
            self.rng_stuck,
            self.gps_yaw,
            self.mag_aligned_in_flight,
            self.vehicle_at_rest,
        ];
        pack(&flags)
    }
}

/// Sensor and numerical faults detected during fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultStatus {
    pub bad_mag_x: bool,
    pub bad_mag_y: bool,
    pub bad_mag_z: bool,
    pub bad_hdg: bool,
    pub bad_mag_decl: bool,
    pub bad_airspeed: bool,
    pub bad_sideslip: bool,
    pub bad_optflow_x: bool,
    pub bad_optflow_y: bool,
    pub bad_vel_n: bool,
    pub bad_vel_e: bool,
    pub bad_vel_d: bool,
    pub bad_pos_n: bool,
    pub bad_pos_e: bool,
    pub bad_pos_d: bool,
    pub bad_acc_bias: bool,
    pub bad_acc_vertical: bool,
    pub bad_drag_x: bool,
    pub bad_drag_y: bool,
}

impl FaultStatus {
    pub fn value(&self) -> u32 {
        pack(&[
            self.bad_mag_x,
            self.bad_mag_y,
            self.bad_mag_z,
            self.bad_hdg,
            self.bad_mag_decl,
            self.bad_airspeed,
            self.bad_sideslip,
            self.bad_optflow_x,
            self.bad_optflow_y,
            self.bad_vel_n,
            self.bad_vel_e,
            self.bad_vel_d,
            self.bad_pos_n,
            self.bad_pos_e,
            self.bad_pos_d,
            self.bad_acc_bias,
            self.bad_acc_vertical,
            self.bad_drag_x,
            self.bad_drag_y,
        ])
    }
}

fn pack(flags: &[bool]) -> u32 {
    flags
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, &set)| acc | (u32::from(set) << bit))
}

/// Summary of the innovation consistency checks, as reported by
/// [`Ekf::get_innovation_test_status`](crate::estimation::ekf::Ekf::get_innovation_test_status).
///
/// Each value is the square root of `innovation^2 / (gate^2 * variance)`;
/// values above one mean the observation was rejected. Vector classes report
/// their largest axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InnovationTestStatus {
    /// [`innovation_fault`] bits.
    pub status: u16,
    pub mag: f32,
    pub vel: f32,
    pub pos: f32,
    pub hgt: f32,
    pub tas: f32,
    pub hagl: f32,
    pub beta: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_status_packs_height_source() {
        let mut status = ControlStatus::default();
        assert_eq!(status.value() & (1 << 9), 1 << 9);
        status.height_source = HeightSensor::Gps;
        assert_eq!(status.value() & (1 << 9), 0);
        assert_eq!(status.value() & (1 << 11), 1 << 11);
    }

    #[test]
    fn fault_status_is_clear_by_default() {
        assert_eq!(FaultStatus::default().value(), 0);
        let faults = FaultStatus {
            bad_acc_bias: true,
            ..Default::default()
        };
        assert_eq!(faults.value(), 1 << 15);
    }
}
