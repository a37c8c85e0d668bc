// ekf_core/src/frames/layout.rs

use core::ops::Range;

use crate::types::NUM_STATES;

/// The blocks of the 24-element state vector, in storage order.
///
/// The layout is fixed at compile time; every index used by the predictor,
/// the fusion routines and the covariance helpers comes from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateBlock {
    /// Orientation quaternion `(w, x, y, z)`, body to NED.
    Quaternion,
    /// NED velocity (m/s).
    Velocity,
    /// NED position relative to the local origin (m).
    Position,
    /// Delta-angle gyro bias (rad).
    DeltaAngleBias,
    /// Delta-velocity accelerometer bias (m/s).
    DeltaVelocityBias,
    /// NED earth magnetic field (gauss).
    EarthMagField,
    /// Body frame magnetometer bias (gauss).
    BodyMagBias,
    /// North/East wind velocity (m/s).
    Wind,
}

impl StateBlock {
    pub const ALL: [StateBlock; 8] = [
        StateBlock::Quaternion,
        StateBlock::Velocity,
        StateBlock::Position,
        StateBlock::DeltaAngleBias,
        StateBlock::DeltaVelocityBias,
        StateBlock::EarthMagField,
        StateBlock::BodyMagBias,
        StateBlock::Wind,
    ];

    /// Index range of this block inside the state vector.
    pub const fn range(self) -> Range<usize> {
        match self {
            StateBlock::Quaternion => QUAT..QUAT + 4,
            StateBlock::Velocity => VEL..VEL + 3,
            StateBlock::Position => POS..POS + 3,
            StateBlock::DeltaAngleBias => DANG_BIAS..DANG_BIAS + 3,
            StateBlock::DeltaVelocityBias => DVEL_BIAS..DVEL_BIAS + 3,
            StateBlock::EarthMagField => MAG_I..MAG_I + 3,
            StateBlock::BodyMagBias => MAG_B..MAG_B + 3,
            StateBlock::Wind => WIND..WIND + 2,
        }
    }

    pub const fn first(self) -> usize {
        self.range().start
    }

    pub const fn len(self) -> usize {
        let r = self.range();
        r.end - r.start
    }
}

pub const QUAT: usize = 0;
pub const VEL: usize = 4;
pub const POS: usize = 7;
pub const DANG_BIAS: usize = 10;
pub const DVEL_BIAS: usize = 13;
pub const MAG_I: usize = 16;
pub const MAG_B: usize = 19;
pub const WIND: usize = 22;

// Individual axes that the fusion routines address directly.
pub const VEL_N: usize = VEL;
pub const VEL_E: usize = VEL + 1;
pub const VEL_D: usize = VEL + 2;
pub const POS_N: usize = POS;
pub const POS_E: usize = POS + 1;
pub const POS_D: usize = POS + 2;
pub const MAG_N: usize = MAG_I;
pub const MAG_E: usize = MAG_I + 1;
pub const WIND_N: usize = WIND;
pub const WIND_E: usize = WIND + 1;

const _: () = assert!(WIND + 2 == NUM_STATES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_tile_the_state_vector() {
        let mut next = 0;
        for block in StateBlock::ALL {
            assert_eq!(block.first(), next, "{block:?} is not contiguous");
            next += block.len();
        }
        assert_eq!(next, NUM_STATES);
    }
}
