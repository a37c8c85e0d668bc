// ekf_core/src/types.rs

use nalgebra::{Matrix3, Quaternion, SMatrix, SVector, Vector2, Vector3};
use num_traits::Float;

// --- Core Type Aliases ---
pub type Vector2f = Vector2<f32>;
pub type Vector3f = Vector3<f32>;
pub type Matrix3f = Matrix3<f32>;
/// A raw (not necessarily unit) quaternion. Coefficients are `(w, i, j, k)`.
pub type Quatf = Quaternion<f32>;

/// Number of states carried by the filter.
pub const NUM_STATES: usize = 24;

pub type StateVector = SVector<f32, NUM_STATES>;
pub type StateCovariance = SMatrix<f32, NUM_STATES, NUM_STATES>;

/// Timestamps are monotonic microseconds, as delivered by the sensor drivers.
pub type TimeUs = u64;

/// Gravitational acceleration used by the strapdown equations (m/s^2).
pub const GRAVITY: f32 = 9.80665;

/// Earth rotation rate (rad/s).
pub const EARTH_RATE: f32 = 7.292_115e-5;

pub fn sq<T: Float>(value: T) -> T {
    value * value
}

/// Clamp that tolerates an inverted range by returning the lower bound.
pub fn constrain<T: Float>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Wrap an angle into `[-pi, pi)`.
pub fn wrap_pi(angle: f32) -> f32 {
    if !angle.is_finite() {
        return angle;
    }
    let two_pi = 2.0 * core::f32::consts::PI;
    let mut wrapped = (angle + core::f32::consts::PI) % two_pi;
    if wrapped < 0.0 {
        wrapped += two_pi;
    }
    wrapped - core::f32::consts::PI
}

/// Microseconds elapsed from `earlier` to `later`, saturating at zero.
pub fn elapsed_us(later: TimeUs, earlier: TimeUs) -> u64 {
    later.saturating_sub(earlier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f32::consts::PI;

    #[test]
    fn wrap_pi_keeps_angles_in_range() {
        assert_abs_diff_eq!(wrap_pi(0.5), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(wrap_pi(PI + 0.1), -PI + 0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(wrap_pi(-PI - 0.1), PI - 0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(wrap_pi(4.0 * PI + 0.2), 0.2, epsilon = 1e-4);
    }

    #[test]
    fn constrain_clamps_both_sides() {
        assert_eq!(constrain(5.0_f32, 0.0, 1.0), 1.0);
        assert_eq!(constrain(-5.0_f32, 0.0, 1.0), 0.0);
        assert_eq!(constrain(0.25_f32, 0.0, 1.0), 0.25);
    }

    #[test]
    fn elapsed_saturates() {
        assert_eq!(elapsed_us(10, 20), 0);
        assert_eq!(elapsed_us(20, 10), 10);
    }
}
