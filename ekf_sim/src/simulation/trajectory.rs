// ekf_sim/src/simulation/trajectory.rs

//! Kinematic truth for the simulated vehicle.
//!
//! The vehicle stays level and points along its path, so the body rate is
//! a pure yaw rate and the specific force follows from the path
//! acceleration alone.

use ekf_core::frames::{quat_from_euler, quat_to_dcm};
use ekf_core::types::{Matrix3f, Quatf, Vector3f, GRAVITY};
use serde::{Deserialize, Serialize};

use crate::errors::{SimError, SimResult};

/// Truth at one instant, in the local NED frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruthSample {
    pub pos: Vector3f,
    pub vel: Vector3f,
    pub accel: Vector3f,
    pub yaw: f32,
    pub yaw_rate: f32,
}

impl TruthSample {
    pub fn quat(&self) -> Quatf {
        quat_from_euler(0.0, 0.0, self.yaw)
    }

    pub fn body_to_earth(&self) -> Matrix3f {
        quat_to_dcm(&self.quat())
    }

    /// Specific force measured by a body fixed accelerometer (m/s^2).
    pub fn specific_force_body(&self) -> Vector3f {
        self.body_to_earth().transpose() * (self.accel - Vector3f::new(0.0, 0.0, GRAVITY))
    }

    /// Body angular rate (rad/s).
    pub fn body_rate(&self) -> Vector3f {
        Vector3f::new(0.0, 0.0, self.yaw_rate)
    }
}

/// The path the vehicle follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrajectoryConfig {
    /// Parked, or hovering at a fixed height.
    Stationary {
        #[serde(default)]
        altitude_m: f32,
        #[serde(default)]
        heading_deg: f32,
    },
    /// Constant height circle flown clockwise, starting northbound at the
    /// origin.
    Circle {
        radius_m: f32,
        speed_m_s: f32,
        #[serde(default)]
        altitude_m: f32,
        /// Time spent accelerating from rest (s).
        #[serde(default)]
        ramp_s: f32,
        /// Time spent at rest before moving (s).
        #[serde(default)]
        start_s: f32,
    },
    /// Straight constant height line.
    Line {
        speed_m_s: f32,
        #[serde(default)]
        heading_deg: f32,
        #[serde(default)]
        altitude_m: f32,
        #[serde(default)]
        ramp_s: f32,
        #[serde(default)]
        start_s: f32,
    },
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self::Stationary {
            altitude_m: 0.0,
            heading_deg: 0.0,
        }
    }
}

/// Distance travelled, speed and tangential acceleration at `t` for a
/// start from rest at `start` with a linear ramp up to `speed`.
fn along_track(speed: f32, ramp: f32, start: f32, t: f32) -> (f32, f32, f32) {
    let t = (t - start).max(0.0);
    if t <= 0.0 {
        return (0.0, 0.0, 0.0);
    }
    if ramp > 0.0 && t < ramp {
        let accel = speed / ramp;
        (0.5 * accel * t * t, accel * t, accel)
    } else {
        (speed * (t - 0.5 * ramp), speed, 0.0)
    }
}

impl TrajectoryConfig {
    pub fn validate(&self) -> SimResult<()> {
        let finite_positive = |v: f32| v.is_finite() && v > 0.0;
        match *self {
            Self::Stationary { .. } => Ok(()),
            Self::Circle { radius_m, speed_m_s, ramp_s, .. } => {
                if !finite_positive(radius_m) || !finite_positive(speed_m_s) || ramp_s < 0.0 {
                    return Err(SimError::Scenario(
                        "circle needs a positive radius and speed".into(),
                    ));
                }
                Ok(())
            }
            Self::Line { speed_m_s, ramp_s, .. } => {
                if !finite_positive(speed_m_s) || ramp_s < 0.0 {
                    return Err(SimError::Scenario("line needs a positive speed".into()));
                }
                Ok(())
            }
        }
    }

    /// Truth at `t` seconds into the run.
    pub fn sample(&self, t: f32) -> TruthSample {
        match *self {
            Self::Stationary { altitude_m, heading_deg } => TruthSample {
                pos: Vector3f::new(0.0, 0.0, -altitude_m),
                vel: Vector3f::zeros(),
                accel: Vector3f::zeros(),
                yaw: heading_deg.to_radians(),
                yaw_rate: 0.0,
            },
            Self::Circle {
                radius_m,
                speed_m_s,
                altitude_m,
                ramp_s,
                start_s,
            } => {
                let (s, v, a) = along_track(speed_m_s, ramp_s, start_s, t);
                let theta = s / radius_m;
                let (sin, cos) = theta.sin_cos();
                let centripetal = v * v / radius_m;
                TruthSample {
                    pos: Vector3f::new(radius_m * sin, radius_m * (1.0 - cos), -altitude_m),
                    vel: Vector3f::new(v * cos, v * sin, 0.0),
                    accel: Vector3f::new(a * cos - centripetal * sin, a * sin + centripetal * cos, 0.0),
                    yaw: theta,
                    yaw_rate: v / radius_m,
                }
            }
            Self::Line {
                speed_m_s,
                heading_deg,
                altitude_m,
                ramp_s,
                start_s,
            } => {
                let (s, v, a) = along_track(speed_m_s, ramp_s, start_s, t);
                let heading = heading_deg.to_radians();
                let dir = Vector3f::new(heading.cos(), heading.sin(), 0.0);
                TruthSample {
                    pos: dir * s + Vector3f::new(0.0, 0.0, -altitude_m),
                    vel: dir * v,
                    accel: dir * a,
                    yaw: heading,
                    yaw_rate: 0.0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn circle() -> TrajectoryConfig {
        TrajectoryConfig::Circle {
            radius_m: 20.0,
            speed_m_s: 5.0,
            altitude_m: 10.0,
            ramp_s: 4.0,
            start_s: 1.0,
        }
    }

    #[test]
    fn resting_vehicle_feels_gravity_upwards() {
        let truth = TrajectoryConfig::default().sample(3.0);
        assert_abs_diff_eq!(truth.specific_force_body(), Vector3f::new(0.0, 0.0, -GRAVITY), epsilon = 1e-5);
    }

    #[test]
    fn circle_velocity_is_the_position_derivative() {
        let path = circle();
        let h = 1e-2;
        for t in [0.5, 2.0, 4.9, 8.0, 20.0] {
            let numeric = (path.sample(t + h).pos - path.sample(t - h).pos) / (2.0 * h);
            assert_abs_diff_eq!(numeric, path.sample(t).vel, epsilon = 2e-2);
        }
    }

    #[test]
    fn circle_acceleration_is_the_velocity_derivative() {
        let path = circle();
        let h = 1e-2;
        for t in [2.0, 8.0, 20.0] {
            let numeric = (path.sample(t + h).vel - path.sample(t - h).vel) / (2.0 * h);
            assert_abs_diff_eq!(numeric, path.sample(t).accel, epsilon = 2e-2);
        }
    }

    #[test]
    fn line_holds_speed_after_the_ramp() {
        let path = TrajectoryConfig::Line {
            speed_m_s: 10.0,
            heading_deg: 90.0,
            altitude_m: 0.0,
            ramp_s: 2.0,
            start_s: 0.0,
        };
        let truth = path.sample(5.0);
        assert_abs_diff_eq!(truth.vel, Vector3f::new(0.0, 10.0, 0.0), epsilon = 1e-4);
        assert_abs_diff_eq!(truth.pos[1], 40.0, epsilon = 1e-3);
        assert_eq!(truth.accel, Vector3f::zeros());
    }

    #[test]
    fn zero_radius_is_invalid() {
        let path = TrajectoryConfig::Circle {
            radius_m: 0.0,
            speed_m_s: 1.0,
            altitude_m: 0.0,
            ramp_s: 0.0,
            start_s: 0.0,
        };
        assert!(path.validate().is_err());
    }
}
