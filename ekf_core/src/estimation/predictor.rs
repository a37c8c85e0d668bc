// ekf_core/src/estimation/predictor.rs

//! Strapdown state prediction and covariance propagation on the delayed
//! horizon, plus the collector that down-samples raw IMU data to the filter
//! rate.

use nalgebra::SMatrix;
use tracing::debug;

use crate::estimation::ekf::Ekf;
use crate::estimation::state::StateSample;
use crate::frames::layout::{DANG_BIAS, DVEL_BIAS, MAG_B, MAG_I, POS, QUAT, VEL, WIND};
use crate::frames::{
    normalized, quat_from_rotation_vector, quat_right_matrix, quat_rotation_jacobian,
    quat_to_dcm, quat_to_rotation_vector, rotate_jacobian,
};
use crate::messages::ImuSample;
use crate::params::fusion_mask;
use crate::types::{
    constrain, sq, Matrix3f, Quatf, StateCovariance, Vector2f, Vector3f, GRAVITY,
};

/// Longest gap between filter cycles that is still propagated (s).
const MAX_PREDICTION_DT: f32 = 0.5;

/// Accelerometer noise used while bad vertical accelerometer data is being
/// detected (m/s^2).
const BAD_ACC_NOISE: f32 = 4.9;

// =========================================================================
// == IMU Down-sampling ==
// =========================================================================

/// Accumulates high rate IMU samples into one sample per filter period and
/// tracks vibration levels.
#[derive(Debug, Clone)]
pub struct ImuDownSampler {
    accumulated: ImuSample,
    /// Rotation from the start of the accumulation period.
    q_accumulated: Quatf,
    /// Advance applied to the collection period so the average cycle time
    /// converges on the target.
    collection_time_adj: f32,
    delta_ang_prev: Vector3f,
    delta_vel_prev: Vector3f,
    /// Coning, high frequency gyro and high frequency accel vibration.
    pub vibe_metrics: [f32; 3],
}

impl Default for ImuDownSampler {
    fn default() -> Self {
        Self {
            accumulated: ImuSample::default(),
            q_accumulated: Quatf::identity(),
            collection_time_adj: 0.0,
            delta_ang_prev: Vector3f::zeros(),
            delta_vel_prev: Vector3f::zeros(),
            vibe_metrics: [0.0; 3],
        }
    }
}

impl ImuDownSampler {
    /// Adds one raw sample. Returns the down-sampled sample once the target
    /// period has been accumulated.
    pub fn collect(&mut self, imu: &ImuSample, target_dt: f32) -> Option<ImuSample> {
        self.update_vibration_metrics(imu);

        self.accumulated.delta_ang_dt += imu.delta_ang_dt;
        self.accumulated.delta_vel_dt += imu.delta_vel_dt;

        let delta_q = quat_from_rotation_vector(&imu.delta_ang);
        self.q_accumulated = normalized(&(self.q_accumulated * delta_q));

        // Keep the accumulated delta velocity in the latest body frame,
        // taking the new sample as measured halfway through its rotation.
        let delta_r = quat_to_dcm(&delta_q.conjugate());
        self.accumulated.delta_vel = delta_r * self.accumulated.delta_vel;
        self.accumulated.delta_vel += (imu.delta_vel + delta_r * imu.delta_vel) * 0.5;

        if self.accumulated.delta_ang_dt < target_dt - self.collection_time_adj {
            return None;
        }

        self.collection_time_adj += 0.01 * (self.accumulated.delta_ang_dt - target_dt);
        self.collection_time_adj =
            constrain(self.collection_time_adj, -0.5 * target_dt, 0.5 * target_dt);

        let sample = ImuSample {
            delta_ang: quat_to_rotation_vector(&self.q_accumulated),
            delta_vel: self.accumulated.delta_vel,
            delta_ang_dt: self.accumulated.delta_ang_dt,
            delta_vel_dt: self.accumulated.delta_vel_dt,
            time_us: imu.time_us,
        };
        self.accumulated = ImuSample::default();
        self.q_accumulated = Quatf::identity();
        Some(sample)
    }

    fn update_vibration_metrics(&mut self, imu: &ImuSample) {
        let coning = imu.delta_ang.cross(&self.delta_ang_prev).norm();
        let gyro_hf = (imu.delta_ang - self.delta_ang_prev).norm();
        let accel_hf = (imu.delta_vel - self.delta_vel_prev).norm();
        for (metric, value) in self.vibe_metrics.iter_mut().zip([coning, gyro_hf, accel_hf]) {
            *metric = 0.99 * *metric + 0.01 * value;
        }
        self.delta_ang_prev = imu.delta_ang;
        self.delta_vel_prev = imu.delta_vel;
    }
}

// =========================================================================
// == State Prediction ==
// =========================================================================

/// By-products of one strapdown step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatePrediction {
    /// Body to earth rotation after the update.
    pub r_to_earth: Matrix3f,
    /// Bias corrected delta angle, earth rotation removed (rad).
    pub delta_ang: Vector3f,
    /// Bias corrected delta velocity rotated into NED, gravity excluded (m/s).
    pub delta_vel_ef: Vector3f,
}

/// Delta angle of `imu` with the gyro bias and the earth rotation seen
/// from `state`'s attitude removed (rad).
fn corrected_delta_ang(state: &StateSample, imu: &ImuSample, earth_rate_ned: &Vector3f) -> Vector3f {
    let r_prev = quat_to_dcm(&state.quat_nominal);
    imu.delta_ang - state.delta_ang_bias - r_prev.transpose() * earth_rate_ned * imu.delta_ang_dt
}

/// Integrates one down-sampled IMU sample into the state.
pub fn predict_state(
    state: &mut StateSample,
    imu: &ImuSample,
    earth_rate_ned: &Vector3f,
) -> StatePrediction {
    let delta_ang = corrected_delta_ang(state, imu, earth_rate_ned);
    let dq = quat_from_rotation_vector(&delta_ang);
    state.quat_nominal = normalized(&(state.quat_nominal * dq));

    let r_to_earth = quat_to_dcm(&state.quat_nominal);
    let delta_vel_ef = r_to_earth * (imu.delta_vel - state.delta_vel_bias);

    let vel_prev = state.vel;
    state.vel += delta_vel_ef;
    state.vel[2] += GRAVITY * imu.delta_vel_dt;
    state.pos += (state.vel + vel_prev) * (imu.delta_vel_dt * 0.5);

    StatePrediction {
        r_to_earth,
        delta_ang,
        delta_vel_ef,
    }
}

// =========================================================================
// == Covariance Prediction ==
// =========================================================================

/// Process noise for one covariance prediction step. Standard deviations
/// are per step, already scaled by the step length.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessNoise {
    /// Delta angle noise (rad).
    pub delta_ang: f32,
    /// Delta velocity noise (m/s).
    pub delta_vel: f32,
    pub delta_ang_bias: f32,
    /// Zero while accel bias learning is inhibited.
    pub delta_vel_bias: f32,
    /// Zero unless 3-axis magnetometer fusion is running.
    pub mag_earth: f32,
    pub mag_body: f32,
    /// Zero unless wind is estimated.
    pub wind: f32,
}

/// Propagates the covariance through one IMU step, `P = F P Fᵀ + G N Gᵀ + Q`.
///
/// `prior` is the state before [`predict_state`] ran on `imu` with the same
/// `earth_rate_ned`; the Jacobians are those of that update with respect to
/// the prior state.
pub fn predict_covariance(
    p: &StateCovariance,
    prior: &StateSample,
    imu: &ImuSample,
    earth_rate_ned: &Vector3f,
    dt: f32,
    noise: &ProcessNoise,
) -> StateCovariance {
    let q_prior = prior.quat_nominal;
    let dq = quat_from_rotation_vector(&corrected_delta_ang(prior, imu, earth_rate_ned));
    let q_next = normalized(&(q_prior * dq));
    let r_next = quat_to_dcm(&q_next);
    let dvel = imu.delta_vel - prior.delta_vel_bias;

    let dq_dq = quat_right_matrix(&dq);
    let dq_dang = quat_rotation_jacobian(&q_prior);
    let dv_dq = rotate_jacobian(&q_next, &dvel);

    // --- 1. State transition Jacobian ---
    let mut f = StateCovariance::identity();
    f.fixed_view_mut::<4, 4>(QUAT, QUAT).copy_from(&dq_dq);
    f.fixed_view_mut::<4, 3>(QUAT, DANG_BIAS).copy_from(&(-dq_dang));

    let fv_q = dv_dq * dq_dq;
    let fv_dab = -(dv_dq * dq_dang);
    let fv_dvb = -r_next;
    f.fixed_view_mut::<3, 4>(VEL, QUAT).copy_from(&fv_q);
    f.fixed_view_mut::<3, 3>(VEL, DANG_BIAS).copy_from(&fv_dab);
    f.fixed_view_mut::<3, 3>(VEL, DVEL_BIAS).copy_from(&fv_dvb);

    let half_dt = 0.5 * dt;
    f.fixed_view_mut::<3, 3>(POS, VEL)
        .copy_from(&(Matrix3f::identity() * dt));
    f.fixed_view_mut::<3, 4>(POS, QUAT).copy_from(&(fv_q * half_dt));
    f.fixed_view_mut::<3, 3>(POS, DANG_BIAS).copy_from(&(fv_dab * half_dt));
    f.fixed_view_mut::<3, 3>(POS, DVEL_BIAS).copy_from(&(fv_dvb * half_dt));

    // --- 2. IMU noise mapped through the attitude and velocity update ---
    let mut g = SMatrix::<f32, 24, 6>::zeros();
    g.fixed_view_mut::<4, 3>(QUAT, 0).copy_from(&dq_dang);
    g.fixed_view_mut::<3, 3>(VEL, 0).copy_from(&(dv_dq * dq_dang));
    g.fixed_view_mut::<3, 3>(VEL, 3).copy_from(&r_next);
    g.fixed_view_mut::<3, 3>(POS, 0).copy_from(&(dv_dq * dq_dang * half_dt));
    g.fixed_view_mut::<3, 3>(POS, 3).copy_from(&(r_next * half_dt));

    let mut n = SMatrix::<f32, 6, 6>::zeros();
    for i in 0..3 {
        n[(i, i)] = sq(noise.delta_ang);
        n[(i + 3, i + 3)] = sq(noise.delta_vel);
    }

    let mut next = f * p * f.transpose() + g * n * g.transpose();

    // --- 3. Random walk of the bias, field and wind states ---
    let walks = [
        (DANG_BIAS, 3, noise.delta_ang_bias),
        (DVEL_BIAS, 3, noise.delta_vel_bias),
        (MAG_I, 3, noise.mag_earth),
        (MAG_B, 3, noise.mag_body),
        (WIND, 2, noise.wind),
    ];
    for (first, len, sigma) in walks {
        for i in first..first + len {
            next[(i, i)] += sq(sigma);
        }
    }
    next
}

impl Ekf {
    /// Runs the strapdown step on the delayed IMU sample.
    pub(crate) fn predict_state(&mut self) {
        let imu = self.imu_sample_delayed;
        let prediction = predict_state(&mut self.store.state, &imu, &self.earth_rate_ned);
        self.r_to_earth = prediction.r_to_earth;

        // Manoeuvre metrics with roughly a one second time constant.
        let alpha = 1.0 - imu.delta_vel_dt;
        self.accel_lpf_ne = self.accel_lpf_ne * alpha
            + Vector2f::new(prediction.delta_vel_ef[0], prediction.delta_vel_ef[1]);
        if imu.delta_ang_dt > 0.0 {
            let yaw_rate = (self.r_to_earth.row(2) * prediction.delta_ang)[0] / imu.delta_ang_dt;
            self.yaw_rate_lpf_ef = 0.95 * self.yaw_rate_lpf_ef + 0.05 * yaw_rate;
        }

        self.store
            .constrain_states(self.dt_ekf_avg, self.params.acc_bias_lim);

        let period = self.params.filter_update_period_s();
        let input = constrain(
            0.5 * (imu.delta_vel_dt + imu.delta_ang_dt),
            0.5 * period,
            2.0 * period,
        );
        self.dt_ekf_avg = 0.99 * self.dt_ekf_avg + 0.01 * input;
    }

    /// Propagates the covariance for the delayed IMU sample. `prior` is the
    /// state before [`Ekf::predict_state`] ran.
    pub(crate) fn predict_covariance(&mut self, prior: &StateSample) {
        let imu = self.imu_sample_delayed;
        let raw_dt = 0.5 * (imu.delta_ang_dt + imu.delta_vel_dt);
        if !(raw_dt > 0.0 && raw_dt <= MAX_PREDICTION_DT) {
            debug!(dt = raw_dt, "skipping covariance prediction");
            return;
        }
        let period = self.params.filter_update_period_s();
        let dt = constrain(raw_dt, 0.5 * period, 2.0 * period);

        self.update_accel_bias_inhibit(&imu, dt);

        let accel_noise = if self.bad_vert_accel_detected {
            BAD_ACC_NOISE
        } else {
            constrain(self.params.accel_noise, 0.0, 1.0)
        };
        let noise = ProcessNoise {
            delta_ang: constrain(self.params.gyro_noise, 0.0, 1.0) * dt,
            delta_vel: accel_noise * dt,
            delta_ang_bias: dt * dt * constrain(self.params.gyro_bias_p_noise, 0.0, 1.0),
            delta_vel_bias: if self.accel_bias_inhibit {
                0.0
            } else {
                dt * dt * constrain(self.params.accel_bias_p_noise, 0.0, 1.0)
            },
            mag_earth: if self.control.mag_3d {
                dt * constrain(self.params.mage_p_noise, 0.0, 1.0)
            } else {
                0.0
            },
            mag_body: if self.control.mag_3d {
                dt * constrain(self.params.magb_p_noise, 0.0, 1.0)
            } else {
                0.0
            },
            wind: if self.control.wind {
                dt * constrain(self.params.wind_vel_p_noise, 0.0, 1.0)
            } else {
                0.0
            },
        };

        self.store.p = predict_covariance(&self.store.p, prior, &imu, &self.earth_rate_ned, dt, &noise);
        let active = self.active_states();
        self.store.fix_covariance_errors(&active, self.dt_ekf_avg);
    }

    /// Stops accel bias learning during aggressive manoeuvres or when bad
    /// accelerometer data is suspected, restoring the saved variances when
    /// learning resumes.
    fn update_accel_bias_inhibit(&mut self, imu: &ImuSample, dt: f32) {
        let alpha = constrain(dt / self.params.acc_bias_learn_tc, 0.0, 1.0);
        let beta = 1.0 - alpha;
        if imu.delta_ang_dt > 0.0 {
            self.ang_rate_mag_filt =
                (imu.delta_ang.norm() / imu.delta_ang_dt).max(beta * self.ang_rate_mag_filt);
        }
        if imu.delta_vel_dt > 0.0 {
            self.accel_mag_filt =
                (imu.delta_vel.norm() / imu.delta_vel_dt).max(beta * self.accel_mag_filt);
        }

        let inhibit = self.params.uses(fusion_mask::INHIBIT_ACC_BIAS)
            || self.ang_rate_mag_filt > self.params.acc_bias_learn_gyr_lim
            || self.accel_mag_filt > self.params.acc_bias_learn_acc_lim
            || self.bad_vert_accel_detected;

        if inhibit && !self.accel_bias_inhibit {
            for i in 0..3 {
                self.prev_dvel_bias_var[i] = self.store.p[(DVEL_BIAS + i, DVEL_BIAS + i)];
            }
            debug!("accel bias learning inhibited");
        } else if !inhibit && self.accel_bias_inhibit {
            for i in 0..3 {
                self.store.p[(DVEL_BIAS + i, DVEL_BIAS + i)] = self.prev_dvel_bias_var[i];
            }
            debug!("accel bias learning resumed");
        }
        self.accel_bias_inhibit = inhibit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::state::StateStore;
    use crate::frames::{quat_from_euler, quat_to_vector4};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn predict(store: &mut StateStore, imu: &ImuSample, dt: f32, noise: &ProcessNoise) {
        let prior = store.state;
        predict_state(&mut store.state, imu, &Vector3f::zeros());
        store.p = predict_covariance(&store.p, &prior, imu, &Vector3f::zeros(), dt, noise);
        store.make_symmetric();
    }

    fn static_imu(dt: f32, time_us: u64) -> ImuSample {
        ImuSample {
            delta_ang: Vector3f::zeros(),
            delta_vel: Vector3f::new(0.0, 0.0, -GRAVITY * dt),
            delta_ang_dt: dt,
            delta_vel_dt: dt,
            time_us,
        }
    }

    #[test]
    fn level_static_imu_holds_position() {
        let mut state = StateSample::default();
        for i in 0..100 {
            predict_state(&mut state, &static_imu(0.01, i * 10_000), &Vector3f::zeros());
        }
        assert_abs_diff_eq!(state.vel.norm(), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(state.pos.norm(), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(state.quat_nominal.norm(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn delta_angle_rotates_the_attitude() {
        let mut state = StateSample::default();
        let imu = ImuSample {
            delta_ang: Vector3f::new(0.0, 0.0, 0.1),
            ..static_imu(0.01, 0)
        };
        let prediction = predict_state(&mut state, &imu, &Vector3f::zeros());
        let expected = quat_from_euler(0.0, 0.0, 0.1);
        assert_abs_diff_eq!(state.quat_nominal.coords, expected.coords, epsilon = 1e-6);
        assert_abs_diff_eq!(prediction.delta_ang[2], 0.1, epsilon = 1e-7);
    }

    #[test]
    fn covariance_grows_and_stays_symmetric() {
        let mut store = StateStore::default();
        store.state.quat_nominal = quat_from_euler(0.1, -0.2, 0.4);
        store.p = StateCovariance::identity() * 1e-3;
        let noise = ProcessNoise {
            delta_ang: 0.015 * 0.01,
            delta_vel: 0.35 * 0.01,
            ..Default::default()
        };
        let before = store.diagonal();
        for i in 0..50 {
            predict(&mut store, &static_imu(0.01, i * 10_000), 0.01, &noise);
        }
        let after = store.diagonal();
        for i in VEL..POS + 3 {
            assert!(after[i] > before[i], "state {i} did not grow");
        }
        assert!(store.is_symmetric(1e-6));
    }

    #[test]
    fn transition_matches_finite_difference_of_velocity() {
        let prior = StateSample {
            quat_nominal: quat_from_euler(0.3, 0.1, -0.5),
            ..Default::default()
        };
        let imu = ImuSample {
            delta_ang: Vector3f::new(0.01, -0.02, 0.03),
            delta_vel: Vector3f::new(0.1, 0.2, -0.1),
            ..static_imu(0.01, 0)
        };
        // Only the gyro bias variance is non-zero, so the velocity variance
        // after one step is |dv/db|^2 summed over the bias axes.
        let mut p = StateCovariance::zeros();
        for i in DANG_BIAS..DANG_BIAS + 3 {
            p[(i, i)] = 1.0;
        }
        let next = predict_covariance(&p, &prior, &imu, &Vector3f::zeros(), 0.01, &ProcessNoise::default());

        let step = 1e-3;
        let mut expected = 0.0;
        for axis in 0..3 {
            let mut plus = prior;
            let mut minus = prior;
            plus.delta_ang_bias[axis] += step;
            minus.delta_ang_bias[axis] -= step;
            predict_state(&mut plus, &imu, &Vector3f::zeros());
            predict_state(&mut minus, &imu, &Vector3f::zeros());
            let d = (plus.vel[0] - minus.vel[0]) / (2.0 * step);
            expected += d * d;
        }
        assert_relative_eq!(next[(VEL, VEL)], expected, max_relative = 0.05);
    }

    #[test]
    fn attitude_jacobian_includes_the_earth_rotation() {
        let prior = StateSample {
            quat_nominal: quat_from_euler(0.2, -0.1, 0.7),
            delta_ang_bias: Vector3f::new(1e-4, 0.0, -2e-4),
            ..Default::default()
        };
        let imu = ImuSample {
            delta_ang: Vector3f::new(0.02, 0.01, -0.03),
            ..static_imu(0.01, 0)
        };
        // Exaggerated so a missing correction would show.
        let earth_rate = Vector3f::new(2.0, -1.0, 3.0);

        // With P = q qᵀ on the attitude block the propagated block is the
        // outer product of the transitioned quaternion.
        let q = quat_to_vector4(&prior.quat_nominal);
        let mut p = StateCovariance::zeros();
        p.fixed_view_mut::<4, 4>(QUAT, QUAT).copy_from(&(q * q.transpose()));
        let next = predict_covariance(&p, &prior, &imu, &earth_rate, 0.01, &ProcessNoise::default());

        let mut state = prior;
        predict_state(&mut state, &imu, &earth_rate);
        let q_next = quat_to_vector4(&state.quat_nominal);
        let block = next.fixed_view::<4, 4>(QUAT, QUAT).into_owned();
        assert_abs_diff_eq!(block, q_next * q_next.transpose(), epsilon = 1e-5);
    }

    #[test]
    fn down_sampler_emits_at_the_filter_period() {
        let mut sampler = ImuDownSampler::default();
        let raw = ImuSample {
            delta_ang: Vector3f::new(0.0, 0.0, 0.004),
            ..static_imu(0.004, 0)
        };
        assert!(sampler.collect(&raw, 0.011).is_none());
        assert!(sampler.collect(&ImuSample { time_us: 4_000, ..raw }, 0.011).is_none());
        let sample = sampler
            .collect(&ImuSample { time_us: 8_000, ..raw }, 0.011)
            .expect("third sample completes the period");
        assert_abs_diff_eq!(sample.delta_ang_dt, 0.012, epsilon = 1e-6);
        assert_abs_diff_eq!(sample.delta_ang[2], 0.012, epsilon = 1e-5);
        assert_abs_diff_eq!(sample.delta_vel[2], -GRAVITY * 0.012, epsilon = 1e-4);
        assert_eq!(sample.time_us, 8_000);
    }
}
