// ekf_core/src/estimation/state.rs

use core::ops::Range;

use nalgebra::{Matrix2, SMatrix};

use crate::frames::layout::{
    StateBlock, DANG_BIAS, DVEL_BIAS, MAG_B, MAG_I, POS, QUAT, VEL, WIND,
};
use crate::frames::{normalized, quat_rotation_jacobian, rotation_vector_jacobian};
use crate::types::{
    constrain, sq, Quatf, StateCovariance, StateVector, Vector2f, Vector3f, GRAVITY,
};

/// Largest permitted delta angle bias, as a rate (rad/s).
const MAX_GYRO_BIAS: f32 = 0.349_066;

/// Variance below which a delta velocity bias axis is considered collapsed.
const MIN_SAFE_DVEL_BIAS_VAR: f32 = 1e-9;

// =========================================================================
// == State Sample ==
// =========================================================================

/// The 24 estimated states, by name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSample {
    /// Body to NED rotation.
    pub quat_nominal: Quatf,
    /// NED velocity (m/s).
    pub vel: Vector3f,
    /// NED position (m).
    pub pos: Vector3f,
    /// Delta angle bias (rad).
    pub delta_ang_bias: Vector3f,
    /// Delta velocity bias (m/s).
    pub delta_vel_bias: Vector3f,
    /// NED earth magnetic field (gauss).
    pub mag_i: Vector3f,
    /// Body frame magnetometer bias (gauss).
    pub mag_b: Vector3f,
    /// North/East wind (m/s).
    pub wind_vel: Vector2f,
}

impl Default for StateSample {
    fn default() -> Self {
        Self {
            quat_nominal: Quatf::identity(),
            vel: Vector3f::zeros(),
            pos: Vector3f::zeros(),
            delta_ang_bias: Vector3f::zeros(),
            delta_vel_bias: Vector3f::zeros(),
            mag_i: Vector3f::zeros(),
            mag_b: Vector3f::zeros(),
            wind_vel: Vector2f::zeros(),
        }
    }
}

impl StateSample {
    pub fn to_vector(&self) -> StateVector {
        let mut x = StateVector::zeros();
        let q = &self.quat_nominal;
        x[QUAT] = q.w;
        x[QUAT + 1] = q.i;
        x[QUAT + 2] = q.j;
        x[QUAT + 3] = q.k;
        x.fixed_rows_mut::<3>(VEL).copy_from(&self.vel);
        x.fixed_rows_mut::<3>(POS).copy_from(&self.pos);
        x.fixed_rows_mut::<3>(DANG_BIAS).copy_from(&self.delta_ang_bias);
        x.fixed_rows_mut::<3>(DVEL_BIAS).copy_from(&self.delta_vel_bias);
        x.fixed_rows_mut::<3>(MAG_I).copy_from(&self.mag_i);
        x.fixed_rows_mut::<3>(MAG_B).copy_from(&self.mag_b);
        x.fixed_rows_mut::<2>(WIND).copy_from(&self.wind_vel);
        x
    }

    pub fn from_vector(x: &StateVector) -> Self {
        Self {
            quat_nominal: Quatf::new(x[QUAT], x[QUAT + 1], x[QUAT + 2], x[QUAT + 3]),
            vel: x.fixed_rows::<3>(VEL).into_owned(),
            pos: x.fixed_rows::<3>(POS).into_owned(),
            delta_ang_bias: x.fixed_rows::<3>(DANG_BIAS).into_owned(),
            delta_vel_bias: x.fixed_rows::<3>(DVEL_BIAS).into_owned(),
            mag_i: x.fixed_rows::<3>(MAG_I).into_owned(),
            mag_b: x.fixed_rows::<3>(MAG_B).into_owned(),
            wind_vel: x.fixed_rows::<2>(WIND).into_owned(),
        }
    }
}

// =========================================================================
// == Gain Masking ==
// =========================================================================

/// Which optional state blocks are currently being estimated. Blocks that
/// are not active receive no Kalman gain and have their covariance held at
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveStates {
    pub accel_bias: bool,
    pub mag_field: bool,
    pub wind: bool,
}

impl ActiveStates {
    pub fn mask_gain(&self, gain: &mut StateVector) {
        if !self.accel_bias {
            zero_block(gain, StateBlock::DeltaVelocityBias.range());
        }
        if !self.mag_field {
            zero_block(gain, MAG_I..MAG_B + 3);
        }
        if !self.wind {
            zero_block(gain, StateBlock::Wind.range());
        }
    }
}

fn zero_block(v: &mut StateVector, range: Range<usize>) {
    for i in range {
        v[i] = 0.0;
    }
}

/// Covariance of the magnetic field states kept while 3-axis fusion is off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedMagCovariance {
    pub earth_ne: Matrix2<f32>,
    pub earth_d: f32,
    pub body: Vector3f,
}

// =========================================================================
// == State & Covariance Store ==
// =========================================================================

/// The state vector and its error covariance, the single source of truth
/// that prediction and fusion read and mutate.
#[derive(Debug, Clone, PartialEq)]
pub struct StateStore {
    pub state: StateSample,
    pub p: StateCovariance,
}

impl Default for StateStore {
    fn default() -> Self {
        Self {
            state: StateSample::default(),
            p: StateCovariance::zeros(),
        }
    }
}

impl StateStore {
    /// Applies `state += gain * innovation` and renormalises the quaternion.
    pub fn fuse(&mut self, gain: &StateVector, innovation: f32) {
        let x = self.state.to_vector() + gain * innovation;
        self.state = StateSample::from_vector(&x);
        self.state.quat_nominal = normalized(&self.state.quat_nominal);
    }

    /// `h P hᵀ + R` for a scalar observation with Jacobian row `h`.
    pub fn innovation_variance(&self, h: &StateVector, obs_var: f32) -> f32 {
        (h.transpose() * self.p * h)[(0, 0)] + obs_var
    }

    /// `K = P hᵀ / S` with inactive blocks masked out.
    pub fn kalman_gain(&self, h: &StateVector, innov_var: f32, active: &ActiveStates) -> StateVector {
        let mut gain = self.p * h / innov_var;
        active.mask_gain(&mut gain);
        gain
    }

    /// Applies `P -= K (h P)` if no variance would go negative, then mirrors
    /// the result. Returns `false`, leaving `P` untouched, otherwise.
    pub fn update_covariance(&mut self, gain: &StateVector, h: &StateVector) -> bool {
        let hp = h.transpose() * self.p;
        let khp = gain * hp;
        let healthy = (0..khp.nrows()).all(|i| self.p[(i, i)] >= khp[(i, i)]);
        if !healthy {
            return false;
        }
        self.p -= khp;
        self.make_symmetric();
        true
    }

    pub fn make_symmetric(&mut self) {
        let pt = self.p.transpose();
        self.p = (self.p + pt) * 0.5;
    }

    /// Mirrors the sub-matrix spanning `range` and its cross terms.
    pub fn make_symmetric_block(&mut self, range: Range<usize>) {
        let n = self.p.nrows();
        for row in range {
            for col in 0..n {
                if col == row {
                    continue;
                }
                let mean = 0.5 * (self.p[(row, col)] + self.p[(col, row)]);
                self.p[(row, col)] = mean;
                self.p[(col, row)] = mean;
            }
        }
    }

    pub fn zero_rows(&mut self, range: Range<usize>) {
        for row in range {
            self.p.row_mut(row).fill(0.0);
        }
    }

    pub fn zero_cols(&mut self, range: Range<usize>) {
        for col in range {
            self.p.column_mut(col).fill(0.0);
        }
    }

    /// Zeroes every row and column of `range` except the diagonal.
    pub fn zero_off_diag(&mut self, range: Range<usize>) {
        let diag = self.p.diagonal();
        self.zero_rows(range.clone());
        self.zero_cols(range.clone());
        for i in range {
            self.p[(i, i)] = diag[i];
        }
    }

    /// Zeroes the rows and columns of `range` and sets its diagonal.
    pub fn set_diag(&mut self, range: Range<usize>, variance: f32) {
        self.zero_rows(range.clone());
        self.zero_cols(range.clone());
        for i in range {
            self.p[(i, i)] = variance;
        }
    }

    pub fn diagonal(&self) -> StateVector {
        self.p.diagonal()
    }

    /// Clamps variances into their usable range and drops inactive blocks.
    ///
    /// `dt` is the averaged filter period; the delta velocity bias ceiling
    /// scales with it.
    pub fn fix_covariance_errors(&mut self, active: &ActiveStates, dt: f32) {
        const QUAT_MAX: f32 = 1.0;
        const VEL_POS_MAX: f32 = 1e6;
        const BIAS_MAX: f32 = 1.0;
        const MAG_MAX: f32 = 1.0;
        const WIND_MAX: f32 = 1e6;

        for i in StateBlock::Quaternion.range() {
            self.p[(i, i)] = constrain(self.p[(i, i)], 0.0, QUAT_MAX);
        }
        for i in VEL..POS + 3 {
            self.p[(i, i)] = constrain(self.p[(i, i)], 1e-6, VEL_POS_MAX);
        }
        for i in StateBlock::DeltaAngleBias.range() {
            self.p[(i, i)] = constrain(self.p[(i, i)], 0.0, BIAS_MAX);
        }

        if active.accel_bias {
            let dvel = StateBlock::DeltaVelocityBias.range();
            let mut max_var = MIN_SAFE_DVEL_BIAS_VAR;
            let mut reset_required = false;
            for i in dvel.clone() {
                let var = self.p[(i, i)];
                if var > max_var {
                    max_var = var;
                } else if var < MIN_SAFE_DVEL_BIAS_VAR {
                    reset_required = true;
                }
            }
            // Keep the spread of the three axes within a factor of 100.
            let min_allowed = (0.01 * max_var).max(MIN_SAFE_DVEL_BIAS_VAR);
            let max_allowed = sq(0.1 * GRAVITY * dt).max(min_allowed);
            for i in dvel.clone() {
                self.p[(i, i)] = constrain(self.p[(i, i)], min_allowed, max_allowed);
            }
            if reset_required {
                self.zero_off_diag(dvel);
            }
        } else {
            self.zero_rows(StateBlock::DeltaVelocityBias.range());
            self.zero_cols(StateBlock::DeltaVelocityBias.range());
        }

        if active.mag_field {
            for i in MAG_I..MAG_B + 3 {
                self.p[(i, i)] = constrain(self.p[(i, i)], 0.0, MAG_MAX);
            }
        } else {
            self.zero_rows(MAG_I..MAG_B + 3);
            self.zero_cols(MAG_I..MAG_B + 3);
        }

        if active.wind {
            for i in StateBlock::Wind.range() {
                self.p[(i, i)] = constrain(self.p[(i, i)], 0.0, WIND_MAX);
            }
        } else {
            self.zero_rows(StateBlock::Wind.range());
            self.zero_cols(StateBlock::Wind.range());
        }

        self.make_symmetric();
    }

    /// Clamps every state to a physically plausible range.
    pub fn constrain_states(&mut self, dt: f32, acc_bias_lim: f32) {
        let s = &mut self.state;
        let q = &mut s.quat_nominal;
        q.w = constrain(q.w, -1.0, 1.0);
        q.i = constrain(q.i, -1.0, 1.0);
        q.j = constrain(q.j, -1.0, 1.0);
        q.k = constrain(q.k, -1.0, 1.0);

        let dang_lim = MAX_GYRO_BIAS * dt;
        let dvel_lim = acc_bias_lim * dt;
        s.vel = s.vel.map(|v| constrain(v, -1000.0, 1000.0));
        s.pos = s.pos.map(|v| constrain(v, -1e6, 1e6));
        s.delta_ang_bias = s.delta_ang_bias.map(|v| constrain(v, -dang_lim, dang_lim));
        s.delta_vel_bias = s.delta_vel_bias.map(|v| constrain(v, -dvel_lim, dvel_lim));
        s.mag_i = s.mag_i.map(|v| constrain(v, -1.0, 1.0));
        s.mag_b = s.mag_b.map(|v| constrain(v, -0.5, 0.5));
        s.wind_vel = s.wind_vel.map(|v| constrain(v, -100.0, 100.0));
    }

    // --- Attitude covariance helpers ---

    fn quat_block(&self) -> nalgebra::Matrix4<f32> {
        self.p.fixed_view::<4, 4>(QUAT, QUAT).into_owned()
    }

    /// Variances of the body frame rotation vector implied by the
    /// quaternion covariance.
    pub fn calc_rot_vec_variances(&self) -> Vector3f {
        let jac = rotation_vector_jacobian(&normalized(&self.state.quat_nominal));
        let cov = jac * self.quat_block() * jac.transpose();
        cov.diagonal()
    }

    /// Sets the quaternion covariance from body rotation vector variances.
    pub fn initialise_quat_covariances(&mut self, rot_vec_var: &Vector3f) {
        let jac = quat_rotation_jacobian(&normalized(&self.state.quat_nominal));
        let cov = jac * SMatrix::<f32, 3, 3>::from_diagonal(rot_vec_var) * jac.transpose();
        self.p.fixed_view_mut::<4, 4>(QUAT, QUAT).copy_from(&cov);
    }

    /// Adds variance to the quaternion states for an earth frame yaw error.
    pub fn increase_quat_yaw_err_variance(&mut self, yaw_variance: f32) {
        let q = &self.state.quat_nominal;
        let g = nalgebra::Vector4::new(-q.k, -q.j, q.i, q.w) * 0.5;
        let added = g * g.transpose() * yaw_variance;
        let mut block = self.p.fixed_view_mut::<4, 4>(QUAT, QUAT);
        block += added;
    }

    /// Removes correlation between the quaternion and all other states.
    pub fn uncorrelate_quat_states(&mut self) {
        let q = StateBlock::Quaternion.range();
        for i in q.clone() {
            for j in q.end..self.p.ncols() {
                self.p[(i, j)] = 0.0;
                self.p[(j, i)] = 0.0;
            }
        }
    }

    // --- Magnetic field and wind covariance helpers ---

    pub fn reset_mag_covariance(&mut self, variance: f32) {
        self.set_diag(MAG_I..MAG_B + 3, variance);
    }

    pub fn save_mag_covariance(&self) -> SavedMagCovariance {
        SavedMagCovariance {
            earth_ne: self.p.fixed_view::<2, 2>(MAG_I, MAG_I).into_owned(),
            earth_d: self.p[(MAG_I + 2, MAG_I + 2)],
            body: Vector3f::new(
                self.p[(MAG_B, MAG_B)],
                self.p[(MAG_B + 1, MAG_B + 1)],
                self.p[(MAG_B + 2, MAG_B + 2)],
            ),
        }
    }

    /// Restores saved magnetic field variances, without cross terms to any
    /// other state.
    pub fn load_mag_covariance(&mut self, saved: &SavedMagCovariance) {
        self.zero_rows(MAG_I..MAG_B + 3);
        self.zero_cols(MAG_I..MAG_B + 3);
        self.p
            .fixed_view_mut::<2, 2>(MAG_I, MAG_I)
            .copy_from(&saved.earth_ne);
        self.p[(MAG_I + 2, MAG_I + 2)] = saved.earth_d;
        for i in 0..3 {
            self.p[(MAG_B + i, MAG_B + i)] = saved.body[i];
        }
    }

    /// Sets the wind covariance, with no cross terms, from a 2x2 block.
    pub fn set_wind_covariance(&mut self, cov: &Matrix2<f32>) {
        self.zero_rows(StateBlock::Wind.range());
        self.zero_cols(StateBlock::Wind.range());
        self.p.fixed_view_mut::<2, 2>(WIND, WIND).copy_from(cov);
    }

    pub fn is_symmetric(&self, tolerance: f32) -> bool {
        (self.p - self.p.transpose()).amax() <= tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::quat_from_euler;
    use crate::types::NUM_STATES;
    use approx::assert_abs_diff_eq;

    fn store_with_diag(var: f32) -> StateStore {
        let mut store = StateStore::default();
        store.p = StateCovariance::identity() * var;
        store
    }

    #[test]
    fn vector_round_trip_preserves_layout() {
        let sample = StateSample {
            quat_nominal: quat_from_euler(0.1, 0.2, 0.3),
            vel: Vector3f::new(1.0, 2.0, 3.0),
            pos: Vector3f::new(4.0, 5.0, 6.0),
            delta_ang_bias: Vector3f::new(7.0, 8.0, 9.0),
            delta_vel_bias: Vector3f::new(10.0, 11.0, 12.0),
            mag_i: Vector3f::new(13.0, 14.0, 15.0),
            mag_b: Vector3f::new(16.0, 17.0, 18.0),
            wind_vel: Vector2f::new(19.0, 20.0),
        };
        let x = sample.to_vector();
        assert_eq!(x[VEL + 2], 3.0);
        assert_eq!(x[WIND + 1], 20.0);
        assert_eq!(StateSample::from_vector(&x), sample);
    }

    #[test]
    fn masked_gain_leaves_inactive_states_alone() {
        let mut gain = StateVector::repeat(1.0);
        ActiveStates::default().mask_gain(&mut gain);
        for i in DVEL_BIAS..NUM_STATES {
            assert_eq!(gain[i], 0.0, "state {i}");
        }
        assert_eq!(gain[POS], 1.0);
    }

    #[test]
    fn scalar_update_reduces_observed_variance() {
        let mut store = store_with_diag(4.0);
        let mut h = StateVector::zeros();
        h[POS] = 1.0;
        let s = store.innovation_variance(&h, 1.0);
        assert_abs_diff_eq!(s, 5.0);
        let k = store.kalman_gain(&h, s, &ActiveStates::default());
        assert!(store.update_covariance(&k, &h));
        assert_abs_diff_eq!(store.p[(POS, POS)], 0.8, epsilon = 1e-6);
        assert!(store.is_symmetric(0.0));
    }

    #[test]
    fn unhealthy_update_is_refused_without_mutation() {
        let mut store = store_with_diag(1.0);
        let before = store.clone();
        let mut h = StateVector::zeros();
        h[VEL] = 1.0;
        // A gain larger than the covariance supports.
        let mut k = StateVector::zeros();
        k[VEL] = 5.0;
        assert!(!store.update_covariance(&k, &h));
        assert_eq!(store, before);
    }

    #[test]
    fn fix_covariance_errors_clears_inactive_blocks() {
        let mut store = store_with_diag(0.5);
        store.p[(MAG_I, VEL)] = 0.1;
        store.p[(VEL, MAG_I)] = 0.1;
        store.fix_covariance_errors(&ActiveStates::default(), 0.012);
        assert_eq!(store.p[(MAG_I, MAG_I)], 0.0);
        assert_eq!(store.p[(VEL, MAG_I)], 0.0);
        assert_eq!(store.p[(WIND, WIND)], 0.0);
        assert_eq!(store.p[(DVEL_BIAS, DVEL_BIAS)], 0.0);
        assert_eq!(store.p[(VEL, VEL)], 0.5);
    }

    #[test]
    fn fix_covariance_errors_bounds_accel_bias_spread() {
        let mut store = store_with_diag(1e-4);
        store.p[(DVEL_BIAS, DVEL_BIAS)] = 1e-12;
        let active = ActiveStates {
            accel_bias: true,
            ..Default::default()
        };
        store.fix_covariance_errors(&active, 0.012);
        let max = store.p[(DVEL_BIAS + 1, DVEL_BIAS + 1)];
        assert!(store.p[(DVEL_BIAS, DVEL_BIAS)] >= 0.01 * max - 1e-12);
    }

    #[test]
    fn quat_covariance_round_trips_through_rotation_vector() {
        let mut store = StateStore::default();
        store.state.quat_nominal = quat_from_euler(0.2, -0.1, 1.3);
        let var = Vector3f::new(0.01, 0.02, 0.03);
        store.initialise_quat_covariances(&var);
        assert_abs_diff_eq!(store.calc_rot_vec_variances(), var, epsilon = 1e-6);
    }

    #[test]
    fn yaw_variance_lands_on_the_vertical_axis() {
        let mut store = StateStore::default();
        store.state.quat_nominal = quat_from_euler(0.0, 0.0, 0.7);
        store.increase_quat_yaw_err_variance(0.04);
        let var = store.calc_rot_vec_variances();
        assert_abs_diff_eq!(var[0], 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(var[1], 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(var[2], 0.04, epsilon = 1e-6);
    }

    #[test]
    fn uncorrelate_keeps_quat_block() {
        let mut store = store_with_diag(1.0);
        store.p[(0, 5)] = 0.3;
        store.p[(5, 0)] = 0.3;
        store.p[(1, 2)] = 0.2;
        store.uncorrelate_quat_states();
        assert_eq!(store.p[(0, 5)], 0.0);
        assert_eq!(store.p[(5, 0)], 0.0);
        assert_eq!(store.p[(1, 2)], 0.2);
    }

    #[test]
    fn constrain_states_clamps_biases_with_dt() {
        let mut store = StateStore::default();
        store.state.delta_vel_bias = Vector3f::new(1.0, -1.0, 0.001);
        store.constrain_states(0.01, 0.4);
        assert_abs_diff_eq!(store.state.delta_vel_bias[0], 0.004, epsilon = 1e-7);
        assert_abs_diff_eq!(store.state.delta_vel_bias[1], -0.004, epsilon = 1e-7);
        assert_abs_diff_eq!(store.state.delta_vel_bias[2], 0.001, epsilon = 1e-7);
    }

    #[test]
    fn mag_covariance_save_and_load() {
        let mut store = store_with_diag(0.0);
        store.reset_mag_covariance(0.0025);
        let saved = store.save_mag_covariance();
        store.set_diag(MAG_I..MAG_B + 3, 0.0);
        store.load_mag_covariance(&saved);
        assert_eq!(store.p[(MAG_I + 2, MAG_I + 2)], 0.0025);
        assert_eq!(store.p[(MAG_B + 1, MAG_B + 1)], 0.0025);
    }
}
