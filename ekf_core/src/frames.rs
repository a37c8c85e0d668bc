// ekf_core/src/frames.rs

//! Rotation helpers shared by the predictor, the fusion routines and the
//! output predictor.
//!
//! Quaternions are stored raw (`nalgebra::Quaternion`, coefficients
//! `w, i, j, k`) because the filter estimates all four components and
//! renormalises explicitly; the helpers below never assume unit norm unless
//! they say so.

pub mod geo;
pub mod layout;

use nalgebra::{Matrix4, Rotation3, SMatrix, UnitQuaternion};

use crate::types::{Matrix3f, Quatf, Vector3f};

/// Rotation matrix of a quaternion, body to earth. Uses the homogeneous
/// form so the result scales with `|q|^2` when `q` is not normalised.
pub fn quat_to_dcm(q: &Quatf) -> Matrix3f {
    let (a, b, c, d) = (q.w, q.i, q.j, q.k);
    let (aa, bb, cc, dd) = (a * a, b * b, c * c, d * d);
    Matrix3f::new(
        aa + bb - cc - dd,
        2.0 * (b * c - a * d),
        2.0 * (b * d + a * c),
        2.0 * (b * c + a * d),
        aa - bb + cc - dd,
        2.0 * (c * d - a * b),
        2.0 * (b * d - a * c),
        2.0 * (c * d + a * b),
        aa - bb - cc + dd,
    )
}

/// Closed-form quaternion for a rotation vector.
pub fn quat_from_rotation_vector(rot: &Vector3f) -> Quatf {
    let theta = rot.norm();
    if theta < 1e-10 {
        return Quatf::identity();
    }
    let half = 0.5 * theta;
    let axis = rot / theta;
    Quatf::from_parts(half.cos(), axis * half.sin())
}

/// Rotation vector of a (normalised) quaternion, taking the short way round.
pub fn quat_to_rotation_vector(q: &Quatf) -> Vector3f {
    let q = if q.w < 0.0 { -*q } else { *q };
    let imag = q.imag();
    let sin_half = imag.norm();
    if sin_half < 1e-7 {
        return imag * 2.0;
    }
    let angle = 2.0 * sin_half.atan2(q.w);
    imag * (angle / sin_half)
}

pub fn normalized(q: &Quatf) -> Quatf {
    let norm = q.norm();
    if norm > 1e-12 {
        q / norm
    } else {
        Quatf::identity()
    }
}

/// Quaternion of a rotation matrix, body to earth.
pub fn quat_from_dcm(dcm: &Matrix3f) -> Quatf {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*dcm)).into_inner()
}

/// Quaternion from a 3-2-1 (yaw, pitch, roll) Euler sequence.
pub fn quat_from_euler(roll: f32, pitch: f32, yaw: f32) -> Quatf {
    let (sr, cr) = (0.5 * roll).sin_cos();
    let (sp, cp) = (0.5 * pitch).sin_cos();
    let (sy, cy) = (0.5 * yaw).sin_cos();
    Quatf::new(
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    )
}

/// Rotation matrix from a 3-2-1 Euler sequence.
pub fn dcm_from_euler_321(roll: f32, pitch: f32, yaw: f32) -> Matrix3f {
    quat_to_dcm(&quat_from_euler(roll, pitch, yaw))
}

/// Euler angles (roll, pitch, yaw) of the 3-2-1 sequence.
pub fn euler_321(dcm: &Matrix3f) -> (f32, f32, f32) {
    let pitch = (-dcm[(2, 0)]).clamp(-1.0, 1.0).asin();
    let roll = dcm[(2, 1)].atan2(dcm[(2, 2)]);
    let yaw = dcm[(1, 0)].atan2(dcm[(0, 0)]);
    (roll, pitch, yaw)
}

/// Euler angles (roll, pitch, yaw) of the 3-1-2 sequence.
pub fn euler_312(dcm: &Matrix3f) -> (f32, f32, f32) {
    let roll = dcm[(2, 1)].clamp(-1.0, 1.0).asin();
    let pitch = (-dcm[(2, 0)]).atan2(dcm[(2, 2)]);
    let yaw = (-dcm[(0, 1)]).atan2(dcm[(1, 1)]);
    (roll, pitch, yaw)
}

/// Rotation matrix from a 3-1-2 Euler sequence.
pub fn dcm_from_euler_312(roll: f32, pitch: f32, yaw: f32) -> Matrix3f {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();
    Matrix3f::new(
        cy * cp - sy * sr * sp,
        -sy * cr,
        cy * sp + sy * sr * cp,
        sy * cp + cy * sr * sp,
        cy * cr,
        sy * sp - cy * sr * cp,
        -cr * sp,
        sr,
        cr * cp,
    )
}

/// The yaw-extraction sequence that stays away from its singularity for the
/// given attitude: 3-2-1 unless the vehicle is closer to pitching vertical
/// than rolling vertical.
pub fn prefer_321_sequence(dcm: &Matrix3f) -> bool {
    dcm[(2, 0)].abs() < dcm[(2, 1)].abs()
}

/// Yaw angle using whichever Euler sequence is better conditioned.
pub fn yaw_from_dcm(dcm: &Matrix3f) -> f32 {
    if prefer_321_sequence(dcm) {
        euler_321(dcm).2
    } else {
        euler_312(dcm).2
    }
}

/// Matrix `L(q)` such that `q ⊗ p = L(q) p`.
pub fn quat_left_matrix(q: &Quatf) -> Matrix4<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, -z, y, //
        y, z, w, -x, //
        z, -y, x, w,
    )
}

/// Matrix `R(p)` such that `q ⊗ p = R(p) q`.
pub fn quat_right_matrix(p: &Quatf) -> Matrix4<f32> {
    let (w, x, y, z) = (p.w, p.i, p.j, p.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, z, -y, //
        y, -z, w, x, //
        z, y, -x, w,
    )
}

pub fn quat_to_vector4(q: &Quatf) -> nalgebra::Vector4<f32> {
    nalgebra::Vector4::new(q.w, q.i, q.j, q.k)
}

pub fn vector4_to_quat(v: &nalgebra::Vector4<f32>) -> Quatf {
    Quatf::new(v[0], v[1], v[2], v[3])
}

/// Jacobian of `R(q) u` with respect to the quaternion coefficients.
pub fn rotate_jacobian(q: &Quatf, u: &Vector3f) -> SMatrix<f32, 3, 4> {
    let qv = q.imag();
    let mut jac = SMatrix::<f32, 3, 4>::zeros();
    jac.set_column(0, &(2.0 * (q.w * u + qv.cross(u))));
    let d_qv = 2.0
        * (qv * u.transpose() - u * qv.transpose() + Matrix3f::identity() * qv.dot(u)
            - q.w * u.cross_matrix());
    jac.fixed_view_mut::<3, 3>(0, 1).copy_from(&d_qv);
    jac
}

/// Jacobian of the quaternion with respect to a small body-frame rotation
/// vector applied on the right: `q ⊗ dq(θ)`.
pub fn quat_rotation_jacobian(q: &Quatf) -> SMatrix<f32, 4, 3> {
    let left = quat_left_matrix(q);
    left.fixed_view::<4, 3>(0, 1) * 0.5
}

/// Inverse of [`quat_rotation_jacobian`] for a unit quaternion: maps a
/// quaternion perturbation to the equivalent body rotation vector.
pub fn rotation_vector_jacobian(q: &Quatf) -> SMatrix<f32, 3, 4> {
    quat_rotation_jacobian(q).transpose() * 4.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::UnitQuaternion;

    fn assert_dcm_eq(a: &Matrix3f, b: &Matrix3f, eps: f32) {
        for r in 0..3 {
            for c in 0..3 {
                assert_abs_diff_eq!(a[(r, c)], b[(r, c)], epsilon = eps);
            }
        }
    }

    #[test]
    fn dcm_matches_nalgebra_rotation() {
        let q = quat_from_euler(0.3, -0.2, 1.1);
        let unit = UnitQuaternion::from_quaternion(q);
        assert_dcm_eq(&quat_to_dcm(&q), unit.to_rotation_matrix().matrix(), 1e-5);
    }

    #[test]
    fn dcm_to_quat_round_trip() {
        let q = quat_from_euler(-0.4, 0.3, 2.9);
        let back = quat_from_dcm(&quat_to_dcm(&q));
        // Same rotation, possibly the opposite sign.
        assert_abs_diff_eq!(back.dot(&q).abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn euler_sequences_round_trip() {
        let dcm = dcm_from_euler_321(0.2, 0.4, -2.0);
        let (r, p, y) = euler_321(&dcm);
        assert_abs_diff_eq!(r, 0.2, epsilon = 1e-5);
        assert_abs_diff_eq!(p, 0.4, epsilon = 1e-5);
        assert_abs_diff_eq!(y, -2.0, epsilon = 1e-5);

        let dcm = dcm_from_euler_312(-0.3, 0.1, 2.5);
        let (r, p, y) = euler_312(&dcm);
        assert_abs_diff_eq!(r, -0.3, epsilon = 1e-5);
        assert_abs_diff_eq!(p, 0.1, epsilon = 1e-5);
        assert_abs_diff_eq!(y, 2.5, epsilon = 1e-5);
    }

    #[test]
    fn sequence_choice_avoids_pitch_singularity() {
        let near_vertical_pitch = dcm_from_euler_321(0.0, 1.5, 0.0);
        assert!(!prefer_321_sequence(&near_vertical_pitch));
        let level = dcm_from_euler_321(0.1, 0.0, 0.0);
        assert!(prefer_321_sequence(&level));
    }

    #[test]
    fn left_and_right_matrices_agree_with_product() {
        let q = quat_from_euler(0.1, 0.2, 0.3);
        let p = quat_from_euler(-0.4, 0.5, 0.6);
        let expected = quat_to_vector4(&(q * p));
        assert_abs_diff_eq!(quat_left_matrix(&q) * quat_to_vector4(&p), expected, epsilon = 1e-6);
        assert_abs_diff_eq!(quat_right_matrix(&p) * quat_to_vector4(&q), expected, epsilon = 1e-6);
    }

    #[test]
    fn rotate_jacobian_matches_finite_difference() {
        let q = quat_from_euler(0.3, -0.1, 0.7);
        let u = Vector3f::new(0.2, -1.0, 9.0);
        let jac = rotate_jacobian(&q, &u);
        let eps = 1e-3;
        for j in 0..4 {
            let mut plus = quat_to_vector4(&q);
            let mut minus = plus;
            plus[j] += eps;
            minus[j] -= eps;
            let f_plus = quat_to_dcm(&vector4_to_quat(&plus)) * u;
            let f_minus = quat_to_dcm(&vector4_to_quat(&minus)) * u;
            let column = (f_plus - f_minus) / (2.0 * eps);
            for i in 0..3 {
                assert_abs_diff_eq!(jac[(i, j)], column[i], epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn rotation_vector_round_trip() {
        let rot = Vector3f::new(0.1, -0.3, 0.25);
        let q = quat_from_rotation_vector(&rot);
        assert_abs_diff_eq!(quat_to_rotation_vector(&q), rot, epsilon = 1e-5);
    }

    #[test]
    fn rotation_vector_jacobian_inverts_quat_perturbation() {
        let q = quat_from_euler(0.3, 0.2, -1.0);
        let product = rotation_vector_jacobian(&q) * quat_rotation_jacobian(&q);
        assert_abs_diff_eq!(product, Matrix3f::identity(), epsilon = 1e-5);
    }
}
