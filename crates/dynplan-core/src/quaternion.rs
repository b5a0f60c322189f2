//! Quaternion helpers for the base-orientation parameterization.
//!
//! Quaternions are stored as `Vector4<f64>` in scalar-first order
//! `[w, x, y, z]`, matching the layout of [`RobotState::base_quaternion`].
//! Raw (not necessarily unit) quaternions are accepted everywhere a
//! normalization step is explicit in the name.
//!
//! [`RobotState::base_quaternion`]: crate::RobotState::base_quaternion

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Matrix4x3, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4};

/// Skew-symmetric matrix such that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Vector part `[x, y, z]` of a scalar-first quaternion.
pub fn imaginary(q: &Vector4<f64>) -> Vector3<f64> {
    Vector3::new(q[1], q[2], q[3])
}

/// Euclidean norm.
pub fn norm(q: &Vector4<f64>) -> f64 {
    q.norm()
}

/// `| |q| - 1 |`, the distance of `q` from the unit sphere.
pub fn norm_error(q: &Vector4<f64>) -> f64 {
    (q.norm() - 1.0).abs()
}

/// Normalized copy of `q`. A zero quaternion maps to the identity.
pub fn normalized(q: &Vector4<f64>) -> Vector4<f64> {
    let n = q.norm();
    if n > 0.0 {
        q / n
    } else {
        identity()
    }
}

/// Identity quaternion `[1, 0, 0, 0]`.
pub fn identity() -> Vector4<f64> {
    Vector4::new(1.0, 0.0, 0.0, 0.0)
}

/// Jacobian of `q / |q|` with respect to the raw `q`:
/// `(|q|^2 I - q q^T) / |q|^3`.
pub fn normalization_derivative(q: &Vector4<f64>) -> Matrix4<f64> {
    let squared = q.norm_squared();
    let cubed = squared * squared.sqrt();
    (Matrix4::identity() * squared - q * q.transpose()) / cubed
}

/// Map from body angular velocity to quaternion rate: `q_dot = G(q) * omega_body`,
/// with `G(q) = 0.5 * [-v^T; w I + skew(v)]`.
pub fn left_trivialized_derivative(q: &Vector4<f64>) -> Matrix4x3<f64> {
    let v = imaginary(q);
    let mut out = Matrix4x3::zeros();
    out.fixed_view_mut::<1, 3>(0, 0).copy_from(&(-v.transpose()));
    out.fixed_view_mut::<3, 3>(1, 0)
        .copy_from(&(Matrix3::identity() * q[0] + skew(&v)));
    out * 0.5
}

/// Left inverse of [`left_trivialized_derivative`] for unit quaternions:
/// `omega_body = 2 * [-v, w I - skew(v)] * q_dot`.
pub fn left_trivialized_derivative_inverse(q: &Vector4<f64>) -> Matrix3x4<f64> {
    let v = imaginary(q);
    let mut out = Matrix3x4::zeros();
    out.fixed_view_mut::<3, 1>(0, 0).copy_from(&(-v));
    out.fixed_view_mut::<3, 3>(0, 1)
        .copy_from(&(Matrix3::identity() * q[0] - skew(&v)));
    out * 2.0
}

/// Rotation matrix of a unit quaternion: `I + 2 w skew(v) + 2 skew(v)^2`.
///
/// The input is used as-is; normalize first if it may be off the unit sphere.
pub fn rotation_from_quaternion(q: &Vector4<f64>) -> Matrix3<f64> {
    let s = skew(&imaginary(q));
    Matrix3::identity() + s * (2.0 * q[0]) + s * s * 2.0
}

/// Scalar-first quaternion of a rotation matrix, with `w >= 0`.
pub fn quaternion_from_rotation(rotation: &Matrix3<f64>) -> Vector4<f64> {
    let unit = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
    from_unit_quaternion(&unit)
}

/// Convert a (possibly non-unit) scalar-first quaternion to nalgebra's type.
pub fn to_unit_quaternion(q: &Vector4<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]))
}

/// Scalar-first coordinates of a unit quaternion, with `w >= 0`.
pub fn from_unit_quaternion(unit: &UnitQuaternion<f64>) -> Vector4<f64> {
    let q = Vector4::new(unit.w, unit.i, unit.j, unit.k);
    if q[0] < 0.0 { -q } else { q }
}

/// Conjugate (inverse for unit quaternions).
pub fn inverse(q: &Vector4<f64>) -> Vector4<f64> {
    Vector4::new(q[0], -q[1], -q[2], -q[3])
}

/// Orientation error `desired^-1 * frame` as a scalar-first quaternion.
pub fn error_quaternion(frame: &Matrix3<f64>, desired: &Matrix3<f64>) -> Vector4<f64> {
    quaternion_from_rotation(&(desired.transpose() * frame))
}

/// Whether every component lies in `[-1, 1]` (with a small slack above).
pub fn bounds_respected(q: &Vector4<f64>) -> bool {
    const SLACK: f64 = 1e-6;
    q[0] >= -1.0 && q.iter().all(|c| *c >= -1.0 - SLACK && *c <= 1.0 + SLACK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_quaternion() -> Vector4<f64> {
        normalized(&Vector4::new(0.8, -0.2, 0.5, 0.3))
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 0.7, -1.1);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn rotation_matches_nalgebra() {
        let q = sample_quaternion();
        let expected = to_unit_quaternion(&q).to_rotation_matrix().into_inner();
        assert_relative_eq!(rotation_from_quaternion(&q), expected, epsilon = 1e-12);
    }

    #[test]
    fn quaternion_roundtrip_through_rotation() {
        let q = sample_quaternion();
        let recovered = quaternion_from_rotation(&rotation_from_quaternion(&q));
        assert_relative_eq!(recovered, q, epsilon = 1e-12);
    }

    #[test]
    fn trivialized_derivative_inverse_is_left_inverse() {
        let q = sample_quaternion();
        let product = left_trivialized_derivative_inverse(&q) * left_trivialized_derivative(&q);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn quaternion_rate_matches_body_angular_velocity() {
        // R(q + dt * G(q) w) ~= R(q) * exp(skew(w) dt)
        let q = sample_quaternion();
        let omega = Vector3::new(0.3, -0.4, 0.9);
        let dt = 1e-6;
        let q_next = q + left_trivialized_derivative(&q) * omega * dt;
        let r_dot = (rotation_from_quaternion(&q_next) - rotation_from_quaternion(&q)) / dt;
        let expected = rotation_from_quaternion(&q) * skew(&omega);
        assert_relative_eq!(r_dot, expected, epsilon = 1e-5);
    }

    #[test]
    fn normalization_derivative_matches_finite_differences() {
        let q = Vector4::new(1.1, -0.3, 0.2, 0.4);
        let analytic = normalization_derivative(&q);
        let eps = 1e-6;
        for i in 0..4 {
            let mut plus = q;
            let mut minus = q;
            plus[i] += eps;
            minus[i] -= eps;
            let column = (normalized(&plus) - normalized(&minus)) / (2.0 * eps);
            for r in 0..4 {
                assert_relative_eq!(analytic[(r, i)], column[r], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn zero_quaternion_normalizes_to_identity() {
        assert_eq!(normalized(&Vector4::zeros()), identity());
    }

    #[test]
    fn error_quaternion_of_equal_rotations_is_identity() {
        let r = rotation_from_quaternion(&sample_quaternion());
        assert_relative_eq!(error_quaternion(&r, &r), identity(), epsilon = 1e-12);
    }

    #[test]
    fn inverse_composes_to_identity() {
        let q = sample_quaternion();
        let r = rotation_from_quaternion(&q) * rotation_from_quaternion(&inverse(&q));
        assert_relative_eq!(r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn bounds_check() {
        assert!(bounds_respected(&sample_quaternion()));
        assert!(!bounds_respected(&Vector4::new(1.5, 0.0, 0.0, 0.0)));
        assert!(!bounds_respected(&Vector4::new(-1.5, 0.0, 0.0, 0.0)));
    }

    #[test]
    fn norm_error_of_unit_is_zero() {
        assert_relative_eq!(norm_error(&sample_quaternion()), 0.0, epsilon = 1e-12);
        assert_relative_eq!(norm_error(&Vector4::new(2.0, 0.0, 0.0, 0.0)), 1.0);
    }
}
