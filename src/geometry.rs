//! SO(3) helpers shared by preintegration, fusion and pose estimation.

use nalgebra::{Matrix3, Vector3};

const SMALL_ANGLE: f64 = 1e-6;

/// `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Right Jacobian of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
/// ```
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * s;
    }
    let t2 = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / t2) * s + ((theta - theta.sin()) / (t2 * theta)) * s * s
}

/// Inverse of [`right_jacobian`].
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * s + (1.0 / 12.0) * s * s;
    }
    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * s + coeff * s * s
}
