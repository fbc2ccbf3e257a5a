//! SO(3) utilities on rotation matrices.
//!
//! Exponential map (rotation vector → matrix), logarithm map (matrix →
//! rotation vector) and the minimal rotation aligning one direction onto
//! another. Each numerically sensitive regime has its own explicit branch.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::types::{Matrix3x3d, Vector3d, Vector3dExt};

/// Below this |w|² the exponential uses a second-order expansion.
const EXP_SECOND_ORDER_THETA_SQ: f64 = 1e-8;
/// Below this |w|² the exponential uses a fourth-order expansion.
const EXP_FOURTH_ORDER_THETA_SQ: f64 = 1e-6;

/// Numeric regime used by [`exp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpBranch {
    SecondOrder,
    FourthOrder,
    Exact,
}

impl ExpBranch {
    pub fn select(theta_sq: f64) -> Self {
        if theta_sq < EXP_SECOND_ORDER_THETA_SQ {
            ExpBranch::SecondOrder
        } else if theta_sq < EXP_FOURTH_ORDER_THETA_SQ {
            ExpBranch::FourthOrder
        } else {
            ExpBranch::Exact
        }
    }
}

/// Numeric regime used by [`log`], chosen from cos(angle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBranch {
    /// angle < 45°
    SmallAngle,
    /// 45° ≤ angle ≤ 135°
    General,
    /// angle > 135°
    NearPi,
}

impl LogBranch {
    pub fn select(cos_angle: f64) -> Self {
        if cos_angle > FRAC_1_SQRT_2 {
            LogBranch::SmallAngle
        } else if cos_angle > -FRAC_1_SQRT_2 {
            LogBranch::General
        } else {
            LogBranch::NearPi
        }
    }
}

/// Rodrigues' formula: rotation vector `w` (axis × angle in radians) to a rotation matrix.
pub fn exp(w: &Vector3d) -> Matrix3x3d {
    let theta_sq = w.dot(w);

    // Series use the exact Taylor coefficients of sin(θ)/θ and (1 − cos θ)/θ²
    let (k_a, k_b) = match ExpBranch::select(theta_sq) {
        ExpBranch::SecondOrder => (1.0 - theta_sq / 6.0, 0.5),
        ExpBranch::FourthOrder => (
            1.0 - theta_sq / 6.0 * (1.0 - theta_sq / 20.0),
            0.5 - theta_sq / 24.0,
        ),
        ExpBranch::Exact => {
            let theta = theta_sq.sqrt();
            let inv_theta = 1.0 / theta;
            (
                theta.sin() * inv_theta,
                (1.0 - theta.cos()) * inv_theta * inv_theta,
            )
        }
    };

    rodrigues(w, k_a, k_b)
}

/// Inverse of [`exp`]: recover the rotation vector of `rotation`.
///
/// The skew-symmetric part gives `sin(angle) · axis`; the trace gives
/// `cos(angle)`. Near 180° the skew part vanishes and the axis is instead
/// read from the dominant column of the symmetric part, sign-corrected
/// against whatever skew signal remains.
pub fn log(rotation: &Matrix3x3d) -> Vector3d {
    let r = rotation;
    let cos_angle = (r.trace() - 1.0) * 0.5;

    let skew = Vector3d::new(
        (r[(2, 1)] - r[(1, 2)]) / 2.0,
        (r[(0, 2)] - r[(2, 0)]) / 2.0,
        (r[(1, 0)] - r[(0, 1)]) / 2.0,
    );
    let sin_angle_abs = skew.norm();

    match LogBranch::select(cos_angle) {
        LogBranch::SmallAngle => {
            if sin_angle_abs > 0.0 {
                skew * (sin_angle_abs.asin() / sin_angle_abs)
            } else {
                skew
            }
        }
        LogBranch::General => {
            let angle = cos_angle.acos();
            skew * (angle / sin_angle_abs)
        }
        LogBranch::NearPi => {
            let angle = PI - sin_angle_abs.asin();
            let d0 = r[(0, 0)] - cos_angle;
            let d1 = r[(1, 1)] - cos_angle;
            let d2 = r[(2, 2)] - cos_angle;

            let mut axis = if d0 * d0 > d1 * d1 && d0 * d0 > d2 * d2 {
                Vector3d::new(
                    d0,
                    (r[(1, 0)] + r[(0, 1)]) / 2.0,
                    (r[(0, 2)] + r[(2, 0)]) / 2.0,
                )
            } else if d1 * d1 > d2 * d2 {
                Vector3d::new(
                    (r[(1, 0)] + r[(0, 1)]) / 2.0,
                    d1,
                    (r[(2, 1)] + r[(1, 2)]) / 2.0,
                )
            } else {
                Vector3d::new(
                    (r[(0, 2)] + r[(2, 0)]) / 2.0,
                    (r[(2, 1)] + r[(1, 2)]) / 2.0,
                    d2,
                )
            };

            if axis.dot(&skew) < 0.0 {
                axis = -axis;
            }
            axis.normalize_or_keep();
            axis * angle
        }
    }
}

/// Minimal rotation taking direction `a` onto direction `b`.
///
/// Built by aligning two orthonormal frames that share the rotation axis,
/// so it stays well conditioned close to both 0° and 180°.
pub fn align(a: &Vector3d, b: &Vector3d) -> Matrix3x3d {
    let mut axis = a.cross(b);
    if axis.norm() == 0.0 {
        if a.dot(b) >= 0.0 {
            return Matrix3x3d::identity();
        }
        return rotation_pi_about_axis(&a.ortho());
    }

    let mut a_hat = *a;
    let mut b_hat = *b;
    axis.normalize_or_keep();
    a_hat.normalize_or_keep();
    b_hat.normalize_or_keep();

    let mut from_frame = Matrix3x3d::zeros();
    from_frame.set_column(0, &a_hat);
    from_frame.set_column(1, &axis);
    from_frame.set_column(2, &axis.cross(&a_hat));

    let mut to_frame = Matrix3x3d::zeros();
    to_frame.set_column(0, &b_hat);
    to_frame.set_column(1, &axis);
    to_frame.set_column(2, &axis.cross(&b_hat));

    to_frame * from_frame.transpose()
}

fn rotation_pi_about_axis(axis: &Vector3d) -> Matrix3x3d {
    let w = axis * (PI / axis.norm());
    // sin(π)/π = 0, (1 - cos(π))/π² = 2/π²
    let k_a = 0.0;
    let k_b = 2.0 / (PI * PI);
    rodrigues(&w, k_a, k_b)
}

fn rodrigues(w: &Vector3d, k_a: f64, k_b: f64) -> Matrix3x3d {
    let wx2 = w.x * w.x;
    let wy2 = w.y * w.y;
    let wz2 = w.z * w.z;

    let mut result = Matrix3x3d::zeros();
    result[(0, 0)] = 1.0 - k_b * (wy2 + wz2);
    result[(1, 1)] = 1.0 - k_b * (wx2 + wz2);
    result[(2, 2)] = 1.0 - k_b * (wx2 + wy2);

    let a = k_a * w.z;
    let b = k_b * (w.x * w.y);
    result[(0, 1)] = b - a;
    result[(1, 0)] = b + a;

    let a = k_a * w.y;
    let b = k_b * (w.x * w.z);
    result[(0, 2)] = b + a;
    result[(2, 0)] = b - a;

    let a = k_a * w.x;
    let b = k_b * (w.y * w.z);
    result[(1, 2)] = b - a;
    result[(2, 1)] = b + a;

    result
}
