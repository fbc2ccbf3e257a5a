//! Linear algebra type system for the head tracker
//!
//! Fixed-size, stack-allocated aliases for every vector and matrix the
//! orientation filter touches, plus the handful of operations nalgebra does
//! not provide with the semantics the filter relies on.

use nalgebra::{Matrix3, Matrix4, Vector3};

// ===== Core Types =====
pub type Vector3d = Vector3<f64>;
pub type Matrix3x3d = Matrix3<f64>;
pub type Matrix4d = Matrix4<f64>;

/// Vector operations used by the SO(3) utilities.
pub trait Vector3dExt {
    /// Index of the component with the largest magnitude (ties favour z, then y).
    fn largest_abs_component(&self) -> usize;

    /// Unit vector orthogonal to `self`. Never zero-length for a nonzero input.
    fn ortho(&self) -> Vector3d;

    /// Normalize in place; a zero-length vector is left untouched.
    fn normalize_or_keep(&mut self);
}

impl Vector3dExt for Vector3d {
    fn largest_abs_component(&self) -> usize {
        let x_abs = self.x.abs();
        let y_abs = self.y.abs();
        let z_abs = self.z.abs();

        if x_abs > y_abs {
            if x_abs > z_abs {
                return 0;
            }
            return 2;
        }
        if y_abs > z_abs {
            return 1;
        }
        2
    }

    fn ortho(&self) -> Vector3d {
        // Seed with the axis preceding the dominant one; it can never be parallel to `self`
        let seed_axis = (self.largest_abs_component() + 2) % 3;
        let mut seed = Vector3d::zeros();
        seed[seed_axis] = 1.0;

        let mut result = self.cross(&seed);
        result.normalize_or_keep();
        result
    }

    fn normalize_or_keep(&mut self) {
        let _ = self.try_normalize_mut(0.0);
    }
}

/// Matrix operations used by the Kalman update.
pub trait Matrix3x3dExt: Sized {
    /// Zero matrix with `value` on the diagonal.
    fn same_diagonal(value: f64) -> Self;

    /// Analytic 3x3 inverse. `None` when the determinant is exactly zero.
    fn inverse_checked(&self) -> Option<Self>;
}

impl Matrix3x3dExt for Matrix3x3d {
    fn same_diagonal(value: f64) -> Self {
        Matrix3x3d::from_diagonal_element(value)
    }

    fn inverse_checked(&self) -> Option<Self> {
        let det = self.determinant();
        if det == 0.0 {
            return None;
        }
        let inv_det = 1.0 / det;
        let m = self;

        Some(Matrix3x3d::new(
            (m[(1, 1)] * m[(2, 2)] - m[(2, 1)] * m[(1, 2)]) * inv_det,
            -(m[(0, 1)] * m[(2, 2)] - m[(0, 2)] * m[(2, 1)]) * inv_det,
            (m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)]) * inv_det,
            -(m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)]) * inv_det,
            (m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)]) * inv_det,
            -(m[(0, 0)] * m[(1, 2)] - m[(1, 0)] * m[(0, 2)]) * inv_det,
            (m[(1, 0)] * m[(2, 1)] - m[(2, 0)] * m[(1, 1)]) * inv_det,
            -(m[(0, 0)] * m[(2, 1)] - m[(2, 0)] * m[(0, 1)]) * inv_det,
            (m[(0, 0)] * m[(1, 1)] - m[(1, 0)] * m[(0, 1)]) * inv_det,
        ))
    }
}

/// Flatten a 4x4 matrix row by row (element (r, c) lands at `4 * r + c`).
pub fn to_row_major(m: &Matrix4d) -> [f64; 16] {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[4 * r + c] = m[(r, c)];
        }
    }
    out
}
