//! Consumer-side view of a head-view matrix.
//!
//! Column layout follows the renderer convention: column 0 is the right
//! vector, column 1 up, column 2 backward and column 3 the translation.

use nalgebra::{Rotation3, UnitQuaternion};

use crate::types::{to_row_major, Matrix3x3d, Matrix4d, Vector3d};

/// Below this cos(pitch) yaw and roll can no longer be separated
const GIMBAL_LOCK_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadTransform {
    head_view: Matrix4d,
}

impl HeadTransform {
    pub fn new(head_view: Matrix4d) -> Self {
        Self { head_view }
    }

    pub fn identity() -> Self {
        Self::new(Matrix4d::identity())
    }

    pub fn head_view(&self) -> &Matrix4d {
        &self.head_view
    }

    pub fn head_view_row_major(&self) -> [f64; 16] {
        to_row_major(&self.head_view)
    }

    pub fn translation(&self) -> Vector3d {
        self.column(3)
    }

    pub fn forward_vector(&self) -> Vector3d {
        -self.column(2)
    }

    pub fn up_vector(&self) -> Vector3d {
        self.column(1)
    }

    pub fn right_vector(&self) -> Vector3d {
        self.column(0)
    }

    /// `[x, y, z, w]` of the transposed rotation block.
    pub fn quaternion(&self) -> [f64; 4] {
        let block: Matrix3x3d = self.head_view.fixed_view::<3, 3>(0, 0).transpose();
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(block));
        [q.i, q.j, q.k, q.w]
    }

    /// Negated `(pitch, yaw, roll)` in radians.
    pub fn euler_angles(&self) -> Vector3d {
        let m = &self.head_view;
        let pitch = m[(2, 1)].clamp(-1.0, 1.0).asin();

        let cos_pitch = (1.0 - m[(2, 1)] * m[(2, 1)]).max(0.0).sqrt();
        let (yaw, roll) = if cos_pitch >= GIMBAL_LOCK_EPSILON {
            ((-m[(2, 0)]).atan2(m[(2, 2)]), (-m[(0, 1)]).atan2(m[(1, 1)]))
        } else {
            (0.0, m[(1, 0)].atan2(m[(0, 0)]))
        };

        Vector3d::new(-pitch, -yaw, -roll)
    }

    fn column(&self, index: usize) -> Vector3d {
        self.head_view.fixed_view::<3, 1>(0, index).into_owned()
    }
}

impl Default for HeadTransform {
    fn default() -> Self {
        Self::identity()
    }
}
