//! SO(3) Lie group utilities.
//!
//! Provides the skew-symmetric (hat) operator used by the preintegration
//! state transition and by the GICP cost Jacobians.

use nalgebra::{Matrix3, RealField, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew<T: RealField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(), -v.z, v.y,
        v.z, T::zero(), -v.x,
        -v.y, v.x, T::zero(),
    )
}
