//! SE3 rigid transforms backed by a unit quaternion.
//!
//! Group operations compose without allocation; small perturbations enter
//! through `UnitQuaternion::from_scaled_axis` on the rotation part.

use nalgebra::{UnitQuaternion, Vector3};

/// Rigid transform in SE(3): rotation followed by translation.
///
/// `T · p = R · p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Composition: `(self ∘ other) · p = self · (other · p)`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    #[inline]
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Constant-velocity interpolation at fraction `s ∈ [0, 1]`.
    ///
    /// The rotation follows the geodesic `R₀ · exp(s · log(R₀⁻¹ R₁))`; the
    /// translation is lerped.
    pub fn interpolate(t0: &SE3, t1: &SE3, s: f64) -> SE3 {
        let d_rot = (t0.rotation.inverse() * t1.rotation).scaled_axis();
        SE3 {
            rotation: t0.rotation * UnitQuaternion::from_scaled_axis(s * d_rot),
            translation: t0.translation + s * (t1.translation - t0.translation),
        }
    }

    /// Midpoint of two poses: SLERP at 0.5 for rotation, averaged translation.
    pub fn midpoint(t0: &SE3, t1: &SE3) -> SE3 {
        SE3 {
            rotation: t0.rotation.slerp(&t1.rotation, 0.5),
            translation: (t0.translation + t1.translation) * 0.5,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
