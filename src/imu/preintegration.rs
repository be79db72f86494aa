//! IMU preintegration between two trajectory endpoints.
//!
//! Accumulates high-rate IMU into a relative measurement (α, β, γ) that is
//! independent of the endpoint states it constrains, together with its
//! square-root information:
//!
//! ```text
//! dγ = exp(ω·dt)
//! dβ = γ·a·dt
//! dα = β·dt + 0.5·γ·a·dt²
//! ```
//!
//! The 15-dimensional error state is blocked `[α, β, θ, bₐ, b_ω]`; the state
//! transition F and covariance P live in that layout.

use nalgebra::{Cholesky, Matrix3, SMatrix, UnitQuaternion, Vector3};

use super::queue::ImuQueue;
use super::sample::{ImuNoise, ImuSample};
use crate::error::OdomError;
use crate::geometry::skew;

pub type Matrix15 = SMatrix<f64, 15, 15>;

/// Row/column offsets of the error-state blocks in `F`, `P` and `U`.
pub mod index {
    pub const ALPHA: usize = 0;
    pub const BETA: usize = 3;
    pub const THETA: usize = 6;
    pub const BA: usize = 9;
    pub const BW: usize = 12;
}

/// Preintegrated IMU measurement over one sweep window.
#[derive(Debug, Clone)]
pub struct ImuPreintegration {
    /// Position-like increment.
    pub alpha: Vector3<f64>,
    /// Velocity-like increment.
    pub beta: Vector3<f64>,
    /// Rotation increment.
    pub gamma: UnitQuaternion<f64>,
    /// Integrated time (s).
    pub duration: f64,
    /// Number of integration steps.
    pub n: usize,
    /// Error-state transition matrix F.
    pub jacobian: Matrix15,
    /// Error-state covariance P.
    pub cov: Matrix15,
    /// Upper-triangular U with UᵀU = P⁻¹, used to whiten the IMU residual.
    pub sqrt_info: Matrix15,
}

impl ImuPreintegration {
    pub fn new() -> Self {
        Self {
            alpha: Vector3::zeros(),
            beta: Vector3::zeros(),
            gamma: UnitQuaternion::identity(),
            duration: 0.0,
            n: 0,
            jacobian: Matrix15::identity(),
            cov: Matrix15::zeros(),
            sqrt_info: Matrix15::zeros(),
        }
    }

    /// Zero all accumulated state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Single integration step of length `dt` with measurement `imu`.
    ///
    /// The covariance update `P ← F·P·Fᵀ·dt²` with additive noise on the
    /// trailing twelve diagonal entries is kept exactly as-is; it differs
    /// from the textbook `F·P·Fᵀ + G·Q·Gᵀ` propagation.
    pub fn integrate(&mut self, dt: f64, imu: &ImuSample, noise: &ImuNoise) {
        use index::*;

        let dt2 = dt * dt;
        let a = imu.acc;
        let w = imu.gyr;
        let ga = self.gamma * a;

        let dgamma = UnitQuaternion::from_scaled_axis(w * dt);
        let dbeta = ga * dt;
        let dalpha = self.beta * dt + ga * dt2 * 0.5;

        // Error-state transition:
        // [0  I        0    0   0]
        // [0  0  -R·[a]×   -R   0]
        // [0  0    -[ω]×    0  -I]
        let rmat = self.gamma.to_rotation_matrix().into_inner();
        let ident = Matrix3::identity();
        self.jacobian
            .fixed_view_mut::<3, 3>(ALPHA, BETA)
            .copy_from(&ident);
        self.jacobian
            .fixed_view_mut::<3, 3>(BETA, THETA)
            .copy_from(&(-rmat * skew(&a)));
        self.jacobian
            .fixed_view_mut::<3, 3>(BETA, BA)
            .copy_from(&(-rmat));
        self.jacobian
            .fixed_view_mut::<3, 3>(THETA, THETA)
            .copy_from(&(-skew(&w)));
        self.jacobian
            .fixed_view_mut::<3, 3>(THETA, BW)
            .copy_from(&(-ident));

        self.cov = self.jacobian * self.cov * self.jacobian.transpose() * dt2;
        for k in 0..12 {
            self.cov[(BETA + k, BETA + k)] += noise.sigma2[k];
        }

        self.alpha += dalpha;
        self.beta += dbeta;
        self.gamma *= dgamma;
        self.duration += dt;
        self.n += 1;
    }

    /// Integrate the queue over `[t0, t1]` and finalize the square-root
    /// information.
    ///
    /// Steps from `t0` to each sample timestamp in turn, then finishes with a
    /// fractional step to `t1` using the last sample inside the window.
    /// Returns the number of integration steps.
    pub fn compute(&mut self, queue: &ImuQueue, t0: f64, t1: f64) -> Result<usize, OdomError> {
        // A window that never advanced in time has nothing to integrate.
        if t1 <= t0 {
            return Err(OdomError::InsufficientImu { t0, t1 });
        }

        let ibuf0 = queue
            .find_first_after(t0)
            .ok_or(OdomError::InsufficientImu { t0, t1 })?;

        let mut t = t0;
        let mut ibuf = ibuf0;
        loop {
            let imu = queue.debiased_at(ibuf);
            if imu.time >= t1 {
                break;
            }
            let dt = imu.time - t;
            if dt > 0.0 {
                self.integrate(dt, &imu, &queue.noise);
            }
            t = imu.time;

            if ibuf + 1 == queue.len() {
                break;
            }
            if queue.at(ibuf + 1).time >= t1 {
                break;
            }
            ibuf += 1;
        }

        // Fractional step to the window end with the last usable sample.
        let imu = queue.debiased_at(ibuf);
        let dt = t1 - t;
        if dt > 0.0 {
            self.integrate(dt, &imu, &queue.noise);
        }

        self.sqrt_info = sqrt_info_upper(&self.cov);
        Ok(self.n)
    }
}

impl Default for ImuPreintegration {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper-triangular U with UᵀU = (P + εI)⁻¹.
///
/// The small regularization keeps the information matrix invertible when a
/// block of P has not yet picked up noise coupling.
fn sqrt_info_upper(cov: &Matrix15) -> Matrix15 {
    let regularized = cov + Matrix15::identity() * 1e-10;
    let info = match regularized.try_inverse() {
        Some(info) => info,
        None => return Matrix15::zeros(),
    };
    match Cholesky::new(info) {
        Some(chol) => chol.l().transpose(),
        None => Matrix15::zeros(),
    }
}
