//! Generalized-ICP residual system.
//!
//! Two cost variants share the per-match Mahalanobis residual
//!
//! ```text
//! r_i = U_i · (mean_p − T(ξ, c) · T_p_g(c) · mean_g)
//! ```
//!
//! and differ in how the 6-vector perturbation `ξ = (r₀, p₀)` propagates
//! across the sweep: [`GicpRigidCost`] applies it uniformly,
//! [`GicpLinearCost`] ramps the translation by column fraction. When a
//! trajectory is attached, a preintegrated inertial residual is appended.

pub mod linear;
pub mod rigid;

pub use linear::GicpLinearCost;
pub use rigid::GicpRigidCost;

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};
use rayon::prelude::*;
use serde::Deserialize;

use crate::error::OdomError;
use crate::geometry::{skew, SE3};
use crate::imu::{ImuPreintegration, ImuQueue, NavState, Trajectory};
use crate::sweep::SweepGrid;

/// Dimension of the perturbation `ξ = (r₀, p₀)`.
pub const NUM_PARAMS: usize = 6;
/// Residual entries per match.
pub const MATCH_DIM: usize = 3;
/// Residual entries of the inertial tail.
pub const IMU_DIM: usize = 6;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CostParams {
    /// Match-evaluation grain; 0 evaluates all matches in one chunk.
    pub gsize: usize,
    /// Scale applied to the preintegration sqrt-info before whitening.
    pub imu_weight: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            gsize: 0,
            imu_weight: 1.0,
        }
    }
}

/// Snapshot of one good grid cell, lifted to solver precision.
#[derive(Debug, Clone)]
pub struct GicpMatch {
    /// Grid column of the cell.
    pub col: usize,
    pub mean_g: Vector3<f64>,
    pub mean_p: Vector3<f64>,
    /// Upper Cholesky factor of `(Σ_p + Σ_g)⁻¹`.
    pub u: Matrix3<f64>,
    /// Cell-center sweep-to-pano pose at match time.
    pub tf_p_g: SE3,
}

/// Endpoint states captured from the trajectory at preintegration time.
///
/// Copied by value so the cost holds no borrow of the trajectory while the
/// post-solve update mutates it.
#[derive(Debug, Clone, Copy)]
pub struct TrajEndpoints {
    pub st0: NavState,
    pub st1: NavState,
    pub gravity: Vector3<f64>,
}

/// Residual/Jacobian functor handed to the outer nonlinear solver.
///
/// `evaluate` fills `residuals` (length [`IcpCostFunction::num_residuals`])
/// and, when given, the row-major `num_residuals × 6` Jacobian. Both buffers
/// are pre-sized and pre-zeroed by the caller.
pub trait IcpCostFunction {
    fn num_residuals(&self) -> usize;

    fn num_parameters(&self) -> usize {
        NUM_PARAMS
    }

    fn evaluate(&self, x: &[f64], residuals: &mut [f64], jacobian: Option<&mut [f64]>) -> bool;
}

/// Surface shared by the sealed set of GICP variants.
pub trait GicpCost: IcpCostFunction {
    /// Collect all matched cells from the grid.
    fn update_matches(&mut self, grid: &SweepGrid);

    /// Preintegrate the queue between the trajectory endpoints and attach
    /// the endpoint snapshot. On [`OdomError::InsufficientImu`] the inertial
    /// residual stays detached and a match-only solve proceeds.
    fn update_preint(&mut self, traj: &Trajectory, imuq: &ImuQueue) -> Result<usize, OdomError>;

    /// Apply the accumulated correction to the trajectory (variant-specific).
    fn update_traj(&self, traj: &mut Trajectory);

    fn reset_error(&mut self);

    /// Store the solver's accumulated correction.
    fn set_error(&mut self, x: &Vector6<f64>);

    fn error(&self) -> &Vector6<f64>;
}

/// State common to both variants, held by composition.
#[derive(Debug, Clone)]
pub struct GicpCostBase {
    pub matches: Vec<GicpMatch>,
    /// Grid columns per sweep, for the linear variant's column fraction.
    pub ncols: usize,
    pub preint: ImuPreintegration,
    pub endpoints: Option<TrajEndpoints>,
    pub gsize: usize,
    pub imu_weight: f64,
    /// Accumulated correction `ξ` after a solve.
    pub error: Vector6<f64>,
}

impl GicpCostBase {
    pub fn new(params: &CostParams) -> Self {
        Self {
            matches: Vec::new(),
            ncols: 1,
            preint: ImuPreintegration::new(),
            endpoints: None,
            gsize: params.gsize,
            imu_weight: params.imu_weight,
            error: Vector6::zeros(),
        }
    }

    pub fn num_residuals(&self) -> usize {
        MATCH_DIM * self.matches.len() + if self.endpoints.is_some() { IMU_DIM } else { 0 }
    }

    pub fn update_matches(&mut self, grid: &SweepGrid) {
        self.ncols = grid.ncols;
        self.matches.clear();
        for r in 0..grid.nrows {
            for c in 0..grid.ncols {
                let cell = grid.match_at((c, r));
                if !cell.ok() {
                    continue;
                }
                self.matches.push(GicpMatch {
                    col: c,
                    mean_g: cell.mc_g.mean.cast::<f64>(),
                    mean_p: cell.mc_p.mean.cast::<f64>(),
                    u: cell.u.cast::<f64>(),
                    tf_p_g: grid.cell_tf_at(c),
                });
            }
        }
    }

    pub fn update_preint(
        &mut self,
        traj: &Trajectory,
        imuq: &ImuQueue,
    ) -> Result<usize, OdomError> {
        self.endpoints = None;
        self.preint.reset();
        let n = self
            .preint
            .compute(imuq, traj.front().time, traj.back().time)?;
        self.endpoints = Some(TrajEndpoints {
            st0: *traj.front(),
            st1: *traj.back(),
            gravity: traj.gravity,
        });
        Ok(n)
    }

    pub fn reset_error(&mut self) {
        self.error = Vector6::zeros();
    }

    /// Effective chunk length for the match loop.
    ///
    /// A residual is 3 doubles (24 bytes); a cache line fits three of them,
    /// so chunks of fewer than three matches thrash. `gsize == 0` evaluates
    /// everything in one chunk.
    fn chunk(&self) -> usize {
        if self.gsize == 0 {
            self.matches.len().max(1)
        } else {
            self.gsize + 2
        }
    }

    /// Evaluate all match residuals (and optionally their Jacobians) in
    /// parallel. Each task writes a disjoint, index-computable stripe of the
    /// output buffers. `tscale` gives the translation blend per grid column.
    pub fn eval_matches<F>(
        &self,
        er: &UnitQuaternion<f64>,
        ep: &Vector3<f64>,
        tscale: F,
        residuals: &mut [f64],
        jacobian: Option<&mut [f64]>,
    ) where
        F: Fn(usize) -> f64 + Sync,
    {
        let nm = self.matches.len();
        let chunk = self.chunk();
        let j_stride = MATCH_DIM * NUM_PARAMS;

        let fill = |ms: &[GicpMatch], r_chunk: &mut [f64], mut j_chunk: Option<&mut [f64]>| {
            for (k, m) in ms.iter().enumerate() {
                let pt_p_hat = m.tf_p_g.transform(&m.mean_g);
                let s = tscale(m.col);
                let res = m.u * (m.mean_p - (er * pt_p_hat + s * ep));
                r_chunk[MATCH_DIM * k..MATCH_DIM * (k + 1)].copy_from_slice(res.as_slice());

                if let Some(j) = j_chunk.as_deref_mut() {
                    let j_r = m.u * skew(&pt_p_hat);
                    let j_p = -s * m.u;
                    for row in 0..MATCH_DIM {
                        let base = k * j_stride + row * NUM_PARAMS;
                        for col in 0..3 {
                            j[base + col] = j_r[(row, col)];
                            j[base + 3 + col] = j_p[(row, col)];
                        }
                    }
                }
            }
        };

        match jacobian {
            Some(jac) => {
                self.matches
                    .par_chunks(chunk)
                    .zip(residuals[..MATCH_DIM * nm].par_chunks_mut(MATCH_DIM * chunk))
                    .zip(jac[..j_stride * nm].par_chunks_mut(j_stride * chunk))
                    .for_each(|((ms, rc), jc)| fill(ms, rc, Some(jc)));
            }
            None => {
                self.matches
                    .par_chunks(chunk)
                    .zip(residuals[..MATCH_DIM * nm].par_chunks_mut(MATCH_DIM * chunk))
                    .for_each(|(ms, rc)| fill(ms, rc, None));
            }
        }
    }
}

/// Write a 3×3 block into the row-major `num_residuals × 6` Jacobian.
pub(crate) fn write_jacobian_block(
    jac: &mut [f64],
    row: usize,
    col: usize,
    block: &Matrix3<f64>,
) {
    for i in 0..3 {
        for k in 0..3 {
            jac[(row + i) * NUM_PARAMS + col + k] = block[(i, k)];
        }
    }
}

/// Split the parameter slice into the rotation/translation perturbations.
#[inline]
pub(crate) fn split_params(x: &[f64]) -> (UnitQuaternion<f64>, Vector3<f64>) {
    let r0 = Vector3::new(x[0], x[1], x[2]);
    let p0 = Vector3::new(x[3], x[4], x[5]);
    (UnitQuaternion::from_scaled_axis(r0), p0)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A match whose reference is exactly the transformed cell mean, so the
    /// residual at ξ = 0 vanishes.
    pub fn consistent_match(col: usize, mean_g: Vector3<f64>, tf_p_g: SE3) -> GicpMatch {
        GicpMatch {
            col,
            mean_g,
            mean_p: tf_p_g.transform(&mean_g),
            u: Matrix3::identity(),
            tf_p_g,
        }
    }

    /// Central-difference Jacobian of the match rows at `x`.
    pub fn finite_difference_jacobian(
        cost: &dyn IcpCostFunction,
        x: &[f64],
        rows: usize,
    ) -> Vec<f64> {
        let h = 1e-7;
        let nr = cost.num_residuals();
        let mut jac = vec![0.0; rows * NUM_PARAMS];
        let mut r_plus = vec![0.0; nr];
        let mut r_minus = vec![0.0; nr];

        for p in 0..NUM_PARAMS {
            let mut xp = x.to_vec();
            let mut xm = x.to_vec();
            xp[p] += h;
            xm[p] -= h;

            r_plus.fill(0.0);
            r_minus.fill(0.0);
            assert!(cost.evaluate(&xp, &mut r_plus, None));
            assert!(cost.evaluate(&xm, &mut r_minus, None));

            for row in 0..rows {
                jac[row * NUM_PARAMS + p] = (r_plus[row] - r_minus[row]) / (2.0 * h);
            }
        }
        jac
    }
}
