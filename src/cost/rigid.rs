//! Rigid GICP cost: one correction applied uniformly across the sweep.

use nalgebra::Vector6;

use super::{
    split_params, write_jacobian_block, CostParams, GicpCost, GicpCostBase, IcpCostFunction,
    MATCH_DIM,
};
use crate::error::OdomError;
use crate::geometry::skew;
use crate::imu::preintegration::index::{ALPHA, THETA};
use crate::imu::{ImuQueue, Trajectory};
use crate::sweep::SweepGrid;

/// GICP cost with a single rigid correction `T = (exp(r₀), p₀)`.
#[derive(Debug, Clone)]
pub struct GicpRigidCost {
    pub base: GicpCostBase,
}

impl GicpRigidCost {
    pub fn new(params: &CostParams) -> Self {
        Self {
            base: GicpCostBase::new(params),
        }
    }
}

impl IcpCostFunction for GicpRigidCost {
    fn num_residuals(&self) -> usize {
        self.base.num_residuals()
    }

    fn evaluate(&self, x: &[f64], residuals: &mut [f64], mut jacobian: Option<&mut [f64]>) -> bool {
        let (er, ep) = split_params(x);

        self.base
            .eval_matches(&er, &ep, |_| 1.0, residuals, jacobian.as_deref_mut());

        let Some(ends) = &self.base.endpoints else {
            return true;
        };

        let pre = &self.base.preint;
        let dt = pre.duration;
        let dt2 = dt * dt;
        let g = ends.gravity;
        let st0 = &ends.st0;
        let st1 = &ends.st1;

        // Corrected endpoint and the relative measurement it implies.
        let p1 = er * st1.pos + ep;
        let r1 = er * st1.rot;
        let r0_t = st0.rot.inverse();
        let dp = st0.vel * dt - 0.5 * g * dt2;
        let alpha = r0_t * (p1 - st0.pos - dp);

        let r_gamma = (r0_t * r1 * pre.gamma.inverse()).scaled_axis();
        let r_alpha = alpha - pre.alpha;

        // Whiten with the block structure [U_α U_αθ; 0 U_θ].
        let uw = pre.sqrt_info * self.base.imu_weight;
        let ua = uw.fixed_view::<3, 3>(ALPHA, ALPHA).into_owned();
        let uag = uw.fixed_view::<3, 3>(ALPHA, THETA).into_owned();
        let ug = uw.fixed_view::<3, 3>(THETA, THETA).into_owned();

        let wr_gamma = ug * r_gamma;
        let wr_alpha = ua * r_alpha + uag * r_gamma;

        let offset = MATCH_DIM * self.base.matches.len();
        residuals[offset..offset + 3].copy_from_slice(wr_gamma.as_slice());
        residuals[offset + 3..offset + 6].copy_from_slice(wr_alpha.as_slice());

        if let Some(jac) = jacobian {
            let r0_t_mat = r0_t.to_rotation_matrix().into_inner();

            // γ rows, then α rows.
            write_jacobian_block(jac, offset, 0, &(ug * r0_t_mat));
            write_jacobian_block(jac, offset, 3, &nalgebra::Matrix3::zeros());
            write_jacobian_block(jac, offset + 3, 0, &(-ua * r0_t_mat * skew(&st1.pos)));
            write_jacobian_block(jac, offset + 3, 3, &(ua * r0_t_mat));
        }

        true
    }
}

impl GicpCost for GicpRigidCost {
    fn update_matches(&mut self, grid: &SweepGrid) {
        self.base.update_matches(grid);
    }

    fn update_preint(&mut self, traj: &Trajectory, imuq: &ImuQueue) -> Result<usize, OdomError> {
        self.base.update_preint(traj, imuq)
    }

    /// Only state 0 is corrected; the rest of the window is re-propagated by
    /// the next prediction.
    fn update_traj(&self, traj: &mut Trajectory) {
        let dt = traj.duration();
        let er = nalgebra::UnitQuaternion::from_scaled_axis(
            self.base.error.fixed_rows::<3>(0).into_owned(),
        );
        let ep = self.base.error.fixed_rows::<3>(3).into_owned();

        let st = &mut traj.states[0];
        st.rot = er * st.rot;
        st.pos = er * st.pos + ep;
        if dt > 0.0 {
            st.vel += ep / dt;
        }
    }

    fn reset_error(&mut self) {
        self.base.reset_error();
    }

    fn set_error(&mut self, x: &Vector6<f64>) {
        self.base.error = *x;
    }

    fn error(&self) -> &Vector6<f64> {
        &self.base.error
    }
}
