//! Linear GICP cost: the translation correction ramps across the sweep.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

use super::{
    split_params, write_jacobian_block, CostParams, GicpCost, GicpCostBase, IcpCostFunction,
    MATCH_DIM,
};
use crate::error::OdomError;
use crate::geometry::skew;
use crate::imu::{ImuQueue, Trajectory};
use crate::sweep::SweepGrid;

/// GICP cost with a linearly time-varying correction: the full rotation
/// `exp(r₀)` everywhere, but only the fraction `s = (c + 0.5)/ncols` of the
/// translation at grid column `c`.
#[derive(Debug, Clone)]
pub struct GicpLinearCost {
    pub base: GicpCostBase,
}

impl GicpLinearCost {
    pub fn new(params: &CostParams) -> Self {
        Self {
            base: GicpCostBase::new(params),
        }
    }
}

impl IcpCostFunction for GicpLinearCost {
    fn num_residuals(&self) -> usize {
        self.base.num_residuals()
    }

    fn evaluate(&self, x: &[f64], residuals: &mut [f64], mut jacobian: Option<&mut [f64]>) -> bool {
        let (er, ep) = split_params(x);

        // +0.5 because the cell statistic sits at the cell center.
        let ncols = self.base.ncols as f64;
        self.base.eval_matches(
            &er,
            &ep,
            |c| (c as f64 + 0.5) / ncols,
            residuals,
            jacobian.as_deref_mut(),
        );

        let Some(ends) = &self.base.endpoints else {
            return true;
        };

        let pre = &self.base.preint;
        let dt = pre.duration;
        let dt2 = dt * dt;
        let g = ends.gravity;
        let st0 = &ends.st0;
        let st1 = &ends.st1;

        // Both endpoints rotate; the translation reaches only the back state.
        let p0 = er * st0.pos;
        let p1 = er * st1.pos + ep;
        let r0 = er * st0.rot;
        let r0_t = r0.inverse();
        let dp = st0.vel * dt - 0.5 * g * dt2;
        let alpha = r0_t * (p1 - p0 - dp);

        let ua = pre.sqrt_info.fixed_view::<3, 3>(0, 0).into_owned() * self.base.imu_weight;
        let wr_alpha = ua * (alpha - pre.alpha);

        let offset = MATCH_DIM * self.base.matches.len();
        residuals[offset..offset + 3].copy_from_slice(wr_alpha.as_slice());
        // No γ residual in this variant; keep its rows zeroed.
        residuals[offset + 3..offset + 6].fill(0.0);

        if let Some(jac) = jacobian {
            let r0_t_mat = r0_t.to_rotation_matrix().into_inner();
            write_jacobian_block(jac, offset, 0, &(ua * r0_t_mat * skew(&(ep - dp))));
            write_jacobian_block(jac, offset, 3, &(ua * r0_t_mat));
            write_jacobian_block(jac, offset + 3, 0, &Matrix3::zeros());
            write_jacobian_block(jac, offset + 3, 3, &Matrix3::zeros());
        }

        true
    }
}

impl GicpCost for GicpLinearCost {
    fn update_matches(&mut self, grid: &SweepGrid) {
        self.base.update_matches(grid);
    }

    fn update_preint(&mut self, traj: &Trajectory, imuq: &ImuQueue) -> Result<usize, OdomError> {
        self.base.update_preint(traj, imuq)
    }

    /// Every state is corrected with a linearly-ramped translation; interior
    /// velocities are finite-differenced from the corrected positions and
    /// the back state gets their mean.
    fn update_traj(&self, traj: &mut Trajectory) {
        let er = UnitQuaternion::from_scaled_axis(self.base.error.fixed_rows::<3>(0).into_owned());
        let ep = self.base.error.fixed_rows::<3>(3).into_owned();

        let n = traj.len();
        for i in 0..n {
            let s = i as f64 / (n - 1) as f64;
            let st = &mut traj.states[i];
            st.rot = er * st.rot;
            st.pos = er * st.pos + s * ep;
        }

        let mut vel_sum = Vector3::zeros();
        let mut vel_cnt = 0usize;
        for i in 2..n {
            let (pos_i, time_i) = (traj.states[i].pos, traj.states[i].time);
            let prev = &mut traj.states[i - 1];
            let dt = time_i - prev.time;
            if dt > 0.0 {
                prev.vel = (pos_i - prev.pos) / dt;
                vel_sum += prev.vel;
                vel_cnt += 1;
            }
        }
        if vel_cnt > 0 {
            traj.states[n - 1].vel = vel_sum / vel_cnt as f64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::test_util::{consistent_match, finite_difference_jacobian};
    use crate::cost::NUM_PARAMS;
    use crate::geometry::SE3;
    use crate::imu::ImuQueue;
    use approx::assert_relative_eq;

    fn cost_with_matches(matches: Vec<crate::cost::GicpMatch>, ncols: usize) -> GicpLinearCost {
        let mut cost = GicpLinearCost::new(&CostParams::default());
        cost.base.matches = matches;
        cost.base.ncols = ncols;
        cost
    }

    #[test]
    fn test_identity_residual_is_zero() {
        let tf = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.1, 0.2)),
            Vector3::new(0.3, 0.3, -0.7),
        );
        let cost = cost_with_matches(
            vec![
                consistent_match(0, Vector3::new(1.0, 0.0, 2.0), tf),
                consistent_match(7, Vector3::new(3.0, -1.0, 0.5), tf),
            ],
            8,
        );

        let x = [0.0; NUM_PARAMS];
        let mut r = vec![0.0; cost.num_residuals()];
        assert!(cost.evaluate(&x, &mut r, None));
        for v in &r {
            assert_relative_eq!(*v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_match_jacobian_matches_finite_difference() {
        let tf = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.2, 0.0, -0.1)),
            Vector3::new(0.0, 1.0, 0.5),
        );
        let mut m = consistent_match(5, Vector3::new(-1.0, 2.0, 2.5), tf);
        m.mean_p += Vector3::new(-0.03, 0.01, 0.02);
        let cost = cost_with_matches(vec![m], 8);

        let x = [0.0; NUM_PARAMS];
        let rows = MATCH_DIM * cost.base.matches.len();
        let mut jac = vec![0.0; cost.num_residuals() * NUM_PARAMS];
        let mut r = vec![0.0; cost.num_residuals()];
        assert!(cost.evaluate(&x, &mut r, Some(&mut jac)));

        let fd = finite_difference_jacobian(&cost, &x, rows);
        for i in 0..rows * NUM_PARAMS {
            assert_relative_eq!(jac[i], fd[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_column_weighting_ratio() {
        // Two matches with identical geometry at the first and last column:
        // their ∂r/∂p₀ blocks differ by (ncols − 0.5)/0.5.
        let ncols = 8;
        let tf = SE3::identity();
        let cost = cost_with_matches(
            vec![
                consistent_match(0, Vector3::new(1.0, 0.0, 0.0), tf),
                consistent_match(ncols - 1, Vector3::new(1.0, 0.0, 0.0), tf),
            ],
            ncols,
        );

        let x = [0.0; NUM_PARAMS];
        let mut jac = vec![0.0; cost.num_residuals() * NUM_PARAMS];
        let mut r = vec![0.0; cost.num_residuals()];
        assert!(cost.evaluate(&x, &mut r, Some(&mut jac)));

        // ∂r_x/∂p₀_x of match 0 (row 0, col 3) and match 1 (row 3, col 3).
        let j0 = jac[3];
        let j1 = jac[3 * NUM_PARAMS + 3];
        let expected = (ncols as f64 - 0.5) / 0.5;
        assert_relative_eq!(j1 / j0, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_update_traj_ramps_translation() {
        let mut cost = cost_with_matches(vec![], 8);
        let mut x = Vector6::zeros();
        x[3] = 1.0;
        cost.set_error(&x);

        let mut traj = Trajectory::new(5, ImuQueue::default());
        for (i, st) in traj.states.iter_mut().enumerate() {
            st.time = i as f64 * 0.025;
        }

        cost.update_traj(&mut traj);
        for (i, st) in traj.states.iter().enumerate() {
            let s = i as f64 / 4.0;
            assert_relative_eq!(st.pos, Vector3::new(s, 0.0, 0.0), epsilon = 1e-12);
        }

        // Interior velocities follow the position ramp; the back state takes
        // their mean.
        let v = 0.25 / 0.025;
        for st in &traj.states[1..] {
            assert_relative_eq!(st.vel, Vector3::new(v, 0.0, 0.0), epsilon = 1e-9);
        }
        assert_relative_eq!(traj.states[0].vel, Vector3::zeros(), epsilon = 1e-12);
    }
}
