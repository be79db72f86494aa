//! Gauss–Newton driver over the 6-parameter GICP cost.
//!
//! The cost only exposes a residual/Jacobian functor; this driver owns the
//! iteration loop, builds the normal equations `H·Δx = −g` with `H = JᵀJ`
//! and `g = Jᵀr`, and accumulates the correction into the cost's error
//! buffer. Any other nonlinear least-squares driver can be used in its
//! place through [`IcpCostFunction`].

use nalgebra::{Cholesky, Matrix6, Vector6};
use serde::Deserialize;

use crate::cost::GicpCost;
use crate::error::OdomError;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// The solve is bounded by iterations rather than wall clock.
    pub max_iterations: usize,
    /// Step-norm convergence threshold.
    pub xtol: f64,
    /// Diagonal regularization added to the normal equations.
    pub regularization: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            xtol: 1e-8,
            regularization: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolveSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Minimize the cost over `ξ` and store the accumulated correction in the
/// cost's error buffer.
pub fn solve<C>(cost: &mut C, opts: &SolverOptions) -> Result<SolveSummary, OdomError>
where
    C: GicpCost + ?Sized,
{
    let nr = cost.num_residuals();
    let np = cost.num_parameters();
    if nr == 0 {
        return Err(OdomError::SolveInfeasible("no residuals to minimize".into()));
    }

    let mut residuals = vec![0.0; nr];
    let mut jacobian = vec![0.0; nr * np];
    let mut x = Vector6::zeros();
    cost.reset_error();

    let mut summary = SolveSummary::default();
    for iter in 0..opts.max_iterations {
        residuals.fill(0.0);
        jacobian.fill(0.0);
        if !cost.evaluate(x.as_slice(), &mut residuals, Some(&mut jacobian)) {
            return Err(OdomError::SolveInfeasible("cost evaluation failed".into()));
        }

        let sq: f64 = residuals.iter().map(|r| r * r).sum();
        if iter == 0 {
            summary.initial_cost = 0.5 * sq;
        }
        summary.iterations = iter + 1;

        let mut h = Matrix6::zeros();
        let mut g = Vector6::zeros();
        for (row, &r_i) in residuals.iter().enumerate() {
            let j_row = &jacobian[row * np..(row + 1) * np];
            for a in 0..np {
                g[a] += j_row[a] * r_i;
                for b in a..np {
                    h[(a, b)] += j_row[a] * j_row[b];
                }
            }
        }
        for a in 0..np {
            for b in 0..a {
                h[(a, b)] = h[(b, a)];
            }
            h[(a, a)] += opts.regularization;
        }

        let Some(chol) = Cholesky::new(h) else {
            return Err(OdomError::SolveInfeasible(
                "normal equations not positive definite".into(),
            ));
        };
        let dx = chol.solve(&(-g));
        x += dx;

        if dx.norm() < opts.xtol {
            summary.converged = true;
            break;
        }
    }

    residuals.fill(0.0);
    if cost.evaluate(x.as_slice(), &mut residuals, None) {
        summary.final_cost = 0.5 * residuals.iter().map(|r| r * r).sum::<f64>();
    }
    cost.set_error(&x);
    Ok(summary)
}
