//! Error types for the odometry pipeline.

use thiserror::Error;

/// Errors surfaced by the per-slice pipeline.
///
/// Local per-cell failures (a failed match, a NaN curvature) are absorbed
/// into the cell's validity flag and never reach this enum.
#[derive(Debug, Error)]
pub enum OdomError {
    /// A scan slice does not line up with the grid it is being added to.
    /// The slice is rejected and no state advances.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// No IMU sample is available in the requested time window.
    #[error("no usable IMU sample in [{t0}, {t1}]")]
    InsufficientImu { t0: f64, t1: f64 },

    /// The solver could not produce a usable pose correction.
    #[error("solve infeasible: {0}")]
    SolveInfeasible(String),
}
