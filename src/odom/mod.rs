//! Per-slice odometry pipeline.
//!
//! A single driver thread sequences, for every incoming scan slice:
//! score → filter → predict → match → preintegrate → solve → update
//! trajectory → ingest sweep. Parallel sections live inside the individual
//! stages; nothing here blocks or runs in the background.

pub mod solver;

pub use solver::{solve, SolveSummary, SolverOptions};

use nalgebra::UnitQuaternion;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cost::{CostParams, GicpCost, GicpLinearCost, GicpRigidCost};
use crate::error::OdomError;
use crate::geometry::SE3;
use crate::imu::{ImuNoise, ImuNoiseParams, ImuQueue, ImuSample, Trajectory};
use crate::matcher::{DepthPano, MatcherParams, ProjMatcher};
use crate::sweep::{GridParams, LidarScan, SweepGrid};

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct OdomConfig {
    pub grid: GridParams,
    pub matcher: MatcherParams,
    pub imu_noise: ImuNoiseParams,
    pub cost: CostParams,
    pub solver: SolverOptions,
    /// Use the linearly time-varying cost variant instead of the rigid one.
    pub linear: bool,
    /// Row/cell grain for the grid and matcher stages; 0 runs them serially.
    pub gsize: usize,
}

/// Per-stage counts for one registered slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceSummary {
    pub n_scored: usize,
    pub n_filtered: usize,
    pub n_matches: usize,
    /// IMU integration steps behind the inertial residual; 0 when the solve
    /// was match-only.
    pub n_preint: usize,
    /// Absent while the panorama is still empty or the solve was infeasible.
    pub solve: Option<SolveSummary>,
}

const GRAVITY_NORM: f64 = 9.80665;

/// LIDAR-inertial odometry against an externally owned depth panorama.
pub struct LidarOdom<P> {
    pub grid: SweepGrid,
    pub traj: Trajectory,
    pub matcher: ProjMatcher,
    pub pano: P,
    pub config: OdomConfig,
    gravity_initialized: bool,
    /// Scratch per-column sweep poses, reused across slices.
    sweep_tfs: Vec<SE3>,
}

impl<P: DepthPano + Sync> LidarOdom<P> {
    pub fn new(
        sweep_rows: usize,
        sweep_cols: usize,
        t_imu_lidar: SE3,
        pano: P,
        config: OdomConfig,
    ) -> Result<Self, OdomError> {
        let grid = SweepGrid::new(sweep_rows, sweep_cols, &config.grid)?;
        let queue = ImuQueue::new(ImuNoise::new(&config.imu_noise));
        let mut traj = Trajectory::new(grid.ncols + 1, queue);
        traj.init_extrinsic(t_imu_lidar);

        let sweep_tfs = vec![SE3::identity(); grid.sweep_cols()];
        Ok(Self {
            grid,
            traj,
            matcher: ProjMatcher::new(config.matcher),
            pano,
            config,
            gravity_initialized: false,
            sweep_tfs,
        })
    }

    /// Feed one IMU sample. Gravity is initialized from the first accepted
    /// sample's acceleration direction.
    pub fn add_imu(&mut self, sample: ImuSample) -> bool {
        let added = self.traj.queue.add(sample);
        if added && !self.gravity_initialized && self.traj.init_gravity(GRAVITY_NORM).is_ok() {
            self.gravity_initialized = true;
            debug!(gravity = ?self.traj.gravity, "gravity initialized");
        }
        added
    }

    /// Run the full per-slice pipeline.
    ///
    /// An [`OdomError::InvariantViolation`] rejects the slice without
    /// advancing any state; an infeasible solve keeps the previous estimate
    /// and still ingests the slice with it.
    pub fn register(&mut self, scan: &LidarScan) -> Result<SliceSummary, OdomError> {
        let mut summary = SliceSummary::default();
        let gsize = self.config.gsize;

        let (n_scored, n_filtered) = self.grid.add(scan, gsize)?;
        summary.n_scored = n_scored;
        summary.n_filtered = n_filtered;

        let cell_dt = scan.dt * self.grid.cell_cols as f64;
        let n_imu = self.traj.predict(scan.time, cell_dt);
        debug!(n_scored, n_filtered, n_imu, "slice preprocessed");

        // Per-cell-boundary sweep-to-pano poses from the predicted states.
        for (i, tf) in self.grid.tfs.iter_mut().enumerate() {
            let st = &self.traj.states[i];
            *tf = SE3::new(st.rot, st.pos).compose(&self.traj.t_imu_lidar);
        }

        if self.pano.num_sweeps() > 0 {
            summary.n_matches = self.matcher.match_grid(&mut self.grid, &self.pano, gsize);
            debug!(n_matches = summary.n_matches, "matched against pano");

            if self.config.linear {
                let mut cost = GicpLinearCost::new(&self.config.cost);
                self.run_solve(&mut cost, &mut summary)?;
            } else {
                let mut cost = GicpRigidCost::new(&self.config.cost);
                self.run_solve(&mut cost, &mut summary)?;
            }
        }

        self.grid.interp_sweep_poses(&mut self.sweep_tfs, gsize)?;
        let n_added = self
            .pano
            .add_sweep(scan, &self.sweep_tfs[scan.col_rg.clone()]);
        debug!(n_added, "slice ingested");

        Ok(summary)
    }

    fn run_solve<C: GicpCost>(
        &mut self,
        cost: &mut C,
        summary: &mut SliceSummary,
    ) -> Result<(), OdomError> {
        cost.update_matches(&self.grid);

        match cost.update_preint(&self.traj, &self.traj.queue) {
            Ok(n) => summary.n_preint = n,
            Err(OdomError::InsufficientImu { .. }) => {
                debug!("no IMU in sweep window, match-only solve");
            }
            Err(e) => return Err(e),
        }

        match solver::solve(cost, &self.config.solver) {
            Ok(s) => {
                summary.solve = Some(s);
                cost.update_traj(&mut self.traj);
                correct_cell_poses(&mut self.grid.tfs, cost, self.config.linear);
            }
            Err(OdomError::SolveInfeasible(msg)) => {
                warn!(%msg, "solve infeasible, keeping previous estimate");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Apply the solved correction to the cell-boundary poses so the ingested
/// sweep is fully aligned. The rigid variant shifts every boundary the same
/// way; the linear variant ramps the translation by boundary fraction.
fn correct_cell_poses<C: GicpCost>(tfs: &mut [SE3], cost: &C, linear: bool) {
    let err = cost.error();
    let er = UnitQuaternion::from_scaled_axis(err.fixed_rows::<3>(0).into_owned());
    let ep = err.fixed_rows::<3>(3).into_owned();

    let ncols = tfs.len() - 1;
    for (i, tf) in tfs.iter_mut().enumerate() {
        let s = if linear { i as f64 / ncols as f64 } else { 1.0 };
        tf.rotation = er * tf.rotation;
        tf.translation = er * tf.translation + s * ep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MeanCovar;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    /// Pano that echoes every query back, shifted by a fixed offset, with a
    /// small full-rank spread around it.
    struct OffsetPano {
        offset: Vector3<f32>,
        sweeps: usize,
    }

    impl OffsetPano {
        fn new(offset: Vector3<f32>) -> Self {
            Self { offset, sweeps: 0 }
        }
    }

    impl DepthPano for OffsetPano {
        fn match_cell(&self, pt_p: &Vector3<f32>, _win: (usize, usize)) -> Option<MeanCovar> {
            let center = pt_p + self.offset;
            let mut mc = MeanCovar::new();
            mc.add(&center);
            for axis in 0..3 {
                for sign in [-1.0f32, 1.0] {
                    let mut d = Vector3::zeros();
                    d[axis] = 0.02 * sign;
                    mc.add(&(center + d));
                }
            }
            mc.add(&(center + Vector3::new(0.01, 0.01, -0.01)));
            mc.add(&(center - Vector3::new(0.01, 0.01, -0.01)));
            Some(mc)
        }

        fn add_sweep(&mut self, _scan: &LidarScan, tfs: &[SE3]) -> usize {
            self.sweeps += 1;
            tfs.len()
        }

        fn num_sweeps(&self) -> usize {
            self.sweeps
        }
    }

    /// Full-sweep slice of flat geometry at ~5 m with per-cell spread.
    fn flat_sweep(t0: f64, rows: usize, cols: usize) -> LidarScan {
        let mut xyzr = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let x = 3.0 + c as f32 * 0.05;
                let y = -2.0 + r as f32 * 0.3;
                let z = 5.0;
                xyzr.push([x, y, z, 5.0]);
            }
        }
        LidarScan::new(t0, 1e-4, xyzr, rows, 0..cols).unwrap()
    }

    fn test_config() -> OdomConfig {
        OdomConfig {
            grid: GridParams {
                cell_rows: 1,
                cell_cols: 16,
                max_score: 0.05,
                nms: false,
            },
            ..OdomConfig::default()
        }
    }

    #[test]
    fn test_first_sweep_only_ingests() {
        let pano = OffsetPano::new(Vector3::zeros());
        let mut odom = LidarOdom::new(2, 64, SE3::identity(), pano, test_config()).unwrap();

        let summary = odom.register(&flat_sweep(0.0, 2, 64)).unwrap();
        assert_eq!(summary.n_scored, 8);
        assert_eq!(summary.n_filtered, 8);
        assert_eq!(summary.n_matches, 0);
        assert!(summary.solve.is_none());
        assert_eq!(odom.pano.num_sweeps(), 1);
    }

    #[test]
    fn test_second_sweep_recovers_offset() {
        // The pano reports every surface 0.1 m further along x than
        // predicted; a match-only rigid solve must absorb that as p₀.
        let offset = Vector3::new(0.1, 0.0, 0.0);
        let pano = OffsetPano::new(offset);
        let mut odom = LidarOdom::new(2, 64, SE3::identity(), pano, test_config()).unwrap();

        odom.register(&flat_sweep(0.0, 2, 64)).unwrap();
        let summary = odom.register(&flat_sweep(6.4e-3, 2, 64)).unwrap();

        assert_eq!(summary.n_matches, 8);
        assert_eq!(summary.n_preint, 0);
        let solve = summary.solve.expect("solve should run");
        assert!(solve.final_cost < solve.initial_cost);

        assert_relative_eq!(
            odom.traj.front().pos,
            offset.cast::<f64>(),
            epsilon = 1e-3
        );
        // Cell poses were corrected before ingest.
        assert_relative_eq!(
            odom.grid.tfs[0].translation,
            offset.cast::<f64>(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_stationary_with_imu_attaches_inertial_residual() {
        // A stationary sensor: the accelerometer reads the gravity reaction,
        // the pano agrees with the prediction, and the solve settles at zero
        // correction with the inertial residual attached.
        let pano = OffsetPano::new(Vector3::zeros());
        let mut odom = LidarOdom::new(2, 64, SE3::identity(), pano, test_config()).unwrap();

        for i in 0..40 {
            odom.add_imu(ImuSample::new(
                i as f64 * 1e-3,
                Vector3::new(0.0, 0.0, 9.80665),
                Vector3::zeros(),
            ));
        }
        assert_relative_eq!(
            odom.traj.gravity,
            Vector3::new(0.0, 0.0, 9.80665),
            epsilon = 1e-9
        );

        odom.register(&flat_sweep(1e-3, 2, 64)).unwrap();
        let summary = odom.register(&flat_sweep(7.4e-3, 2, 64)).unwrap();

        assert!(summary.n_preint > 0);
        let solve = summary.solve.expect("solve should run");
        assert!(solve.final_cost < 1e-6, "cost {}", solve.final_cost);
        assert_relative_eq!(odom.traj.front().pos, Vector3::zeros(), epsilon = 1e-4);
    }

    #[test]
    fn test_misaligned_slice_rejected() {
        let pano = OffsetPano::new(Vector3::zeros());
        let mut odom = LidarOdom::new(2, 64, SE3::identity(), pano, test_config()).unwrap();
        odom.register(&flat_sweep(0.0, 2, 64)).unwrap();

        let mut bad = flat_sweep(6.4e-3, 2, 32);
        bad.col_rg = 16..48;
        let err = odom.register(&bad).unwrap_err();
        assert!(matches!(err, OdomError::InvariantViolation(_)));
        // The rejected slice did not ingest.
        assert_eq!(odom.pano.num_sweeps(), 1);
    }
}
