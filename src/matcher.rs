//! Projection matcher: pairs good grid cells with panorama references.

use nalgebra::{Cholesky, Vector3};
use rayon::prelude::*;
use serde::Deserialize;

use crate::geometry::{MeanCovar, SE3};
use crate::sweep::{LidarScan, SweepGrid};

/// Depth panorama as seen by the core.
///
/// The panorama owns its projection model and storage; the core only needs a
/// reference lookup near a projected point and a way to ingest aligned
/// sweeps.
pub trait DepthPano {
    /// Look up a reference mean/covariance near the projection of the
    /// pano-frame point `pt_p`, searching a `(rows, cols)` pixel window.
    /// Returns `None` when nothing usable is stored there.
    fn match_cell(&self, pt_p: &Vector3<f32>, win: (usize, usize)) -> Option<MeanCovar>;

    /// Ingest one aligned scan slice with per-column sweep-to-pano poses.
    /// Returns the number of points added.
    fn add_sweep(&mut self, scan: &LidarScan, tfs: &[SE3]) -> usize;

    /// Number of sweeps ingested so far.
    fn num_sweeps(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MatcherParams {
    /// Half height of the panorama search window.
    pub half_rows: usize,
    /// Cells closer than this range (m) are not matched.
    pub min_dist: f32,
    /// Maximum relative range disagreement between prediction and reference.
    pub range_ratio: f32,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            half_rows: 2,
            min_dist: 2.0,
            range_ratio: 0.1,
        }
    }
}

/// Matches filtered grid cells against the depth panorama.
#[derive(Debug, Clone)]
pub struct ProjMatcher {
    pub params: MatcherParams,
    /// Panorama search window (rows, cols).
    pub win: (usize, usize),
    /// Minimum reference point count for a usable match.
    pub min_points: usize,
}

impl ProjMatcher {
    pub fn new(params: MatcherParams) -> Self {
        let side = 2 * params.half_rows + 1;
        Self {
            params,
            win: (side, side),
            min_points: side,
        }
    }

    /// Match every good cell in the grid's active column range; cells that
    /// fail any gate are reset for this sweep. Returns the match count.
    ///
    /// `gsize` chunks rows like the grid stages; 0 runs serially.
    pub fn match_grid<P>(&self, grid: &mut SweepGrid, pano: &P, gsize: usize) -> usize
    where
        P: DepthPano + Sync,
    {
        let ncols = grid.ncols;
        let col_rg = grid.col_rg.clone();
        let grain = if gsize == 0 { grid.nrows } else { gsize };
        let tfs = &grid.tfs;
        let params = self.params;
        let win = self.win;
        let min_points = self.min_points;

        grid.cells
            .par_chunks_mut(ncols)
            .with_min_len(grain)
            .map(|cell_row| {
                let mut n = 0usize;
                for cg in col_rg.clone() {
                    let cell = &mut cell_row[cg];
                    if !cell.mc_g.ok() {
                        continue;
                    }
                    if cell.mc_g.mean.norm() < params.min_dist {
                        cell.reset();
                        continue;
                    }

                    let tf_p_g = SE3::midpoint(&tfs[cg], &tfs[cg + 1]);
                    let pt_p = tf_p_g.transform(&cell.mc_g.mean.cast::<f64>());
                    let pt_p_f32 = pt_p.cast::<f32>();

                    let Some(mc_p) = pano.match_cell(&pt_p_f32, win) else {
                        cell.reset();
                        continue;
                    };
                    if mc_p.n < min_points {
                        cell.reset();
                        continue;
                    }

                    let range_pred = pt_p_f32.norm();
                    if range_pred <= 0.0
                        || (mc_p.mean.norm() - range_pred).abs() / range_pred > params.range_ratio
                    {
                        cell.reset();
                        continue;
                    }

                    let sigma = mc_p.covar() + cell.mc_g.covar();
                    let Some(u) = sigma
                        .try_inverse()
                        .and_then(|info| Cholesky::new(info))
                        .map(|chol| chol.l().transpose())
                    else {
                        cell.reset();
                        continue;
                    };

                    cell.mc_p = mc_p;
                    cell.u = u;
                    n += 1;
                }
                n
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::GridParams;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    /// Pano that echoes the query back with a fixed spread and point count.
    struct EchoPano {
        n: usize,
        offset: Vector3<f32>,
    }

    impl DepthPano for EchoPano {
        fn match_cell(&self, pt_p: &Vector3<f32>, _win: (usize, usize)) -> Option<MeanCovar> {
            let mut mc = MeanCovar::new();
            for i in 0..self.n {
                let jitter = Vector3::new(0.01, -0.01, 0.01) * (i as f32 - self.n as f32 / 2.0);
                mc.add(&(pt_p + self.offset + jitter));
            }
            Some(mc)
        }

        fn add_sweep(&mut self, _scan: &LidarScan, _tfs: &[SE3]) -> usize {
            0
        }

        fn num_sweeps(&self) -> usize {
            1
        }
    }

    fn grid_with_one_good_cell() -> SweepGrid {
        let params = GridParams {
            cell_rows: 1,
            cell_cols: 2,
            max_score: 0.1,
            nms: false,
        };
        let mut grid = SweepGrid::new(1, 8, &params).unwrap();

        // Fake a completed score/filter pass on the full sweep.
        grid.col_rg = 0..4;
        let cell = &mut grid.cells[1];
        cell.px_g = (1, 0);
        cell.mc_g.add(&Vector3::new(5.0, 0.0, 0.0));
        cell.mc_g.add(&Vector3::new(5.1, 0.1, 0.0));
        cell.mc_g.add(&Vector3::new(5.2, -0.1, 0.1));
        grid
    }

    #[test]
    fn test_match_accepts_consistent_reference() {
        let mut grid = grid_with_one_good_cell();
        let pano = EchoPano {
            n: 9,
            offset: Vector3::zeros(),
        };
        let matcher = ProjMatcher::new(MatcherParams::default());

        let n = matcher.match_grid(&mut grid, &pano, 0);
        assert_eq!(n, 1);

        let cell = grid.match_at((1, 0));
        assert!(cell.ok());

        // U is upper triangular with positive diagonal.
        for r in 0..3 {
            assert!(cell.u[(r, r)] > 0.0);
            for c in 0..r {
                assert_relative_eq!(cell.u[(r, c)], 0.0, epsilon = 1e-6);
            }
        }

        // UᵀU ≈ (Σ_p + Σ_g)⁻¹.
        let sigma = cell.mc_p.covar() + cell.mc_g.covar();
        let prod: Matrix3<f32> = cell.u.transpose() * cell.u * sigma;
        assert_relative_eq!(prod, Matrix3::identity(), epsilon = 1e-2);
    }

    #[test]
    fn test_match_rejects_sparse_reference() {
        let mut grid = grid_with_one_good_cell();
        let pano = EchoPano {
            n: 2,
            offset: Vector3::zeros(),
        };
        let matcher = ProjMatcher::new(MatcherParams::default());

        assert_eq!(matcher.match_grid(&mut grid, &pano, 0), 0);
        assert!(!grid.match_at((1, 0)).ok());
        assert!(!grid.match_at((1, 0)).grid_ok());
    }

    #[test]
    fn test_match_rejects_range_disagreement() {
        let mut grid = grid_with_one_good_cell();
        let pano = EchoPano {
            n: 9,
            offset: Vector3::new(2.0, 0.0, 0.0),
        };
        let matcher = ProjMatcher::new(MatcherParams::default());

        assert_eq!(matcher.match_grid(&mut grid, &pano, 0), 0);
        assert!(!grid.match_at((1, 0)).ok());
    }

    #[test]
    fn test_match_rejects_close_range() {
        let mut grid = grid_with_one_good_cell();
        let mc = &mut grid.cells[1].mc_g;
        mc.reset();
        mc.add(&Vector3::new(0.5, 0.0, 0.0));
        mc.add(&Vector3::new(0.6, 0.1, 0.0));
        let pano = EchoPano {
            n: 9,
            offset: Vector3::zeros(),
        };
        let matcher = ProjMatcher::new(MatcherParams::default());

        assert_eq!(matcher.match_grid(&mut grid, &pano, 0), 0);
    }
}
