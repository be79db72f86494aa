//! Coarse 2-D grid over the current sweep.
//!
//! Each cell covers `cell_rows × cell_cols` sweep pixels. Scoring computes a
//! column-curvature score per cell; filtering thresholds the scores (with
//! optional 1-D non-maximum suppression) and extracts per-cell mean/covariance
//! statistics for matching.

use std::ops::Range;

use nalgebra::{Matrix3, UnitQuaternion};
use rayon::prelude::*;
use serde::Deserialize;

use super::scan::LidarScan;
use crate::error::OdomError;
use crate::geometry::{MeanCovar, SE3};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GridParams {
    pub cell_rows: usize,
    pub cell_cols: usize,
    /// Curvature threshold; only cells scoring below it survive.
    pub max_score: f32,
    /// Keep only local minima along each score row.
    pub nms: bool,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            cell_rows: 2,
            cell_cols: 16,
            max_score: 0.05,
            nms: false,
        }
    }
}

/// One grid cell and its match state.
///
/// `mc_g` is the cell geometry in the sweep frame, `mc_p` the reference
/// statistic found in the panorama, `u` the upper Cholesky factor of
/// `(Σ_p + Σ_g)⁻¹`. Cells are re-populated every sweep; a failed cell is
/// reset rather than removed.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    /// Grid coordinate (col, row).
    pub px_g: (usize, usize),
    pub mc_g: MeanCovar,
    pub mc_p: MeanCovar,
    pub u: Matrix3<f32>,
}

impl Cell {
    /// Cell passed scoring/filtering and carries sweep-frame geometry.
    pub fn grid_ok(&self) -> bool {
        self.mc_g.ok()
    }

    /// Cell also matched against the panorama.
    pub fn ok(&self) -> bool {
        self.mc_g.ok() && self.mc_p.ok()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Score/filter grid over one sweep.
///
/// The score image and cell array are row-major `nrows × ncols`; `tfs` holds
/// `ncols + 1` cell-boundary poses (sweep-to-pano) so both ends of every cell
/// are covered. `col_rg` tracks the grid columns covered by the most recent
/// slice and wraps at the sweep boundary.
#[derive(Debug, Clone)]
pub struct SweepGrid {
    pub cell_rows: usize,
    pub cell_cols: usize,
    pub max_score: f32,
    pub nms: bool,
    pub nrows: usize,
    pub ncols: usize,
    /// Row-major curvature scores, NaN where unscored/invalid.
    pub score: Vec<f32>,
    pub cells: Vec<Cell>,
    /// Cell-boundary poses, `ncols + 1` entries.
    pub tfs: Vec<SE3>,
    /// Active grid-column range of the current slice.
    pub col_rg: Range<usize>,
}

impl SweepGrid {
    pub fn new(sweep_rows: usize, sweep_cols: usize, params: &GridParams) -> Result<Self, OdomError> {
        if params.cell_rows == 0 || params.cell_cols < 2 {
            return Err(OdomError::InvariantViolation(format!(
                "cell size {}x{} unusable",
                params.cell_rows, params.cell_cols
            )));
        }
        if sweep_rows % params.cell_rows != 0 || sweep_cols % params.cell_cols != 0 {
            return Err(OdomError::InvariantViolation(format!(
                "sweep {}x{} not divisible by cell {}x{}",
                sweep_rows, sweep_cols, params.cell_rows, params.cell_cols
            )));
        }

        let nrows = sweep_rows / params.cell_rows;
        let ncols = sweep_cols / params.cell_cols;
        Ok(Self {
            cell_rows: params.cell_rows,
            cell_cols: params.cell_cols,
            max_score: params.max_score,
            nms: params.nms,
            nrows,
            ncols,
            score: vec![f32::NAN; nrows * ncols],
            cells: vec![Cell::default(); nrows * ncols],
            tfs: vec![SE3::identity(); ncols + 1],
            col_rg: 0..0,
        })
    }

    pub fn total(&self) -> usize {
        self.nrows * self.ncols
    }

    /// Sweep width in pixels.
    pub fn sweep_cols(&self) -> usize {
        self.ncols * self.cell_cols
    }

    pub fn match_at(&self, px: (usize, usize)) -> &Cell {
        &self.cells[px.1 * self.ncols + px.0]
    }

    pub fn score_at(&self, px: (usize, usize)) -> f32 {
        self.score[px.1 * self.ncols + px.0]
    }

    /// Validate, score and filter one slice.
    ///
    /// Returns `(n_scored, n_filtered)`: the number of finite scores and the
    /// number of cells that survived filtering. A `gsize` of 0 runs each
    /// stage as a single serial chunk; otherwise rows are chunked by `gsize`.
    pub fn add(&mut self, scan: &LidarScan, gsize: usize) -> Result<(usize, usize), OdomError> {
        self.check(scan)?;
        let n_scored = self.score(scan, gsize);
        let n_filtered = self.filter(scan, gsize)?;
        Ok((n_scored, n_filtered))
    }

    /// Slice alignment: rows match, the span is whole cells, and the slice
    /// begins exactly where the previous one ended (wrapping at the sweep
    /// boundary).
    fn check(&self, scan: &LidarScan) -> Result<(), OdomError> {
        if scan.rows != self.nrows * self.cell_rows {
            return Err(OdomError::InvariantViolation(format!(
                "scan rows {} != sweep rows {}",
                scan.rows,
                self.nrows * self.cell_rows
            )));
        }
        if scan.cols() == 0 || scan.cols() % self.cell_cols != 0 {
            return Err(OdomError::InvariantViolation(format!(
                "scan span {} not a multiple of cell width {}",
                scan.cols(),
                self.cell_cols
            )));
        }
        if scan.col_rg.end > self.sweep_cols() {
            return Err(OdomError::InvariantViolation(format!(
                "scan columns {:?} exceed sweep width {}",
                scan.col_rg,
                self.sweep_cols()
            )));
        }
        let expected = (self.col_rg.end * self.cell_cols) % self.sweep_cols();
        if scan.col_rg.start != expected {
            return Err(OdomError::InvariantViolation(format!(
                "scan starts at column {}, expected {}",
                scan.col_rg.start, expected
            )));
        }
        Ok(())
    }

    /// Compute per-cell curvature scores; returns the count of finite scores.
    pub fn score(&mut self, scan: &LidarScan, gsize: usize) -> usize {
        self.col_rg = (scan.col_rg.start / self.cell_cols)..(scan.col_rg.end / self.cell_cols);

        let w = self.cell_cols;
        let h = self.cell_rows;
        let col_start = self.col_rg.start;
        let rg_len = self.col_rg.end - self.col_rg.start;
        let ncols = self.ncols;
        let grain = if gsize == 0 { self.nrows } else { gsize };

        self.score
            .par_chunks_mut(ncols)
            .with_min_len(grain)
            .enumerate()
            .map(|(r, row)| {
                let mut n = 0usize;
                for c in 0..rg_len {
                    // Only the first row of the cell is scored; range images
                    // from staggered sensors are most consistent there.
                    let curve = scan.curve_at(c * w, r * h, w);
                    row[col_start + c] = curve;
                    n += usize::from(!curve.is_nan());
                }
                n
            })
            .sum()
    }

    /// Threshold + optional NMS, then per-cell statistics; returns the number
    /// of good cells.
    pub fn filter(&mut self, scan: &LidarScan, gsize: usize) -> Result<usize, OdomError> {
        let new_rg = (scan.col_rg.start / self.cell_cols)..(scan.col_rg.end / self.cell_cols);
        if new_rg != self.col_rg {
            return Err(OdomError::InvariantViolation(format!(
                "filter range {:?} does not match scored range {:?}",
                new_rg, self.col_rg
            )));
        }

        let w = self.cell_cols;
        let h = self.cell_rows;
        let col_start = self.col_rg.start;
        let rg_len = self.col_rg.end - self.col_rg.start;
        let ncols = self.ncols;
        let max_score = self.max_score;
        let nms = self.nms;
        // The first and last column of the window have no complete
        // neighborhood when NMS is on.
        let pad = usize::from(nms);
        let grain = if gsize == 0 { self.nrows } else { gsize };

        let score = &self.score;
        let n = self
            .cells
            .par_chunks_mut(ncols)
            .with_min_len(grain)
            .enumerate()
            .map(|(r, cell_row)| {
                let score_row = &score[r * ncols..(r + 1) * ncols];
                let mut n = 0usize;
                for c in 0..rg_len {
                    let cg = col_start + c;
                    let cell = &mut cell_row[cg];
                    if c >= pad
                        && c + pad < rg_len
                        && cell_is_good(score_row, cg, max_score, nms)
                    {
                        let mc = scan.mean_covar_at(c * w, r * h, w, h);
                        if mc.ok() {
                            cell.mc_g = mc;
                            cell.mc_p.reset();
                            cell.u = Matrix3::zeros();
                            cell.px_g = (cg, r);
                            n += 1;
                            continue;
                        }
                    }
                    cell.reset();
                }
                n
            })
            .sum();
        Ok(n)
    }

    /// Pose at the center of cell column `c`: SLERP of the two boundary
    /// poses at 0.5, translations averaged.
    pub fn cell_tf_at(&self, c: usize) -> SE3 {
        SE3::midpoint(&self.tfs[c], &self.tfs[c + 1])
    }

    /// Interpolate per-column sweep poses from the cell-boundary poses.
    ///
    /// `sweep_tfs` must hold one pose per sweep column; within cell `i`,
    /// column `i·w + j` gets the pose at fraction `s = j/w` between
    /// `tfs[i]` and `tfs[i+1]`.
    pub fn interp_sweep_poses(
        &self,
        sweep_tfs: &mut [SE3],
        gsize: usize,
    ) -> Result<(), OdomError> {
        if sweep_tfs.len() != self.sweep_cols() {
            return Err(OdomError::InvariantViolation(format!(
                "pose buffer holds {} columns, sweep has {}",
                sweep_tfs.len(),
                self.sweep_cols()
            )));
        }

        let w = self.cell_cols;
        let grain = if gsize == 0 { self.ncols } else { gsize };
        let tfs = &self.tfs;

        sweep_tfs
            .par_chunks_mut(w)
            .with_min_len(grain)
            .enumerate()
            .for_each(|(i, chunk)| {
                let t0 = &tfs[i];
                let t1 = &tfs[i + 1];
                let d_rot = (t0.rotation.inverse() * t1.rotation).scaled_axis();
                let d_trans = t1.translation - t0.translation;

                for (j, tf) in chunk.iter_mut().enumerate() {
                    let s = j as f64 / w as f64;
                    tf.rotation = t0.rotation * UnitQuaternion::from_scaled_axis(s * d_rot);
                    tf.translation = t0.translation + s * d_trans;
                }
            });
        Ok(())
    }
}

/// Threshold check plus optional NMS against the left/right neighbors.
/// NaN scores fail the threshold; NaN neighbors count as +∞.
fn cell_is_good(score_row: &[f32], cg: usize, max_score: f32, nms: bool) -> bool {
    let m = score_row[cg];
    if !(m < max_score) {
        return false;
    }
    if nms {
        let l = score_row[cg - 1];
        let r = score_row[cg + 1];
        if m > l || m > r {
            return false;
        }
    }
    true
}
