//! One incoming slice of a LIDAR sweep.

use std::ops::Range;

use nalgebra::Vector3;

use crate::error::OdomError;
use crate::geometry::MeanCovar;

/// A contiguous column slice of a spinning-LIDAR sweep.
///
/// `xyzr` is a row-major `rows × cols` image of `[x, y, z, range]` samples in
/// the sensor frame; invalid returns carry NaN. Columns are local to the
/// slice; `col_rg` places the slice within the full sweep.
#[derive(Debug, Clone)]
pub struct LidarScan {
    /// Timestamp of the first column (s).
    pub time: f64,
    /// Azimuth step, i.e. time per column (s).
    pub dt: f64,
    pub xyzr: Vec<[f32; 4]>,
    pub rows: usize,
    /// Active column range within the sweep.
    pub col_rg: Range<usize>,
}

impl LidarScan {
    pub fn new(
        time: f64,
        dt: f64,
        xyzr: Vec<[f32; 4]>,
        rows: usize,
        col_rg: Range<usize>,
    ) -> Result<Self, OdomError> {
        let cols = col_rg.end.saturating_sub(col_rg.start);
        if xyzr.len() != rows * cols {
            return Err(OdomError::InvariantViolation(format!(
                "xyzr buffer holds {} samples, expected {} ({} rows x {} cols)",
                xyzr.len(),
                rows * cols,
                rows,
                cols
            )));
        }
        Ok(Self {
            time,
            dt,
            xyzr,
            rows,
            col_rg,
        })
    }

    /// Number of columns in this slice.
    pub fn cols(&self) -> usize {
        self.col_rg.end - self.col_rg.start
    }

    /// Raw sample at slice-local `(row, col)`.
    #[inline]
    pub fn xyzr_at(&self, r: usize, c: usize) -> &[f32; 4] {
        &self.xyzr[r * self.cols() + c]
    }

    #[inline]
    pub fn range_at(&self, r: usize, c: usize) -> f32 {
        self.xyzr_at(r, c)[3]
    }

    #[inline]
    pub fn point_at(&self, r: usize, c: usize) -> Vector3<f32> {
        let p = self.xyzr_at(r, c);
        Vector3::new(p[0], p[1], p[2])
    }

    /// Column curvature over a window of `width` points starting at
    /// slice-local column `c0` in row `r`.
    ///
    /// The window range sum is compared against the flat-surface prediction
    /// `width · mid`, where `mid` is the mean of the two center ranges. Any
    /// invalid return in the window poisons the score to NaN.
    pub fn curve_at(&self, c0: usize, r: usize, width: usize) -> f32 {
        let half = width / 2;
        let left = self.range_at(r, c0 + half - 1);
        let right = self.range_at(r, c0 + half);
        let mid = 0.5 * (left + right);
        if !mid.is_finite() {
            return f32::NAN;
        }

        let mut sum = 0.0f32;
        for c in 0..width {
            let rg = self.range_at(r, c0 + c);
            if !rg.is_finite() {
                return f32::NAN;
            }
            sum += rg;
        }
        (sum / (mid * width as f32) - 1.0).abs()
    }

    /// Mean/covariance of the valid 3-D points in the `height × width` window
    /// with top-left slice-local corner `(r0, c0)`.
    pub fn mean_covar_at(&self, c0: usize, r0: usize, width: usize, height: usize) -> MeanCovar {
        let mut mc = MeanCovar::new();
        for r in r0..r0 + height {
            for c in c0..c0 + width {
                if self.range_at(r, c).is_finite() {
                    mc.add(&self.point_at(r, c));
                }
            }
        }
        mc
    }
}
