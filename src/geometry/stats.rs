//! Online mean/covariance of 3-D points.

use nalgebra::{Matrix3, Vector3};

/// Welford-style running mean and covariance of a 3-D point set.
///
/// Used for per-cell geometry in the sweep frame and for the reference
/// statistics queried from the depth panorama. Stored in `f32` to match the
/// sweep image precision; the cost functor casts to `f64` at solve time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanCovar {
    /// Number of points accumulated.
    pub n: usize,
    pub mean: Vector3<f32>,
    /// Sum of outer products of deviations; divide by (n-1) for covariance.
    m2: Matrix3<f32>,
}

impl MeanCovar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one point.
    pub fn add(&mut self, p: &Vector3<f32>) {
        self.n += 1;
        let d0 = p - self.mean;
        self.mean += d0 / self.n as f32;
        let d1 = p - self.mean;
        self.m2 += d0 * d1.transpose();
    }

    /// Sample covariance; zero until at least two points were added.
    pub fn covar(&self) -> Matrix3<f32> {
        if self.n < 2 {
            return Matrix3::zeros();
        }
        self.m2 / (self.n - 1) as f32
    }

    /// A cell statistic is usable once its covariance is defined and finite.
    pub fn ok(&self) -> bool {
        self.n >= 2 && self.mean.iter().all(|v| v.is_finite())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_of_constant_points() {
        let mut mc = MeanCovar::new();
        for _ in 0..5 {
            mc.add(&Vector3::new(1.0, 2.0, 3.0));
        }

        assert_eq!(mc.n, 5);
        assert_relative_eq!(mc.mean, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-6);
        assert_relative_eq!(mc.covar(), Matrix3::zeros(), epsilon = 1e-6);
    }

    #[test]
    fn test_covar_matches_batch_formula() {
        let pts = [
            Vector3::new(1.0f32, 0.0, 0.0),
            Vector3::new(2.0, 1.0, -1.0),
            Vector3::new(0.0, -1.0, 1.0),
            Vector3::new(3.0, 2.0, 0.5),
        ];

        let mut mc = MeanCovar::new();
        for p in &pts {
            mc.add(p);
        }

        let mean: Vector3<f32> = pts.iter().sum::<Vector3<f32>>() / pts.len() as f32;
        let mut cov = Matrix3::zeros();
        for p in &pts {
            let d = p - mean;
            cov += d * d.transpose();
        }
        cov /= (pts.len() - 1) as f32;

        assert_relative_eq!(mc.mean, mean, epsilon = 1e-5);
        assert_relative_eq!(mc.covar(), cov, epsilon = 1e-5);
    }

    #[test]
    fn test_not_ok_until_two_points() {
        let mut mc = MeanCovar::new();
        assert!(!mc.ok());
        mc.add(&Vector3::zeros());
        assert!(!mc.ok());
        mc.add(&Vector3::new(1.0, 0.0, 0.0));
        assert!(mc.ok());
    }
}
