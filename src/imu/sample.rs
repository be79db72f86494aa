use nalgebra::Vector3;
use serde::Deserialize;

/// Single IMU measurement in the sensor frame.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub time: f64,
    /// Linear acceleration (m/s²).
    pub acc: Vector3<f64>,
    /// Angular rate (rad/s).
    pub gyr: Vector3<f64>,
}

impl ImuSample {
    pub fn new(time: f64, acc: Vector3<f64>, gyr: Vector3<f64>) -> Self {
        Self { time, acc, gyr }
    }

    /// Measurement with the current bias estimate removed.
    pub fn debiased(&self, bias: &ImuBias) -> ImuSample {
        ImuSample {
            time: self.time,
            acc: self.acc - bias.acc,
            gyr: self.gyr - bias.gyr,
        }
    }
}

/// Accelerometer and gyroscope biases.
///
/// Updated externally; treated as constant within one preintegration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuBias {
    pub acc: Vector3<f64>,
    pub gyr: Vector3<f64>,
}

/// IMU noise densities (1-sigma), as found on a sensor datasheet.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ImuNoiseParams {
    /// Accelerometer white noise (m/s²/√Hz).
    pub acc_noise: f64,
    /// Gyroscope white noise (rad/s/√Hz).
    pub gyr_noise: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub acc_bias_noise: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub gyr_bias_noise: f64,
    /// Nominal sample interval used to discretize the densities (s).
    pub nominal_dt: f64,
}

impl Default for ImuNoiseParams {
    fn default() -> Self {
        Self {
            acc_noise: 2.0e-3,
            gyr_noise: 1.7e-4,
            acc_bias_noise: 3.0e-3,
            gyr_bias_noise: 1.9e-5,
            nominal_dt: 0.005,
        }
    }
}

/// Discrete-time noise variances for the preintegration propagation.
///
/// Follows the kalibr IMU noise model: white noise variances scale by `1/dt`,
/// random walk variances by `dt`. The 12-vector is blocked as
/// `[acc, gyr, acc_bias, gyr_bias]` and is added to the trailing diagonal of
/// the preintegration covariance at every step.
#[derive(Debug, Clone, Copy)]
pub struct ImuNoise {
    pub sigma2: nalgebra::SVector<f64, 12>,
}

/// Offsets of the noise blocks within [`ImuNoise::sigma2`].
pub mod noise_index {
    pub const NA: usize = 0;
    pub const NW: usize = 3;
    pub const BA: usize = 6;
    pub const BW: usize = 9;
}

impl ImuNoise {
    pub fn new(params: &ImuNoiseParams) -> Self {
        use noise_index::*;

        let dt = params.nominal_dt;
        let mut sigma2 = nalgebra::SVector::<f64, 12>::zeros();
        sigma2
            .fixed_rows_mut::<3>(NA)
            .fill(params.acc_noise.powi(2) / dt);
        sigma2
            .fixed_rows_mut::<3>(NW)
            .fill(params.gyr_noise.powi(2) / dt);
        sigma2
            .fixed_rows_mut::<3>(BA)
            .fill(params.acc_bias_noise.powi(2) * dt);
        sigma2
            .fixed_rows_mut::<3>(BW)
            .fill(params.gyr_bias_noise.powi(2) * dt);

        Self { sigma2 }
    }
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self::new(&ImuNoiseParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debiased_subtracts_bias() {
        let sample = ImuSample::new(1.0, Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.1, 0.2, 0.3));
        let bias = ImuBias {
            acc: Vector3::new(0.5, 0.5, 0.5),
            gyr: Vector3::new(0.1, 0.1, 0.1),
        };

        let out = sample.debiased(&bias);
        assert_eq!(out.acc, Vector3::new(0.5, 1.5, 2.5));
        assert_eq!(out.gyr, Vector3::new(0.0, 0.1, 0.2));
        assert_eq!(out.time, 1.0);
    }

    #[test]
    fn test_noise_discretization() {
        let params = ImuNoiseParams {
            acc_noise: 0.1,
            gyr_noise: 0.2,
            acc_bias_noise: 0.3,
            gyr_bias_noise: 0.4,
            nominal_dt: 0.01,
        };
        let noise = ImuNoise::new(&params);

        use noise_index::*;
        assert!((noise.sigma2[NA] - 0.01 / 0.01).abs() < 1e-12);
        assert!((noise.sigma2[NW] - 0.04 / 0.01).abs() < 1e-12);
        assert!((noise.sigma2[BA] - 0.09 * 0.01).abs() < 1e-12);
        assert!((noise.sigma2[BW] - 0.16 * 0.01).abs() < 1e-12);
    }
}
