//! Short sliding-window navigation trajectory across one sweep.

use nalgebra::{UnitQuaternion, Vector3};

use super::queue::ImuQueue;
use super::sample::ImuSample;
use crate::error::OdomError;
use crate::geometry::SE3;

/// Navigation state at one trajectory cell, expressed in the gravity-aligned
/// panorama frame.
#[derive(Debug, Clone, Copy)]
pub struct NavState {
    pub time: f64,
    pub rot: UnitQuaternion<f64>,
    pub pos: Vector3<f64>,
    pub vel: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        Self {
            time: 0.0,
            rot: UnitQuaternion::identity(),
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
        }
    }
}

/// Rotation integration `R₁ = R₀ · exp(ω·dt)`.
#[inline]
pub fn integrate_rot(r0: &UnitQuaternion<f64>, omg: &Vector3<f64>, dt: f64) -> UnitQuaternion<f64> {
    r0 * UnitQuaternion::from_scaled_axis(omg * dt)
}

/// Euler step of the full nav state under gravity `g_w`.
pub fn integrate_euler(s0: &NavState, imu: &ImuSample, g_w: &Vector3<f64>, dt: f64) -> NavState {
    let mut s1 = *s0;
    s1.time = s0.time + dt;
    s1.rot = integrate_rot(&s0.rot, &imu.gyr, dt);

    let a = s0.rot * imu.acc + g_w;
    s1.vel = s0.vel + a * dt;
    s1.pos = s0.pos + s0.vel * dt + 0.5 * a * dt * dt;
    s1
}

/// Midpoint step between two consecutive IMU samples.
pub fn integrate_midpoint(
    s0: &NavState,
    imu0: &ImuSample,
    imu1: &ImuSample,
    g_w: &Vector3<f64>,
) -> NavState {
    let dt = imu1.time - imu0.time;
    let mut s1 = *s0;
    s1.time = s0.time + dt;

    let omg = (imu0.gyr + imu1.gyr) * 0.5;
    s1.rot = integrate_rot(&s0.rot, &omg, dt);

    let a0 = s0.rot * imu0.acc;
    let a1 = s1.rot * imu1.acc;
    let a = (a0 + a1) * 0.5 + g_w;
    s1.vel = s0.vel + a * dt;
    s1.pos = s0.pos + s0.vel * dt + 0.5 * a * dt * dt;
    s1
}

/// Sliding-window trajectory whose endpoints the preintegration constrains.
///
/// Holds one state per grid cell boundary; the front state is the sweep
/// start and the back state the sweep end.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub states: Vec<NavState>,
    /// Gravity in the panorama frame.
    pub gravity: Vector3<f64>,
    /// Extrinsic transform taking points from the LIDAR frame to the IMU frame.
    pub t_imu_lidar: SE3,
    /// Rotation from the initial body frame to the panorama frame.
    pub t_init_pano: SE3,
    pub queue: ImuQueue,
}

impl Trajectory {
    /// Create a trajectory of `size >= 2` states.
    pub fn new(size: usize, queue: ImuQueue) -> Self {
        assert!(size >= 2, "trajectory needs at least two states");
        Self {
            states: vec![NavState::default(); size],
            gravity: Vector3::zeros(),
            t_imu_lidar: SE3::identity(),
            t_init_pano: SE3::identity(),
            queue,
        }
    }

    /// Set the gravity direction from the first IMU sample's acceleration,
    /// scaled to `gravity_norm`, and derive the panorama frame as the
    /// rotation that aligns +Z with measured gravity.
    pub fn init_gravity(&mut self, gravity_norm: f64) -> Result<(), OdomError> {
        let first = self.queue.buf.front().ok_or_else(|| {
            OdomError::InvariantViolation("gravity init without IMU samples".into())
        })?;

        self.gravity = first.acc.normalize() * gravity_norm;
        let rot = UnitQuaternion::rotation_between(&Vector3::z(), &self.gravity)
            .unwrap_or_else(|| UnitQuaternion::from_scaled_axis(Vector3::x() * std::f64::consts::PI));
        self.t_init_pano = SE3::new(rot, Vector3::zeros());
        Ok(())
    }

    /// Store the IMU↔LIDAR extrinsic and seed every state with its inverse so
    /// that the first sweep frame coincides with the panorama frame.
    pub fn init_extrinsic(&mut self, t_imu_lidar: SE3) {
        self.t_imu_lidar = t_imu_lidar;
        let t_lidar_imu = t_imu_lidar.inverse();
        for s in &mut self.states {
            s.rot = t_lidar_imu.rotation;
            s.pos = t_lidar_imu.translation;
        }
    }

    /// Predict per-cell poses by integrating gyro only, starting at `t0` with
    /// cell period `dt`.
    ///
    /// Positions are held at the front state's position across the window;
    /// translation is recovered by the post-solve trajectory update. Returns
    /// the number of IMU samples consumed, or 0 when no sample newer than
    /// `t0` exists (the trajectory is left untouched).
    pub fn predict(&mut self, t0: f64, dt: f64) -> usize {
        let Some(ibuf0) = self.queue.find_first_after(t0) else {
            return 0;
        };

        let mut ibuf = ibuf0;
        self.states[0].time = t0;
        let pos0 = self.states[0].pos;

        for i in 1..self.states.len() {
            let ti = t0 + dt * i as f64;
            if self.queue.at(ibuf).time < ti {
                ibuf += 1;
            }
            if ibuf >= self.queue.len() {
                ibuf = self.queue.len() - 1;
            }

            let imu = self.queue.debiased_at(ibuf);
            let prev = self.states[i - 1];
            let curr = &mut self.states[i];
            curr.time = prev.time + dt;
            curr.pos = pos0;
            curr.rot = integrate_rot(&prev.rot, &imu.gyr, dt);
        }

        ibuf - ibuf0 + 1
    }

    pub fn front(&self) -> &NavState {
        &self.states[0]
    }

    pub fn back(&self) -> &NavState {
        &self.states[self.states.len() - 1]
    }

    pub fn at(&self, i: usize) -> &NavState {
        &self.states[i]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Time span covered by the window.
    pub fn duration(&self) -> f64 {
        self.back().time - self.front().time
    }
}
