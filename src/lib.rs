//! Real-time LIDAR-inertial odometry core.
//!
//! Estimates the 6-DoF pose of a spinning range sensor against an
//! incrementally built depth panorama, fused with inertial measurements.
//! Per scan slice the [`odom::LidarOdom`] driver scores and filters a
//! [`sweep::SweepGrid`], predicts a gyro-only [`imu::Trajectory`], matches
//! cells against a [`matcher::DepthPano`], preintegrates the IMU queue, and
//! minimizes a [`cost::GicpCost`] before ingesting the aligned sweep.

pub mod cost;
pub mod error;
pub mod geometry;
pub mod imu;
pub mod matcher;
pub mod odom;
pub mod sweep;
