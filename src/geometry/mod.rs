//! Geometry utilities: SO(3) helpers, SE3 transforms, running statistics.

pub mod se3;
pub mod so3;
pub mod stats;

pub use se3::SE3;
pub use so3::skew;
pub use stats::MeanCovar;
