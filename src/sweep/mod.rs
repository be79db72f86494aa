pub mod grid;
pub mod scan;

pub use grid::{Cell, GridParams, SweepGrid};
pub use scan::LidarScan;
