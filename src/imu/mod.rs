pub mod preintegration;
pub mod queue;
pub mod sample;
pub mod trajectory;

pub use preintegration::ImuPreintegration;
pub use queue::ImuQueue;
pub use sample::{ImuBias, ImuNoise, ImuNoiseParams, ImuSample};
pub use trajectory::{NavState, Trajectory};
