// Head Tracker Library
// Orientation EKF over SO(3) fed by gyroscope, accelerometer and magnetometer

pub mod error;
pub mod filters;
pub mod head_transform;
pub mod sensor_receiver;
pub mod smoothing;
pub mod so3;
pub mod tracker;
pub mod types;

pub use error::{HeadTrackerError, TrackerResult};
pub use filters::{EkfConfig, OrientationEkf, OrientationEkfState};
pub use head_transform::HeadTransform;
pub use sensor_receiver::{
    ReplaySource, SampleSink, SensorEvent, SensorSample, SensorSource, WorkerMessage,
};
pub use smoothing::GyroTimestepFilter;
pub use tracker::{HeadTracker, TrackerConfig};
