use thiserror::Error;

/// Head tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeadTrackerError {
    #[error("Invalid sensor sample: {0}")]
    InvalidSample(String),

    #[error("Sensor source failed: {0}")]
    SensorFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, HeadTrackerError>;

impl HeadTrackerError {
    /// Samples are dropped on these; everything else aborts the caller's operation.
    pub fn is_rejected_sample(&self) -> bool {
        matches!(self, HeadTrackerError::InvalidSample(_))
    }
}
