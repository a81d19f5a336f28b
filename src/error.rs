use thiserror::Error;

/// Errors raised while setting up or driving the light stage.
///
/// Transient tracking conditions (no markers, stale or unstable pose, bad geometry)
/// are not errors. They are reported as [`crate::illumination::Rejection`] values and
/// absorbed by the illumination loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inconsistent display calibration: {0}")]
    Calibration(String),

    #[error("device command `{command}` failed: {reason}")]
    Device { command: String, reason: String },

    #[error("tracking failed: {0}")]
    Tracking(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] serde_json::Error),
}
