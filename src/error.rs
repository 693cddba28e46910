use crate::quota::WaitEstimate;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the gaze engine, the quota ledger and the stores.
///
/// `QuotaExceeded` and `CalibrationInvalid` are user-facing and callers key
/// their messaging off them, so they never collapse into the generic kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("gaze model failed to initialize: {0}")]
    ModelInitialization(String),

    #[error("calibration invalid: {0}")]
    CalibrationInvalid(String),

    #[error("{message}")]
    QuotaExceeded {
        message: String,
        wait: Option<WaitEstimate>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("operation not allowed while {0}")]
    InvalidState(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("gaze model error: {0}")]
    Model(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}
