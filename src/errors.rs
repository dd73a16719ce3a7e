use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("INVALID_SCHEDULE: {0}")]
    InvalidSchedule(String),
    #[error("PERMISSION_UNAVAILABLE: {0}")]
    PermissionUnavailable(String),
    #[error("DELIVERY_FAILURE: {0}")]
    Delivery(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("STALE_POLL: {0}")]
    StalePoll(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
