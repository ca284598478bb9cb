use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("unique name already in use: {0}")]
    NameConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("engine shut down before the command completed")]
    ShutDown,
    #[error("session is not active")]
    Inactive,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("server error {code}: {message}")]
    Generic { code: i64, message: String },
}

pub type CommandResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn network(err: &anyhow::Error) -> Self {
        Self::NetworkFailure(format!("{err:#}"))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::NameConflict => Self::NameConflict(value.message),
            ErrorCode::NotFound => Self::NotFound(value.message),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => Self::PermissionDenied(value.message),
            ErrorCode::Unavailable => Self::NetworkFailure(value.message),
            code => Self::Generic {
                code: value.status.unwrap_or_else(|| default_status(code)),
                message: value.message,
            },
        }
    }
}

fn default_status(code: ErrorCode) -> i64 {
    match code {
        ErrorCode::Unauthorized => 401,
        ErrorCode::Forbidden => 403,
        ErrorCode::NotFound => 404,
        ErrorCode::NameConflict | ErrorCode::Conflict => 409,
        ErrorCode::Validation => 400,
        ErrorCode::RateLimited => 429,
        ErrorCode::Unavailable => 503,
        ErrorCode::Internal => 500,
    }
}
