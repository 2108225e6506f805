use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vendor rate limit hit: {0}")]
    RateLimited(String),

    #[error("Transient vendor failure: {0}")]
    Transient(String),

    #[error("Vendor rejected request (code {code}): {msg}")]
    Vendor { code: i64, msg: String },

    #[error("No data: {0}")]
    NoData(String),

    #[error("Incremental gap of {gap} trading days for {dataset}/{key} exceeds limit of {max}; raise MAX_GAP_DAYS or run a full rebuild")]
    GapTooLarge {
        dataset: String,
        key: String,
        gap: usize,
        max: usize,
    },

    #[error("No persisted rows for {dataset} key(s) {}; a full rebuild of those keys is required", .keys.join(", "))]
    BootstrapRequired { dataset: String, keys: Vec<String> },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure taxonomy used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    Transient,
    NoData,
    GapTooLarge,
    BootstrapRequired,
    SchemaMismatch,
    Fatal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::RateLimited(_) => ErrorKind::RateLimited,
            AppError::Transient(_) => ErrorKind::Transient,
            AppError::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                ErrorKind::Transient
            }
            AppError::Http(e) => match e.status() {
                Some(s) if s == reqwest::StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
                Some(s) if s.is_server_error() => ErrorKind::Transient,
                None if e.is_body() || e.is_decode() => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            AppError::NoData(_) => ErrorKind::NoData,
            AppError::GapTooLarge { .. } => ErrorKind::GapTooLarge,
            AppError::BootstrapRequired { .. } => ErrorKind::BootstrapRequired,
            AppError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            _ => ErrorKind::Fatal,
        }
    }

    /// Errors that abort a whole sync run rather than a single batch or date.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::GapTooLarge | ErrorKind::BootstrapRequired | ErrorKind::SchemaMismatch
        ) || matches!(self, AppError::Database(_) | AppError::Migration(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::UnknownDataset(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NoData(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_errors_are_fatal_to_the_run() {
        let gap = AppError::GapTooLarge {
            dataset: "breadth".to_string(),
            key: "000300.SH".to_string(),
            gap: 10,
            max: 7,
        };
        assert_eq!(gap.kind(), ErrorKind::GapTooLarge);
        assert!(gap.is_run_fatal());
        assert!(AppError::SchemaMismatch("x".to_string()).is_run_fatal());
    }

    #[test]
    fn unit_errors_are_not_fatal() {
        assert!(!AppError::RateLimited("quota".to_string()).is_run_fatal());
        assert!(!AppError::Transient("timeout".to_string()).is_run_fatal());
        assert!(!AppError::NoData("empty".to_string()).is_run_fatal());
        assert_eq!(AppError::NoData("empty".to_string()).kind(), ErrorKind::NoData);
    }
}
