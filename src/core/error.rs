use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown resolution: {0}")]
    InvalidResolution(String),

    #[error("Unknown metric type: {0}")]
    InvalidMetricKind(String),

    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Worker '{0}' is already running")]
    AlreadyRunning(&'static str),
}

/// Result type alias for metrics engine operations
pub type Result<T> = std::result::Result<T, MetricsError>;

impl MetricsError {
    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true if the next scheduled tick may succeed where this one failed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Timeout { .. } | Self::Join(_) => true,
            Self::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::DiskFull
                        | rusqlite::ErrorCode::SystemIoFailure
                )
            ),
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Storage(_) | Self::Sqlite(_) => "storage",
            Self::Config(_) => "config",
            Self::Validation(_)
            | Self::InvalidResolution(_)
            | Self::InvalidMetricKind(_)
            | Self::InvalidTimeRange { .. } => "validation",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Join(_) => "async",
            Self::Timeout { .. } => "timeout",
            Self::AlreadyRunning(_) => "lifecycle",
        }
    }
}
