use thiserror::Error;

/// Failures reported by a history source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("history source unavailable: {0}")]
    Unavailable(String),

    #[error("history source rejected credential: {0}")]
    AuthRevoked(String),
}

/// Failures reported by the scrobble API for a whole call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubmitError {
    #[error("scrobble api rejected session: {0}")]
    AuthRevoked(String),

    #[error("scrobble api unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    NotFound(String),

    #[error("watermark for user {0} changed concurrently")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome taxonomy of a single user's run. Everything except `AuthRevoked`
/// is retried on the next tick.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("history source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("credential revoked: {0}")]
    AuthRevoked(String),

    #[error("scrobble api unavailable: {0}")]
    ScrobbleUnavailable(String),

    #[error("run exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("watermark for user {0} changed concurrently")]
    WatermarkConflict(String),

    #[error("user {0} is not eligible for scrobbling")]
    NotEligible(String),

    #[error("scheduler shut down before the run started")]
    Cancelled,

    #[error("run task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Store(StoreError),
}

impl SyncError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::AuthRevoked(_))
    }
}

impl From<SourceError> for SyncError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable(msg) => SyncError::SourceUnavailable(msg),
            SourceError::AuthRevoked(msg) => SyncError::AuthRevoked(msg),
        }
    }
}

impl From<SubmitError> for SyncError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::AuthRevoked(msg) => SyncError::AuthRevoked(msg),
            SubmitError::Unavailable(msg) => SyncError::ScrobbleUnavailable(msg),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => SyncError::WatermarkConflict(id),
            other => SyncError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
