//! Error types for the tender monitor

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Adapter error: {0}")]
    AdapterError(#[from] AdapterError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No active keywords configured")]
    NoActiveKeywords,

    #[error("Unknown adapter key: {0}")]
    UnknownAdapter(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Duplicate record for source {source_id}: {content_hash}")]
    DuplicateRecord {
        source_id: i64,
        content_hash: String,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Scan task aborted: {0}")]
    TaskAborted(String),

    #[error("Notification failed: {0}")]
    NotifyError(String),
}

/// Failures raised while fetching from a source adapter.
///
/// Timeouts and transport failures stay distinct from payloads that arrived
/// but could not be understood.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("unparseable payload: {0}")]
    Parse(String),

    #[error("adapter misconfigured: {0}")]
    Config(String),
}

impl AdapterError {
    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Timeout(_) => "timeout",
            AdapterError::Transport(_) => "transport",
            AdapterError::Status { .. } => "http_status",
            AdapterError::Parse(_) => "parse",
            AdapterError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            AdapterError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if e.is_decode() {
            AdapterError::Parse(e.to_string())
        } else {
            AdapterError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
