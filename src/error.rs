use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Gateway error: {0}")]
    GatewayError(String),
    #[error("Downstream error: {0}")]
    DownstreamError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ReconcileError::GatewayError(format!("request timed out: {err}"))
        } else if err.is_connect() {
            ReconcileError::GatewayError(format!("failed to connect: {err}"))
        } else {
            ReconcileError::GatewayError(format!("request failed: {err}"))
        }
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for ReconcileError {
    fn from(err: rocksdb::Error) -> Self {
        ReconcileError::InternalError(Box::new(err))
    }
}
