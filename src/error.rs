use thiserror::Error;

pub type Result<T> = std::result::Result<T, HyphaError>;

#[derive(Error, Debug)]
pub enum HyphaError {
    #[error("Invalid seed length: expected {expected} bytes, got {actual}")]
    InvalidSeedLength { expected: usize, actual: usize },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DHT unavailable: {0}")]
    DhtUnavailable(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Settlement error: {0}")]
    Settlement(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl HyphaError {
    /// Whether the caller may reasonably retry the operation that produced this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HyphaError::ConnectionFailed(_)
                | HyphaError::DhtUnavailable(_)
                | HyphaError::Timeout(_)
                | HyphaError::Io(_)
        )
    }
}

impl From<serde_json::Error> for HyphaError {
    fn from(err: serde_json::Error) -> Self {
        HyphaError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for HyphaError {
    fn from(err: std::io::Error) -> Self {
        HyphaError::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for HyphaError {
    fn from(err: hex::FromHexError) -> Self {
        HyphaError::Validation(format!("invalid hex: {}", err))
    }
}

impl From<toml::de::Error> for HyphaError {
    fn from(err: toml::de::Error) -> Self {
        HyphaError::Config(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HyphaError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HyphaError::Timeout(err.to_string())
    }
}
