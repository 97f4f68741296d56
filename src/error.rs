use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransporterError>;

#[derive(Debug, Error)]
pub enum TransporterError {
    /// Bad or missing URI, unknown property, malformed value, blank field.
    #[error("{0}")]
    Validation(String),

    /// The subscriber or subscriptor is locked or in use.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// PKCS#12 decoding, key type or chain verification failure.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Connect or handshake failure reported by a provider constructor or TLS rebind.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<openssl::error::ErrorStack> for TransporterError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        TransporterError::Certificate(err.to_string())
    }
}

impl TransporterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TransporterError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        TransporterError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TransporterError::NotFound(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TransporterError::Transport(msg.into())
    }
}
