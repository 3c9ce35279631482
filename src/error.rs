use thiserror::Error;

use crate::models::TransientKind;

/// Unified error type for proxy-scout
#[derive(Error, Debug)]
pub enum ScoutError {
    // Caller input errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Proxy errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    // Transport errors
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy-scout operations
pub type Result<T> = std::result::Result<T, ScoutError>;

impl ScoutError {
    /// Map a transport failure onto the transient taxonomy.
    ///
    /// Argument and configuration errors are rejected before any network
    /// call is made, so they only reach this point if a fetcher misbehaves;
    /// they are reported as connection errors rather than escaping.
    pub fn transient_kind(&self) -> TransientKind {
        match self {
            ScoutError::ProxyConnectionFailed(_) => TransientKind::ProxyError,
            ScoutError::ConnectFailed(_)
            | ScoutError::Tls(_)
            | ScoutError::Http(_)
            | ScoutError::Io(_)
            | ScoutError::InvalidArgument(_)
            | ScoutError::InvalidConfig(_) => TransientKind::ConnectionError,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ScoutError {
    fn from(err: hyper::Error) -> Self {
        ScoutError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ScoutError {
    fn from(err: url::ParseError) -> Self {
        ScoutError::InvalidArgument(err.to_string())
    }
}
