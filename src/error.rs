//! Error types for the caching proxy.

use crate::cache::catalog::CatalogError;
use crate::gateway::GatewayError;
use crate::transcode::TranscodeError;

/// Top-level error type for the proxy pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request carried no text to synthesize.
    #[error("empty input text")]
    EmptyInput,

    /// Metadata catalog error (SQLite layer).
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Provider gateway error (terminal provider failure or exhaustion).
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Audio format conversion error.
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Background task join failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ProxyError>;
