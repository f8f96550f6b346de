//! The narrow capability every upstream TTS client implements, plus the
//! error classification the fallback walk relies on.

use async_trait::async_trait;
use bytes::Bytes;

use crate::format::AudioFormat;

/// A single provider attempt failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The upstream answered with a non-success HTTP status.
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },

    /// The request timed out before a response arrived.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Anything else, with no status code to classify on.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// The HTTP status code, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the orchestrator should continue to the next provider.
    ///
    /// A 400 means the request itself is malformed; re-sending it elsewhere
    /// cannot help. Other non-429 4xx responses are equally terminal.
    pub fn should_fallback(&self) -> bool {
        match self.status() {
            Some(400) => false,
            Some(429) => true,
            Some(status) => status >= 500,
            None => true,
        }
    }

    /// Whether this failure counts toward the provider's circuit breaker.
    ///
    /// Terminal client errors describe the request, not the provider's
    /// health, so they never open a circuit.
    pub fn counts_as_failure(&self) -> bool {
        match self.status() {
            Some(status) => status == 429 || status >= 500,
            None => true,
        }
    }

    /// Classify a transport-level error.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Synthesizes audio for a `(text, voice, model, format)` tuple.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Name the orchestrator logs and keys circuit state by.
    fn name(&self) -> &str;

    /// Synthesize one utterance to audio bytes in `format`.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        model: &str,
        format: AudioFormat,
    ) -> Result<Bytes, ProviderError>;
}
