//! Upstream TTS provider clients and the fallback orchestrator.

pub mod edge;
pub mod fallback;
pub mod mapping;
pub mod provider;
pub mod router;

pub use edge::EdgeProvider;
pub use fallback::{CircuitBreakerConfig, FallbackOrchestrator, ProviderStatus};
pub use mapping::NameMapper;
pub use provider::{ProviderError, TtsProvider};
pub use router::SpeechRouter;

/// Errors surfaced by the fallback orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A provider failed terminally; falling back would re-send a request
    /// the upstream already judged malformed.
    #[error("provider error: {0}")]
    Terminal(ProviderError),

    /// Every provider in the chain was skipped or failed.
    #[error("TTS unavailable: all fallback providers failed ({})", .errors.join("; "))]
    Exhausted { errors: Vec<String> },
}

impl GatewayError {
    /// Upstream status code to relay, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Terminal(e) => e.status(),
            Self::Exhausted { .. } => None,
        }
    }
}
