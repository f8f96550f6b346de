//! Free keyless backup provider.
//!
//! Speaks the same OpenAI-compatible speech surface against a local
//! edge-tts bridge, so the proxy still answers when every paid provider is
//! down or unconfigured. Defaults to a Turkish neural voice.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use crate::config::ProviderConfig;
use crate::format::AudioFormat;
use crate::gateway::provider::{ProviderError, TtsProvider};
use crate::gateway::router::EDGE_PROVIDER_NAME;

/// Default bridge address (the conventional port of local edge-tts bridges).
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5050";

/// Default voice when neither the request nor the config names one.
const DEFAULT_VOICE: &str = "tr-TR-AhmetNeural";

/// Keyless edge-tts backup client.
#[derive(Debug)]
pub struct EdgeProvider {
    client: reqwest::Client,
    base_url: String,
    default_voice: String,
    timeout: Duration,
}

impl EdgeProvider {
    /// Build from the `providers.edge` config block; empty fields fall back
    /// to the bridge defaults.
    pub fn from_config(config: Option<&ProviderConfig>) -> Self {
        let base_url = config
            .map(|c| c.base_url.as_str())
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_BASE_URL);
        let default_voice = config
            .map(|c| c.default_voice.as_str())
            .filter(|voice| !voice.is_empty())
            .unwrap_or(DEFAULT_VOICE);
        let timeout = Duration::from_secs(config.map(|c| c.timeout).unwrap_or(15));

        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            default_voice: default_voice.to_owned(),
            timeout,
        }
    }

    pub fn default_voice(&self) -> &str {
        &self.default_voice
    }
}

#[async_trait]
impl TtsProvider for EdgeProvider {
    fn name(&self) -> &str {
        EDGE_PROVIDER_NAME
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        _model: &str,
        format: AudioFormat,
    ) -> Result<Bytes, ProviderError> {
        let voice = if voice.is_empty() { &self.default_voice } else { voice };
        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .timeout(self.timeout)
            .json(&json!({
                "model": "tts-1",
                "input": text,
                "voice": voice,
                "response_format": format.extension(),
            }))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response.bytes().await.map_err(ProviderError::from_reqwest)
    }
}
