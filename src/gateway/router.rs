//! Multi-deployment router over OpenAI-compatible speech APIs.
//!
//! Plays the role of a generic model router: every configured provider block
//! becomes a deployment, tried in configuration order with its own base URL,
//! credentials, timeout, and name mappings. The router presents itself to
//! the fallback orchestrator as a single provider.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::format::AudioFormat;
use crate::gateway::mapping::NameMapper;
use crate::gateway::provider::{ProviderError, TtsProvider};

/// Provider name the orchestrator dispatches to this client by.
pub const ROUTER_PROVIDER_NAME: &str = "router";

/// Provider name reserved for the keyless backup client.
pub const EDGE_PROVIDER_NAME: &str = "edge";

/// Request body of the OpenAI-compatible speech endpoint.
#[derive(Debug, Serialize)]
struct SpeechApiRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// One upstream deployment the router can try.
#[derive(Debug, Clone)]
struct Deployment {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    default_voice: String,
    timeout: Duration,
}

/// Ordered walk over configured OpenAI-compatible TTS deployments.
pub struct SpeechRouter {
    client: reqwest::Client,
    deployments: Vec<Deployment>,
    voices: NameMapper,
    models: NameMapper,
}

impl std::fmt::Debug for SpeechRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechRouter")
            .field("deployments", &self.deployments.len())
            .finish_non_exhaustive()
    }
}

impl SpeechRouter {
    /// Build the deployment list from settings.
    ///
    /// Order: the default provider, then the fallback chain, then any
    /// remaining configured blocks in name order (the config map is
    /// unordered, so name order is the deterministic tie-break; providers
    /// whose position matters belong in `fallback_chain`). Duplicates and
    /// the reserved `edge` name are skipped, as are blocks without an API
    /// key or base URL.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut ordered: Vec<String> = Vec::new();
        let mut push = |name: &str, ordered: &mut Vec<String>| {
            if name.is_empty() || name == EDGE_PROVIDER_NAME || ordered.iter().any(|n| n == name) {
                return;
            }
            if settings.providers.configs.contains_key(name) {
                ordered.push(name.to_owned());
            } else {
                warn!(provider = name, "provider referenced but not configured");
            }
        };
        push(&settings.providers.default, &mut ordered);
        for name in &settings.providers.fallback_chain {
            push(name, &mut ordered);
        }
        let mut remaining: Vec<&String> = settings
            .providers
            .configs
            .keys()
            .filter(|name| name.as_str() != EDGE_PROVIDER_NAME && !ordered.contains(*name))
            .collect();
        remaining.sort();
        for name in remaining {
            ordered.push(name.clone());
        }

        let mut deployments = Vec::new();
        for name in ordered {
            let cfg = &settings.providers.configs[&name];
            if cfg.base_url.is_empty() {
                warn!(provider = name.as_str(), "skipping deployment without base_url");
                continue;
            }
            if !has_api_key(&cfg.api_key) {
                warn!(provider = name.as_str(), "skipping deployment without api_key");
                continue;
            }
            deployments.push(Deployment {
                model: if cfg.model.is_empty() { "tts-1".to_owned() } else { cfg.model.clone() },
                base_url: cfg.base_url.trim_end_matches('/').to_owned(),
                api_key: cfg.api_key.clone(),
                default_voice: cfg.default_voice.clone(),
                timeout: Duration::from_secs(cfg.timeout),
                name,
            });
        }

        if deployments.is_empty() {
            warn!("no TTS deployments configured; synthesis will fail on cache miss");
        } else {
            info!(count = deployments.len(), "speech router initialized");
        }

        Self {
            client: reqwest::Client::new(),
            deployments,
            voices: NameMapper::new(settings.voice_mapping.clone()),
            models: NameMapper::new(settings.model_mapping.clone()),
        }
    }

    /// Number of usable deployments.
    pub fn deployment_count(&self) -> usize {
        self.deployments.len()
    }

    /// Deployment names in the order they are tried.
    pub fn deployment_names(&self) -> Vec<&str> {
        self.deployments.iter().map(|d| d.name.as_str()).collect()
    }

    async fn call_deployment(
        &self,
        deployment: &Deployment,
        text: &str,
        voice: &str,
        model: &str,
        format: AudioFormat,
    ) -> Result<Bytes, ProviderError> {
        let voice = if voice.is_empty() {
            deployment.default_voice.as_str()
        } else {
            voice
        };
        let voice = self.voices.map(voice, &deployment.name);
        let model = if model.is_empty() { deployment.model.as_str() } else { model };
        let model = self.models.map(model, &deployment.name);

        let body = SpeechApiRequest {
            model,
            input: text,
            voice,
            response_format: format.extension(),
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", deployment.base_url))
            .bearer_auth(&deployment.api_key)
            .timeout(deployment.timeout)
            .json(&body)
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

#[async_trait]
impl TtsProvider for SpeechRouter {
    fn name(&self) -> &str {
        ROUTER_PROVIDER_NAME
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        model: &str,
        format: AudioFormat,
    ) -> Result<Bytes, ProviderError> {
        if self.deployments.is_empty() {
            return Err(ProviderError::Other("no TTS deployments configured".into()));
        }

        let mut last_error = None;
        for deployment in &self.deployments {
            match self.call_deployment(deployment, text, voice, model, format).await {
                Ok(audio) => return Ok(audio),
                Err(e) => {
                    warn!(
                        deployment = deployment.name.as_str(),
                        error = %e,
                        "speech deployment failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProviderError::Other("no deployment responded".into())))
    }
}

/// An api_key is usable when set and not an unresolved `${VAR}` placeholder.
fn has_api_key(api_key: &str) -> bool {
    let trimmed = api_key.trim();
    !trimmed.is_empty() && !(trimmed.starts_with("${") && trimmed.ends_with('}'))
}
