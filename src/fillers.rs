//! Filler phrase pool: short pre-synthesized acknowledgments protected from
//! eviction, so conversational latency masking never waits on a provider.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::cache::catalog::Catalog;
use crate::cache::store::{CacheStore, StoreRequest};
use crate::config::FillerTemplate;
use crate::format::AudioFormat;
use crate::gateway::FallbackOrchestrator;

/// Outcome of one template during a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillerStatus {
    /// Already cached; nothing synthesized.
    Exists,
    /// Synthesized and stored in this run.
    Generated,
    /// Synthesis or storage failed; see `error`.
    Error,
}

/// Per-template result of [`FillerManager::generate`].
#[derive(Debug, Clone, Serialize)]
pub struct FillerOutcome {
    pub id: String,
    pub text: String,
    pub status: FillerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-template cache state reported by [`FillerManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct FillerEntry {
    pub id: String,
    pub text: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
}

/// Built-in Turkish acknowledgment set used when the config names none.
pub fn default_templates() -> Vec<FillerTemplate> {
    [
        ("ack_listening", "Evet, dinliyorum"),
        ("ack_thinking", "Hmm, bir saniye"),
        ("ack_searching", "Bakıyorum"),
        ("ack_found", "Buldum, bir saniye"),
        ("ack_analyzing", "Analiz ediyorum"),
        ("ack_summarizing", "Özetliyorum"),
        ("ack_started", "Hemen bakıyorum"),
        ("ack_wait", "Bir dakika"),
    ]
    .into_iter()
    .map(|(id, text)| FillerTemplate {
        id: id.to_owned(),
        text: text.to_owned(),
    })
    .collect()
}

/// Synthesizes and tracks the filler pool for a voice.
pub struct FillerManager {
    catalog: Arc<Catalog>,
    store: Arc<CacheStore>,
    gateway: Arc<FallbackOrchestrator>,
    templates: Vec<FillerTemplate>,
}

impl std::fmt::Debug for FillerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillerManager")
            .field("templates", &self.templates.len())
            .finish_non_exhaustive()
    }
}

impl FillerManager {
    /// Create a manager; an empty template list falls back to the built-ins.
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<CacheStore>,
        gateway: Arc<FallbackOrchestrator>,
        templates: Vec<FillerTemplate>,
    ) -> Self {
        let templates = if templates.is_empty() { default_templates() } else { templates };
        Self {
            catalog,
            store,
            gateway,
            templates,
        }
    }

    /// Synthesize every missing filler for `voice_id`.
    ///
    /// Failures are recorded per template and never abort the batch.
    pub async fn generate(&self, voice_id: &str) -> Vec<FillerOutcome> {
        let mut outcomes = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            if self.store.lookup(&template.text, voice_id).is_some() {
                info!(filler = template.id.as_str(), "filler already cached");
                outcomes.push(FillerOutcome {
                    id: template.id.clone(),
                    text: template.text.clone(),
                    status: FillerStatus::Exists,
                    error: None,
                });
                continue;
            }

            let result = self
                .gateway
                .synthesize(&template.text, voice_id, "tts-1", AudioFormat::Mp3)
                .await
                .map_err(|e| e.to_string())
                .and_then(|audio| {
                    self.store
                        .store(&StoreRequest {
                            text: &template.text,
                            voice: voice_id,
                            model: "",
                            audio: &audio,
                            format: AudioFormat::Mp3,
                            version: None,
                            is_filler: true,
                        })
                        .map_err(|e| e.to_string())
                });

            match result {
                Ok(_) => {
                    info!(filler = template.id.as_str(), "generated filler");
                    outcomes.push(FillerOutcome {
                        id: template.id.clone(),
                        text: template.text.clone(),
                        status: FillerStatus::Generated,
                        error: None,
                    });
                }
                Err(e) => {
                    error!(filler = template.id.as_str(), error = %e, "failed to generate filler");
                    outcomes.push(FillerOutcome {
                        id: template.id.clone(),
                        text: template.text.clone(),
                        status: FillerStatus::Error,
                        error: Some(e),
                    });
                }
            }
        }
        outcomes
    }

    /// Cache state of every template for `voice_id`.
    pub fn list(&self, voice_id: &str) -> Vec<FillerEntry> {
        self.templates
            .iter()
            .map(|template| {
                let cached = self.store.lookup(&template.text, voice_id);
                FillerEntry {
                    id: template.id.clone(),
                    text: template.text.clone(),
                    cached: cached.is_some(),
                    audio_path: cached.map(|m| m.audio_path.to_string_lossy().into_owned()),
                }
            })
            .collect()
    }

    /// Number of filler rows currently in the catalog.
    pub fn cached_count(&self) -> u64 {
        self.catalog
            .get_stats()
            .map(|stats| stats.filler_count)
            .unwrap_or(0)
    }
}
