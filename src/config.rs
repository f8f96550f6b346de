//! Configuration types for the caching proxy.
//!
//! Every section has serde defaults so a missing or partial config file
//! yields a runnable server. String values support `${VAR}` environment
//! substitution, applied before deserialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::hot::FuzzyScorer;
use crate::error::{ProxyError, Result};

/// Top-level settings for the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Upstream TTS provider settings.
    pub providers: ProvidersConfig,
    /// Cache storage, lookup, and eviction settings.
    pub cache: CacheConfig,
    /// Filler phrase pool settings.
    pub fillers: FillerConfig,
    /// Generic voice name → provider → provider-specific voice name.
    pub voice_mapping: HashMap<String, HashMap<String, String>>,
    /// Generic model name → provider → provider-specific model name.
    pub model_mapping: HashMap<String, HashMap<String, String>>,
}

impl Settings {
    /// Parse settings from a TOML string, resolving `${VAR}` references.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let value: toml::Value = raw
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid TOML: {e}")))?;
        let value = resolve_env_vars(value);
        value
            .try_into()
            .map_err(|e| ProxyError::Config(format!("invalid settings: {e}")))
    }

    /// Load settings from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Load settings from `speechcache.toml` in the working directory,
    /// falling back to built-in defaults when no file is present.
    pub fn load() -> Result<Self> {
        let path = Path::new("speechcache.toml");
        if path.exists() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Look up the config block for a named provider.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.configs.get(name)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8844,
            log_level: "info".to_owned(),
        }
    }
}

/// Upstream provider configuration.
///
/// Unrecognized keys are treated as named provider blocks, so
/// `[providers.openai]` and `[providers.edge]` sit next to `default` and
/// `fallback_chain`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Name of the provider tried first.
    pub default: String,
    /// Ordered names of providers tried after the default.
    pub fallback_chain: Vec<String>,
    /// Per-provider connection settings, keyed by provider name.
    #[serde(flatten)]
    pub configs: HashMap<String, ProviderConfig>,
}

/// Connection settings for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Deployment model identifier sent upstream.
    pub model: String,
    /// Base URL of the provider's OpenAI-compatible API.
    pub base_url: String,
    /// Bearer token; empty means the provider is keyless.
    pub api_key: String,
    /// Voice used when the client does not name one.
    pub default_voice: String,
    /// Per-request timeout in seconds.
    pub timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            default_voice: String::new(),
            timeout: 15,
        }
    }
}

/// Cache storage and lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding artifact files.
    pub audio_dir: PathBuf,
    /// Path of the SQLite metadata catalog.
    pub db_path: PathBuf,
    /// Whether lookups and writes happen at all.
    pub enabled: bool,
    /// Maximum stored renditions per (fingerprint, voice).
    pub variety_depth: u32,
    /// Approximate-match settings.
    pub fuzzy: FuzzyConfig,
    /// Fingerprint pipeline toggles.
    pub normalize: NormalizeOptions,
    /// Eviction policy settings.
    pub eviction: EvictionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            audio_dir: PathBuf::from("./data/audio"),
            db_path: PathBuf::from("./data/cache.db"),
            enabled: true,
            variety_depth: 1,
            fuzzy: FuzzyConfig::default(),
            normalize: NormalizeOptions::default(),
            eviction: EvictionConfig::default(),
        }
    }
}

/// Approximate-match configuration for the hot index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyConfig {
    /// Whether fuzzy lookup runs after an exact miss.
    pub enabled: bool,
    /// Minimum score (0–100) for a fuzzy candidate to count as a hit.
    pub threshold: f64,
    /// Scoring function used against bucket fingerprints.
    pub scorer: FuzzyScorer,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 90.0,
            scorer: FuzzyScorer::TokenSortRatio,
        }
    }
}

/// Independently-toggleable stages of the fingerprint pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Turkish-aware lowercase + diacritic fold.
    pub lowercase: bool,
    /// Drop characters that are neither alphanumeric nor whitespace.
    pub strip_punctuation: bool,
    /// Collapse whitespace runs to a single space.
    pub collapse_whitespace: bool,
    /// Replace every digit run with `#`.
    pub replace_numbers: bool,
    /// Strip `<#1.5#>` pause markers and `(laughs)`-style interjection tags.
    pub strip_minimax: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            lowercase: true,
            strip_punctuation: true,
            collapse_whitespace: true,
            replace_numbers: true,
            strip_minimax: true,
        }
    }
}

/// Eviction policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Reserved byte-size cap; selection is currently row-count based.
    pub max_size_mb: u64,
    /// Entry count the cache is trimmed back to.
    pub max_entries: u64,
    /// Texts longer than this are synthesized but never cached.
    pub max_text_length: usize,
    /// Period of the background eviction task.
    pub cleanup_interval_hours: u64,
    /// Never-hit entries younger than this are left alone.
    pub min_age_days: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 500,
            max_entries: 50_000,
            max_text_length: 500,
            cleanup_interval_hours: 1,
            min_age_days: 7,
        }
    }
}

/// One pre-synthesized acknowledgment phrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillerTemplate {
    /// Stable identifier reported by the filler endpoints.
    pub id: String,
    /// Text synthesized for this filler.
    pub text: String,
}

/// Filler pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    /// Synthesize missing fillers during startup (best-effort, 30s budget).
    pub auto_generate_on_startup: bool,
    /// Voice the startup generation targets.
    pub voice_id: String,
    /// Template set; empty falls back to the built-in acknowledgments.
    pub templates: Vec<FillerTemplate>,
}

static ENV_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env pattern compiles"));

/// Replace `${VAR}` references in every string value of a TOML tree.
///
/// Unset variables are left verbatim so a missing key is visible downstream
/// instead of silently becoming an empty string.
fn resolve_env_vars(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::String(s) => {
            let replaced = ENV_PATTERN.replace_all(&s, |caps: &regex::Captures<'_>| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_owned())
            });
            toml::Value::String(replaced.into_owned())
        }
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(resolve_env_vars).collect())
        }
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(k, v)| (k, resolve_env_vars(v)))
                .collect(),
        ),
        other => other,
    }
}
