//! Two-tier cache matching: exact first, fuzzy as an opt-in second pass.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::hot::HotIndex;
use crate::cache::normalizer::normalize;
use crate::config::{FuzzyConfig, NormalizeOptions};

/// How a lookup found its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// A successful cache lookup.
///
/// Carries enough information for the caller to attribute the hit to the
/// fingerprint actually reused: on a fuzzy hit `matched` holds the bucket
/// fingerprint, not the normalized input.
#[derive(Debug, Clone)]
pub struct CacheMatch {
    pub audio_path: PathBuf,
    pub match_type: MatchType,
    pub score: f64,
    pub normalized: String,
    pub matched: Option<String>,
}

impl CacheMatch {
    /// The fingerprint hits should be recorded against.
    pub fn served_fingerprint(&self) -> &str {
        self.matched.as_deref().unwrap_or(&self.normalized)
    }
}

/// Composes the [`HotIndex`]: exact lookup first, then fuzzy when enabled.
#[derive(Debug, Clone)]
pub struct Matcher {
    hot: Arc<HotIndex>,
    fuzzy: FuzzyConfig,
    normalize: NormalizeOptions,
}

impl Matcher {
    pub fn new(hot: Arc<HotIndex>, fuzzy: FuzzyConfig, normalize: NormalizeOptions) -> Self {
        Self { hot, fuzzy, normalize }
    }

    /// Look up raw request text for a voice.
    pub fn find(&self, text: &str, voice: &str) -> Option<CacheMatch> {
        let normalized = normalize(text, &self.normalize);
        if normalized.is_empty() {
            return None;
        }

        if let Some(path) = self.hot.exact(&normalized, voice) {
            return Some(CacheMatch {
                audio_path: path,
                match_type: MatchType::Exact,
                score: 100.0,
                normalized,
                matched: None,
            });
        }

        if !self.fuzzy.enabled {
            return None;
        }

        let hit = self
            .hot
            .fuzzy(&normalized, voice, self.fuzzy.threshold, self.fuzzy.scorer)?;
        Some(CacheMatch {
            audio_path: hit.audio_path,
            match_type: MatchType::Fuzzy,
            score: hit.score,
            normalized,
            matched: Some(hit.matched),
        })
    }
}
