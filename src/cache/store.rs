//! Artifact store: composes the hot index, the artifact directory, and the
//! metadata catalog so a write lands in all three from the caller's
//! viewpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::catalog::{Catalog, CatalogError, NewEntry};
use crate::cache::hot::HotIndex;
use crate::cache::matcher::{CacheMatch, Matcher};
use crate::cache::normalizer::normalize;
use crate::config::{FuzzyConfig, NormalizeOptions};
use crate::format::AudioFormat;

/// Errors from a store write.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("artifact write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the catalog rejected the row as a duplicate, meaning a concurrent
    /// miss already resolved this key.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Catalog(e) if e.is_duplicate())
    }

    /// The version number the duplicate collided on, when applicable.
    pub fn duplicate_version(&self) -> Option<i64> {
        match self {
            Self::Catalog(CatalogError::Duplicate { version, .. }) => Some(*version),
            _ => None,
        }
    }
}

/// One artifact write request.
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub text: &'a str,
    pub voice: &'a str,
    pub model: &'a str,
    pub audio: &'a [u8],
    pub format: AudioFormat,
    /// Explicit rendition number; `None` lets the store pick the next one.
    pub version: Option<i64>,
    pub is_filler: bool,
}

/// A completed artifact write.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub audio_path: PathBuf,
    pub normalized: String,
    pub version: i64,
}

/// Main cache interface combining the hot index, artifact files, and the
/// catalog.
pub struct CacheStore {
    audio_dir: PathBuf,
    hot: Arc<HotIndex>,
    matcher: Matcher,
    catalog: Arc<Catalog>,
    variety_depth: i64,
    normalize: NormalizeOptions,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("audio_dir", &self.audio_dir)
            .field("variety_depth", &self.variety_depth)
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Create a store over `audio_dir`, creating the directory if needed.
    pub fn new(
        audio_dir: &Path,
        hot: Arc<HotIndex>,
        catalog: Arc<Catalog>,
        variety_depth: u32,
        fuzzy: FuzzyConfig,
        normalize: NormalizeOptions,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(audio_dir)?;
        let matcher = Matcher::new(Arc::clone(&hot), fuzzy, normalize.clone());
        Ok(Self {
            audio_dir: audio_dir.to_owned(),
            hot,
            matcher,
            catalog,
            variety_depth: variety_depth.max(1) as i64,
            normalize,
        })
    }

    /// Look up raw text for a voice.
    pub fn lookup(&self, text: &str, voice: &str) -> Option<CacheMatch> {
        self.matcher.find(text, voice)
    }

    /// The fingerprint this store computes for raw text.
    pub fn fingerprint(&self, text: &str) -> String {
        normalize(text, &self.normalize)
    }

    /// Write an artifact: file bytes, hot index entry, catalog row.
    ///
    /// A [`CatalogError::Duplicate`] surfaces to the caller; the request
    /// pipeline treats it as a concurrent miss resolved as a hit.
    pub fn store(&self, req: &StoreRequest<'_>) -> Result<StoredArtifact, StoreError> {
        let normalized = normalize(req.text, &self.normalize);

        let version = match req.version {
            Some(version) => version,
            None => {
                let count = self.catalog.get_version_count(&normalized, req.voice)?;
                (count + 1).min(self.variety_depth)
            }
        };

        let filename = artifact_filename(&normalized, req.voice, req.format, version);
        let audio_path = self.audio_dir.join(filename);
        std::fs::write(&audio_path, req.audio)?;

        self.hot.add(&normalized, req.voice, &audio_path);
        self.catalog.add_entry(&NewEntry {
            text_original: req.text,
            text_normalized: &normalized,
            voice_id: req.voice,
            model: req.model,
            audio_path: &audio_path,
            audio_format: req.format,
            file_size: req.audio.len() as u64,
            duration_ms: 0,
            is_filler: req.is_filler,
            version_num: version,
        })?;

        Ok(StoredArtifact {
            audio_path,
            normalized,
            version,
        })
    }

    /// Drop the in-memory index. Catalog and files are the caller's problem
    /// (the full-clear endpoint purges those through the catalog).
    pub fn clear(&self) {
        self.hot.clear();
    }

    /// Distinct keys in the hot index.
    pub fn size(&self) -> usize {
        self.hot.len()
    }

    pub fn hot(&self) -> &Arc<HotIndex> {
        &self.hot
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }
}

/// Derive the artifact filename from the key.
///
/// First 16 hex characters of an MD5 over `fingerprint:voice:format` (first
/// rendition) or `fingerprint:voice:format:version`. The digest is a compact
/// non-cryptographic name; collisions are resolved by the catalog's unique
/// index, which is the authority.
fn artifact_filename(fingerprint: &str, voice: &str, format: AudioFormat, version: i64) -> String {
    let key = if version == 1 {
        format!("{fingerprint}:{voice}:{format}")
    } else {
        format!("{fingerprint}:{voice}:{format}:{version}")
    };
    let digest = md5::compute(key.as_bytes());
    let hex = format!("{digest:x}");
    format!("{}.{}", &hex[..16], format.extension())
}
