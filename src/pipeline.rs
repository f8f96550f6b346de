//! The request pipeline: cache-hit fast path, miss-then-synthesize slow
//! path, background variety generation, and write-pressure eviction.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::cache::catalog::Catalog;
use crate::cache::evictor::Evictor;
use crate::cache::matcher::MatchType;
use crate::cache::store::{CacheStore, StoreError, StoreRequest};
use crate::config::Settings;
use crate::error::{ProxyError, Result};
use crate::fillers::FillerManager;
use crate::format::AudioFormat;
use crate::gateway::FallbackOrchestrator;
use crate::transcode::Transcoder;

/// Successful cache writes between write-pressure eviction runs.
const WRITE_EVICTION_INTERVAL: u32 = 100;

/// One client synthesis request.
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub model: String,
    pub format: AudioFormat,
}

/// Audio ready to return, tagged with the format actually served.
#[derive(Debug, Clone)]
pub struct SpeechAudio {
    pub bytes: Bytes,
    pub format: AudioFormat,
}

/// Everything a request handler needs, constructed once at startup.
///
/// Owning all shared state in one record keeps handlers free of process
/// globals; the single-flight set and write counter are the only
/// cross-request coordination primitives.
pub struct ServerState {
    pub settings: Settings,
    pub catalog: Arc<Catalog>,
    pub store: Arc<CacheStore>,
    pub gateway: Arc<FallbackOrchestrator>,
    pub fillers: Arc<FillerManager>,
    pub evictor: Arc<Evictor>,
    pub transcoder: Option<Transcoder>,
    /// Cache writes since the last write-pressure eviction.
    write_counter: AtomicU32,
    /// `(fingerprint, voice)` keys with a variety task in flight.
    variety_in_flight: Mutex<HashSet<(String, String)>>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

impl ServerState {
    pub fn new(
        settings: Settings,
        catalog: Arc<Catalog>,
        store: Arc<CacheStore>,
        gateway: Arc<FallbackOrchestrator>,
        fillers: Arc<FillerManager>,
        evictor: Arc<Evictor>,
        transcoder: Option<Transcoder>,
    ) -> Self {
        Self {
            settings,
            catalog,
            store,
            gateway,
            fillers,
            evictor,
            transcoder,
            write_counter: AtomicU32::new(0),
            variety_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Number of variety keys currently in flight (observability and tests).
    pub fn variety_in_flight_len(&self) -> usize {
        self.variety_in_flight.lock().expect("variety lock").len()
    }
}

/// Serve one synthesis request through the cache.
pub async fn synthesize_speech(
    state: &Arc<ServerState>,
    request: SpeechRequest,
) -> Result<SpeechAudio> {
    if request.text.is_empty() {
        return Err(ProxyError::EmptyInput);
    }

    let cache_enabled = state.settings.cache.enabled;

    if cache_enabled {
        if let Some(hit) = state.store.lookup(&request.text, &request.voice) {
            match serve_hit(state, &request, &hit).await {
                Some(audio) => return Ok(audio),
                // Artifact vanished between lookup and read: treat as a miss.
                None => warn!(
                    reason_code = "error_file_not_found",
                    voice = request.voice.as_str(),
                    path = %hit.audio_path.display(),
                    "cached artifact unreadable, falling through to synthesis"
                ),
            }
        }
    }

    // Miss path: providers always synthesize the canonical storage format.
    let audio = state
        .gateway
        .synthesize(&request.text, &request.voice, &request.model, AudioFormat::Mp3)
        .await
        .map_err(ProxyError::Gateway)?;

    // Past the provider-response boundary the synthesis effort is not
    // wasted on client disconnect: conversion and persistence run in their
    // own task, which outlives a cancelled handler future.
    let task_state = Arc::clone(state);
    let handle = tokio::spawn(async move {
        let (bytes, format) =
            convert_or_downgrade(&task_state, audio, AudioFormat::Mp3, request.format).await;

        if cache_enabled {
            persist_miss(&task_state, &request, &bytes, format).await?;
            schedule_variety(&task_state, &request);
        } else {
            task_state.catalog.record_miss();
            info!(
                reason_code = "miss_no_cache",
                voice = request.voice.as_str(),
                "cache disabled, serving synthesized audio"
            );
        }

        Ok(SpeechAudio { bytes, format })
    });

    handle
        .await
        .map_err(|e| ProxyError::Internal(format!("miss-path task failed: {e}")))?
}

/// Serve a lookup hit. `None` means the artifact could not be read and the
/// caller should fall through to synthesis.
async fn serve_hit(
    state: &Arc<ServerState>,
    request: &SpeechRequest,
    hit: &crate::cache::matcher::CacheMatch,
) -> Option<SpeechAudio> {
    let data = tokio::fs::read(&hit.audio_path).await.ok()?;
    let cached_format = AudioFormat::from_path(&hit.audio_path).unwrap_or(AudioFormat::Mp3);

    let (bytes, format) =
        convert_or_downgrade(state, Bytes::from(data), cached_format, request.format).await;

    let reason_code = match hit.match_type {
        MatchType::Exact => "exact_hit",
        MatchType::Fuzzy => "fuzzy_hit",
    };
    info!(
        reason_code,
        voice = request.voice.as_str(),
        score = hit.score,
        format = %format,
        "cache hit"
    );

    // At-most-once accounting against the entry actually reused; the update
    // may complete after the response is written.
    let catalog = Arc::clone(&state.catalog);
    let fingerprint = hit.served_fingerprint().to_owned();
    let voice = request.voice.clone();
    let audio_path = hit.audio_path.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = catalog.record_hit_for_path(&fingerprint, &voice, &audio_path) {
            warn!(error = %e, "failed to record cache hit");
        }
    });

    schedule_variety(state, request);

    Some(SpeechAudio { bytes, format })
}

/// Convert `bytes` from `have` to `want`; on any failure serve what we have.
///
/// mp3 requests never transcode: mp3 is what providers already return, and
/// a non-mp3 artifact is served as-is with its real format advertised.
async fn convert_or_downgrade(
    state: &Arc<ServerState>,
    bytes: Bytes,
    have: AudioFormat,
    want: AudioFormat,
) -> (Bytes, AudioFormat) {
    if have == want || want == AudioFormat::Mp3 {
        return (bytes, have);
    }
    let Some(transcoder) = &state.transcoder else {
        warn!(from = %have, to = %want, "no transcoder available, serving source format");
        return (bytes, have);
    };
    match transcoder.convert(&bytes, want).await {
        Ok(converted) => {
            debug!(from = %have, to = %want, "converted audio format");
            (Bytes::from(converted), want)
        }
        Err(e) => {
            warn!(from = %have, to = %want, error = %e, "conversion failed, serving source format");
            (bytes, have)
        }
    }
}

/// Write a miss result through the store, converting a lost write race into
/// a hit and running write-pressure eviction.
///
/// Only the duplicate outcome is recovered locally; any other store failure
/// surfaces to the caller instead of silently serving uncached audio.
async fn persist_miss(
    state: &Arc<ServerState>,
    request: &SpeechRequest,
    bytes: &Bytes,
    format: AudioFormat,
) -> Result<()> {
    state.catalog.record_miss();

    if request.text.len() > state.settings.cache.eviction.max_text_length {
        info!(
            reason_code = "miss_text_too_long",
            voice = request.voice.as_str(),
            text_length = request.text.len(),
            "skipping cache write"
        );
        return Ok(());
    }

    let store = Arc::clone(&state.store);
    let store_request = StoreRequest {
        text: &request.text,
        voice: &request.voice,
        model: &request.model,
        audio: bytes,
        format,
        version: None,
        is_filler: false,
    };

    match store.store(&store_request) {
        Ok(_) => {
            info!(
                reason_code = "miss",
                voice = request.voice.as_str(),
                format = %format,
                "cached synthesized audio"
            );
            let writes = state.write_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if writes >= WRITE_EVICTION_INTERVAL {
                state.write_counter.store(0, Ordering::SeqCst);
                let evictor = Arc::clone(&state.evictor);
                tokio::task::spawn_blocking(move || match evictor.run() {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "write-triggered eviction")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "write-triggered eviction failed"),
                });
            }
        }
        Err(e) if e.is_duplicate() => {
            // A concurrent miss for the same key won the insert; account the
            // audio we already synthesized as a hit on the surviving row.
            info!(
                reason_code = "miss_race_duplicate",
                voice = request.voice.as_str(),
                "concurrent miss resolved as hit"
            );
            let catalog = Arc::clone(&state.catalog);
            let fingerprint = state.store.fingerprint(&request.text);
            let voice = request.voice.clone();
            let version = e.duplicate_version();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = catalog.record_hit(&fingerprint, &voice, version) {
                    warn!(error = %e, "failed to record duplicate-resolved hit");
                }
            });
        }
        Err(StoreError::Catalog(e)) => {
            error!(error = %e, "cache write failed");
            return Err(ProxyError::Catalog(e));
        }
        Err(StoreError::Io(e)) => {
            error!(error = %e, "artifact write failed");
            return Err(ProxyError::Io(e));
        }
    }
    Ok(())
}

/// Spawn background synthesis of an additional rendition when the key is
/// below `variety_depth` and no task for it is already in flight.
fn schedule_variety(state: &Arc<ServerState>, request: &SpeechRequest) {
    let depth = state.settings.cache.variety_depth;
    if depth <= 1 {
        return;
    }
    if request.text.len() > state.settings.cache.eviction.max_text_length {
        return;
    }

    let fingerprint = state.store.fingerprint(&request.text);
    if fingerprint.is_empty() {
        return;
    }

    let count = match state.catalog.get_version_count(&fingerprint, &request.voice) {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "variety version count failed");
            return;
        }
    };
    if count >= depth as i64 {
        return;
    }

    let key = (fingerprint, request.voice.clone());
    {
        let mut in_flight = state.variety_in_flight.lock().expect("variety lock");
        // Insert-if-absent is the single-flight gate.
        if !in_flight.insert(key.clone()) {
            return;
        }
    }

    let state = Arc::clone(state);
    let request = request.clone();
    tokio::spawn(async move {
        let result = state
            .gateway
            .synthesize(&request.text, &request.voice, &request.model, AudioFormat::Mp3)
            .await;

        match result {
            Ok(audio) => {
                let store = Arc::clone(&state.store);
                let variety_request = request.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    store.store(&StoreRequest {
                        text: &variety_request.text,
                        voice: &variety_request.voice,
                        model: &variety_request.model,
                        audio: &audio,
                        format: AudioFormat::Mp3,
                        version: None,
                        is_filler: false,
                    })
                })
                .await;
                match outcome {
                    Ok(Ok(stored)) => {
                        info!(voice = request.voice.as_str(), version = stored.version, "stored variety rendition")
                    }
                    // Another writer landed this version first.
                    Ok(Err(e)) if e.is_duplicate() => debug!("variety rendition already stored"),
                    Ok(Err(e)) => warn!(error = %e, "variety store failed"),
                    Err(e) => warn!(error = %e, "variety store task failed"),
                }
            }
            Err(e) => warn!(error = %e, "variety synthesis failed"),
        }

        state.variety_in_flight.lock().expect("variety lock").remove(&key);
    });
}
