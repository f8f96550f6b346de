//! HTTP surface and startup/shutdown for the caching proxy.
//!
//! Exposes an OpenAI-compatible speech endpoint plus cache observability and
//! filler management routes. All handlers receive the explicitly-constructed
//! [`ServerState`]; nothing lives in process globals.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cache::catalog::Catalog;
use crate::cache::evictor::Evictor;
use crate::cache::hot::HotIndex;
use crate::cache::integrity;
use crate::cache::store::CacheStore;
use crate::config::Settings;
use crate::error::{ProxyError, Result};
use crate::fillers::{FillerEntry, FillerManager, FillerOutcome};
use crate::format::AudioFormat;
use crate::gateway::router::EDGE_PROVIDER_NAME;
use crate::gateway::{
    CircuitBreakerConfig, EdgeProvider, FallbackOrchestrator, GatewayError, ProviderStatus,
    SpeechRouter, TtsProvider,
};
use crate::pipeline::{self, ServerState, SpeechRequest};
use crate::transcode::Transcoder;

/// Budget for best-effort filler generation during startup.
const FILLER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /v1/audio/speech`.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechBody {
    /// Text to synthesize.
    pub input: String,
    /// Voice identifier; namespace owned by the caller.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Generic model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// Desired audio format.
    #[serde(default)]
    pub response_format: AudioFormat,
}

fn default_voice() -> String {
    "Decent_Boy".to_owned()
}

fn default_model() -> String {
    "tts-1".to_owned()
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cache_size: usize,
    pub provider_status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Body of `GET /v1/cache/stats`.
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate: f64,
    pub cache_age_seconds: u64,
    pub filler_count: u64,
    pub per_voice: HashMap<String, u64>,
    pub hot_cache_size: usize,
}

/// Body of `DELETE /v1/cache`.
#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub cleared_entries: usize,
    pub removed_files: usize,
}

#[derive(Debug, Deserialize)]
pub struct FillerQuery {
    #[serde(default = "default_voice")]
    pub voice_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateFillersBody {
    #[serde(default = "default_voice")]
    pub voice_id: String,
}

#[derive(Debug, Serialize)]
pub struct FillerListResponse {
    pub fillers: Vec<FillerEntry>,
}

#[derive(Debug, Serialize)]
pub struct FillerGenerateResponse {
    pub results: Vec<FillerOutcome>,
}

#[derive(Debug, Serialize)]
pub struct FillerNamesResponse {
    pub fillers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Handler-side wrapper mapping pipeline errors to HTTP statuses.
#[derive(Debug)]
pub struct ApiError(ProxyError);

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            ProxyError::EmptyInput => StatusCode::BAD_REQUEST.into_response(),
            ProxyError::Gateway(GatewayError::Exhausted { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
            }
            ProxyError::Gateway(e) => {
                let status = e
                    .status()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                (status, self.0.to_string()).into_response()
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Construct the full server state: catalog, hot index, integrity pass,
/// provider chain, fillers, evictor.
///
/// A catalog failure here is fatal: the proxy refuses to serve without its
/// source of truth.
pub fn build_state(settings: Settings) -> Result<Arc<ServerState>> {
    let cache = &settings.cache;
    let catalog = Arc::new(Catalog::open(&cache.db_path)?);

    let hot = Arc::new(HotIndex::new(cache.variety_depth));
    let entries = catalog.get_all_entries()?;
    let loaded = entries.len();
    hot.load(
        entries
            .into_iter()
            .map(|e| (e.text_normalized, e.voice_id, e.audio_path)),
    );
    info!(entries = loaded, "loaded catalog entries into hot index");

    integrity::reconcile(&catalog, &hot, &cache.audio_dir)?;

    let store = Arc::new(CacheStore::new(
        &cache.audio_dir,
        Arc::clone(&hot),
        Arc::clone(&catalog),
        cache.variety_depth,
        cache.fuzzy.clone(),
        cache.normalize.clone(),
    )?);

    let mut chain: Vec<Arc<dyn TtsProvider>> =
        vec![Arc::new(SpeechRouter::from_settings(&settings))];
    if settings
        .providers
        .fallback_chain
        .iter()
        .any(|name| name == EDGE_PROVIDER_NAME)
    {
        chain.push(Arc::new(EdgeProvider::from_config(
            settings.provider(EDGE_PROVIDER_NAME),
        )));
    }
    let names: Vec<&str> = chain.iter().map(|p| p.name()).collect();
    info!(chain = ?names, "fallback orchestrator initialized");
    let gateway = Arc::new(FallbackOrchestrator::new(
        chain,
        CircuitBreakerConfig::default(),
    ));

    let fillers = Arc::new(FillerManager::new(
        Arc::clone(&catalog),
        Arc::clone(&store),
        Arc::clone(&gateway),
        settings.fillers.templates.clone(),
    ));

    let evictor = Arc::new(Evictor::new(
        Arc::clone(&catalog),
        Some(Arc::clone(&hot)),
        cache.eviction.max_entries,
        cache.eviction.min_age_days,
    ));

    let transcoder = Transcoder::detect();

    Ok(Arc::new(ServerState::new(
        settings, catalog, store, gateway, fillers, evictor, transcoder,
    )))
}

/// Build the HTTP router over a constructed state.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache", delete(cache_clear))
        .route("/v1/cache/fillers", get(cache_fillers))
        .route("/v1/cache/fillers/generate", post(generate_fillers))
        .route("/v1/fillers", get(list_filler_files))
        .route("/v1/fillers/{name}", get(filler_audio))
        .with_state(state)
}

/// Build state, run startup side tasks, bind, and serve until shutdown.
pub async fn run(settings: Settings) -> Result<()> {
    let bind_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let state = build_state(settings)?;

    // Best-effort filler pool warmup.
    let fillers_cfg = &state.settings.fillers;
    if fillers_cfg.auto_generate_on_startup && !fillers_cfg.voice_id.is_empty() {
        let voice_id = fillers_cfg.voice_id.clone();
        info!(voice = voice_id.as_str(), "auto-generating fillers");
        match tokio::time::timeout(FILLER_STARTUP_TIMEOUT, state.fillers.generate(&voice_id)).await
        {
            Ok(results) => {
                let generated = results
                    .iter()
                    .filter(|r| matches!(r.status, crate::fillers::FillerStatus::Generated))
                    .count();
                info!(generated, total = results.len(), "filler generation finished");
            }
            Err(_) => warn!(
                "filler auto-generation timed out after {}s, continuing startup",
                FILLER_STARTUP_TIMEOUT.as_secs()
            ),
        }
    }

    let _eviction_task = spawn_periodic_eviction(&state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = bind_addr.as_str(), "speechcache listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Background task: run the evictor every `cleanup_interval_hours`.
pub fn spawn_periodic_eviction(state: &Arc<ServerState>) -> tokio::task::JoinHandle<()> {
    let evictor = Arc::clone(&state.evictor);
    let hours = state.settings.cache.eviction.cleanup_interval_hours.max(1);
    let period = Duration::from_secs(hours * 3600);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The immediate first tick would duplicate the startup integrity work.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evictor = Arc::clone(&evictor);
            let outcome = tokio::task::spawn_blocking(move || evictor.run()).await;
            match outcome {
                Ok(Ok(removed)) if removed > 0 => info!(removed, "periodic eviction"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "periodic eviction failed"),
                Err(e) => error!(error = %e, "periodic eviction task failed"),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cache_size: state.store.size(),
        provider_status: state.gateway.provider_status(),
        last_error_time: state.gateway.last_error_time(),
    })
}

async fn audio_speech(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SpeechBody>,
) -> std::result::Result<Response, ApiError> {
    let audio = pipeline::synthesize_speech(
        &state,
        SpeechRequest {
            text: body.input,
            voice: body.voice,
            model: body.model,
            format: body.response_format,
        },
    )
    .await?;

    Ok((
        [(header::CONTENT_TYPE, audio.format.media_type())],
        audio.bytes,
    )
        .into_response())
}

async fn cache_stats(
    State(state): State<Arc<ServerState>>,
) -> std::result::Result<Json<CacheStatsResponse>, ApiError> {
    let stats = state.catalog.get_stats().map_err(ProxyError::from)?;
    Ok(Json(CacheStatsResponse {
        hit_rate: stats.hit_rate(),
        total_entries: stats.total_entries,
        total_size_bytes: stats.total_size_bytes,
        total_hits: stats.total_hits,
        total_misses: stats.total_misses,
        cache_age_seconds: stats.cache_age_seconds,
        filler_count: stats.filler_count,
        per_voice: stats.per_voice,
        hot_cache_size: state.store.size(),
    }))
}

async fn cache_clear(
    State(state): State<Arc<ServerState>>,
) -> std::result::Result<Json<CacheClearResponse>, ApiError> {
    let paths = state.catalog.delete_all().map_err(ProxyError::from)?;
    state.store.clear();

    let mut removed_files = 0;
    for path in &paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed_files += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to unlink cleared artifact"),
        }
    }

    info!(cleared = paths.len(), removed_files, "cache cleared");
    Ok(Json(CacheClearResponse {
        cleared_entries: paths.len(),
        removed_files,
    }))
}

async fn cache_fillers(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<FillerQuery>,
) -> Json<FillerListResponse> {
    Json(FillerListResponse {
        fillers: state.fillers.list(&query.voice_id),
    })
}

async fn generate_fillers(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<GenerateFillersBody>,
) -> Json<FillerGenerateResponse> {
    Json(FillerGenerateResponse {
        results: state.fillers.generate(&body.voice_id).await,
    })
}

/// Directory listing of pre-rendered filler audio under
/// `audio_dir/fillers/`, by stem, sorted.
async fn list_filler_files(State(state): State<Arc<ServerState>>) -> Json<FillerNamesResponse> {
    let dir = state.store.audio_dir().join(integrity::FILLERS_DIR);
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_audio = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("mp3") | Some("ogg")
            );
            if !is_audio {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_owned());
            }
        }
    }
    names.sort();
    Json(FillerNamesResponse { fillers: names })
}

/// Serve one filler file with mtime/size ETag revalidation.
async fn filler_audio(
    State(state): State<Arc<ServerState>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    headers: HeaderMap,
) -> Response {
    if name.contains('/') || name.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let dir = state.store.audio_dir().join(integrity::FILLERS_DIR);
    let Some((path, media_type)) = [("mp3", "audio/mpeg"), ("ogg", "audio/ogg")]
        .iter()
        .map(|(ext, mime)| (dir.join(format!("{name}.{ext}")), *mime))
        .find(|(candidate, _)| candidate.exists())
    else {
        return (StatusCode::NOT_FOUND, format!("filler '{name}' not found")).into_response();
    };

    let Ok(etag) = file_etag(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let revalidated = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidate| candidate.trim_matches('"') == etag);
    if revalidated {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, media_type.to_owned()),
                (header::ETAG, format!("\"{etag}\"")),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// First 16 hex of MD5 over `mtime:size`.
fn file_etag(path: &Path) -> std::io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let digest = md5::compute(format!("{mtime}:{}", metadata.len()).as_bytes());
    let hex = format!("{digest:x}");
    Ok(hex[..16].to_owned())
}
