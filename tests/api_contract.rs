//! HTTP surface contract tests over a bound listener.

use std::sync::Arc;
use std::time::Duration;

use speechcache::Settings;
use speechcache::pipeline::ServerState;
use speechcache::server::{build_state, router};
use wiremock::matchers::{method, path as url_path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestServer {
    base_url: String,
    state: Arc<ServerState>,
    _dir: tempfile::TempDir,
    _task: tokio::task::JoinHandle<()>,
}

async fn spawn_server(provider_url: &str) -> TestServer {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let settings = Settings::from_toml_str(&format!(
        r#"
        [cache]
        audio_dir = "{audio}"
        db_path = "{db}"

        [providers]
        default = "acme"

        [providers.acme]
        model = "tts-1"
        base_url = "{provider_url}"
        api_key = "sk-test"
        default_voice = "Decent_Boy"
        timeout = 5
        "#,
        audio = dir.path().join("audio").display(),
        db = dir.path().join("cache.db").display(),
    ))
    .expect("settings");

    let state = build_state(settings).expect("state");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = router(Arc::clone(&state));
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        state,
        _dir: dir,
        _task: task,
    }
}

async fn spawn_with_audio(audio: &'static [u8]) -> (MockServer, TestServer) {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.to_vec()))
        .mount(&provider)
        .await;
    let server = spawn_server(&provider.uri()).await;
    (provider, server)
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn health_reports_cache_and_provider_state() {
    let (_provider, server) = spawn_with_audio(b"audio").await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache_size"], 0);
    assert_eq!(body["provider_status"], "available");
    assert!(body.get("last_error_time").is_none());
}

#[tokio::test]
async fn speech_endpoint_rejects_empty_input() {
    let (_provider, server) = spawn_with_audio(b"audio").await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/audio/speech", server.base_url))
        .json(&serde_json::json!({ "input": "" }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn speech_endpoint_returns_audio_with_media_type() {
    let (_provider, server) = spawn_with_audio(b"speech-bytes").await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/audio/speech", server.base_url))
        .json(&serde_json::json!({ "input": "Merhaba", "voice": "Decent_Boy" }))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "audio/mpeg"
    );
    assert_eq!(response.bytes().await.expect("body").as_ref(), b"speech-bytes");
}

#[tokio::test]
async fn speech_endpoint_maps_provider_exhaustion_to_503() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&provider)
        .await;
    let server = spawn_server(&provider.uri()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/audio/speech", server.base_url))
        .json(&serde_json::json!({ "input": "Merhaba" }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn stats_track_hits_misses_and_voices() {
    let (_provider, server) = spawn_with_audio(b"audio").await;
    let client = reqwest::Client::new();
    let speech_url = format!("{}/v1/audio/speech", server.base_url);

    for input in ["3 kaynak buldum", "5 kaynak buldum"] {
        let response = client
            .post(&speech_url)
            .json(&serde_json::json!({ "input": input, "voice": "Decent_Boy" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
    }

    let catalog = Arc::clone(&server.state.catalog);
    wait_for(
        || catalog.get_stats().expect("stats").total_hits == 1,
        "hit accounting",
    )
    .await;

    let body: serde_json::Value = client
        .get(format!("{}/v1/cache/stats", server.base_url))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["total_entries"], 1);
    assert_eq!(body["total_hits"], 1);
    assert_eq!(body["total_misses"], 1);
    assert_eq!(body["hit_rate"], 0.5);
    assert_eq!(body["filler_count"], 0);
    assert_eq!(body["hot_cache_size"], 1);
    assert_eq!(body["per_voice"]["Decent_Boy"], 1);
    assert!(body["total_size_bytes"].as_u64().expect("size") > 0);
}

#[tokio::test]
async fn cache_clear_removes_entries_and_files() {
    let (_provider, server) = spawn_with_audio(b"audio").await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/v1/audio/speech", server.base_url))
        .json(&serde_json::json!({ "input": "Merhaba" }))
        .send()
        .await
        .expect("speech");

    let body: serde_json::Value = client
        .delete(format!("{}/v1/cache", server.base_url))
        .send()
        .await
        .expect("clear")
        .json()
        .await
        .expect("json");
    assert_eq!(body["cleared_entries"], 1);
    assert_eq!(body["removed_files"], 1);

    let stats: serde_json::Value = client
        .get(format!("{}/v1/cache/stats", server.base_url))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("json");
    assert_eq!(stats["total_entries"], 0);
    assert_eq!(stats["hot_cache_size"], 0);
}

#[tokio::test]
async fn filler_templates_generate_and_list() {
    let (_provider, server) = spawn_with_audio(b"filler-audio").await;
    let client = reqwest::Client::new();

    let before: serde_json::Value = client
        .get(format!("{}/v1/cache/fillers?voice_id=Decent_Boy", server.base_url))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("json");
    let fillers = before["fillers"].as_array().expect("array");
    assert!(!fillers.is_empty());
    assert!(fillers.iter().all(|f| f["cached"] == false));

    let generated: serde_json::Value = client
        .post(format!("{}/v1/cache/fillers/generate", server.base_url))
        .json(&serde_json::json!({ "voice_id": "Decent_Boy" }))
        .send()
        .await
        .expect("generate")
        .json()
        .await
        .expect("json");
    let results = generated["results"].as_array().expect("array");
    assert_eq!(results.len(), fillers.len());
    assert!(results.iter().all(|r| r["status"] == "generated"));

    let after: serde_json::Value = client
        .get(format!("{}/v1/cache/fillers?voice_id=Decent_Boy", server.base_url))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("json");
    assert!(
        after["fillers"]
            .as_array()
            .expect("array")
            .iter()
            .all(|f| f["cached"] == true && f["audio_path"].is_string())
    );
}

#[tokio::test]
async fn filler_files_list_and_download_with_etag() {
    let (_provider, server) = spawn_with_audio(b"audio").await;
    let client = reqwest::Client::new();

    // Pre-rendered filler files live under audio_dir/fillers/.
    let fillers_dir = server.state.store.audio_dir().join("fillers");
    std::fs::create_dir_all(&fillers_dir).expect("mkdir");
    std::fs::write(fillers_dir.join("selam.mp3"), b"selam-bytes").expect("write");
    std::fs::write(fillers_dir.join("tamam.ogg"), b"tamam-bytes").expect("write");
    std::fs::write(fillers_dir.join("notes.txt"), b"not audio").expect("write");

    let listing: serde_json::Value = client
        .get(format!("{}/v1/fillers", server.base_url))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("json");
    assert_eq!(listing["fillers"], serde_json::json!(["selam", "tamam"]));

    let response = client
        .get(format!("{}/v1/fillers/selam", server.base_url))
        .send()
        .await
        .expect("download");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[reqwest::header::CONTENT_TYPE], "audio/mpeg");
    let etag = response.headers()[reqwest::header::ETAG]
        .to_str()
        .expect("etag")
        .to_owned();
    assert_eq!(response.bytes().await.expect("body").as_ref(), b"selam-bytes");

    // Revalidation with the returned ETag short-circuits to 304.
    let revalidated = client
        .get(format!("{}/v1/fillers/selam", server.base_url))
        .header(reqwest::header::IF_NONE_MATCH, &etag)
        .send()
        .await
        .expect("revalidate");
    assert_eq!(revalidated.status(), 304);

    // The ogg variant is found under its own media type.
    let ogg = client
        .get(format!("{}/v1/fillers/tamam", server.base_url))
        .send()
        .await
        .expect("ogg");
    assert_eq!(ogg.headers()[reqwest::header::CONTENT_TYPE], "audio/ogg");

    let missing = client
        .get(format!("{}/v1/fillers/yok", server.base_url))
        .send()
        .await
        .expect("missing");
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn integrity_pass_preserves_filler_directory() {
    // Seed a directory layout, then boot a server over it and check what
    // reconciliation kept.
    let dir = tempfile::TempDir::new().expect("temp dir");
    let audio_dir = dir.path().join("audio");
    let fillers_dir = audio_dir.join("fillers");
    std::fs::create_dir_all(&fillers_dir).expect("mkdir");
    std::fs::write(audio_dir.join("orphan.mp3"), b"orphan").expect("write");
    std::fs::write(audio_dir.join("readme.txt"), b"keep").expect("write");
    std::fs::write(fillers_dir.join("ack.mp3"), b"keep").expect("write");

    let provider = MockServer::start().await;
    let settings = Settings::from_toml_str(&format!(
        r#"
        [cache]
        audio_dir = "{audio}"
        db_path = "{db}"

        [providers.acme]
        base_url = "{url}"
        api_key = "sk-test"
        "#,
        audio = audio_dir.display(),
        db = dir.path().join("cache.db").display(),
        url = provider.uri(),
    ))
    .expect("settings");
    let _state = build_state(settings).expect("state");

    assert!(!audio_dir.join("orphan.mp3").exists());
    assert!(audio_dir.join("readme.txt").exists());
    assert!(fillers_dir.join("ack.mp3").exists());
}
