//! speechcache server binary.
//!
//! Loads `speechcache.toml` (or a path given as the first argument), wires
//! tracing to stderr, and serves until the process is stopped.

use speechcache::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::from_path(std::path::Path::new(&path))?,
        None => Settings::load()?,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(settings.server.log_level.clone())
            }),
        )
        .init();

    tracing::info!(port = settings.server.port, "speechcache starting");

    speechcache::server::run(settings).await.map_err(|e| {
        tracing::error!(error = %e, "speechcache exited with error");
        anyhow::anyhow!("speechcache failed: {e}")
    })
}
