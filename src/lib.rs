//! speechcache: a caching proxy in front of text-to-speech providers.
//!
//! Clients submit `(text, voice, model, response_format)` requests and get
//! audio bytes back. The proxy serves previously synthesized audio whenever a
//! suitable cached artifact exists, otherwise it walks an ordered provider
//! fallback chain, transcodes the result if needed, and persists the artifact
//! for later reuse.
//!
//! # Architecture
//!
//! The crate is built from independent layers composed by the request
//! pipeline:
//! - **Normalizer**: turns raw text into a cache-equivalence fingerprint
//! - **HotIndex**: in-memory exact + fuzzy lookup over voice buckets
//! - **Catalog**: durable SQLite metadata over the artifact directory
//! - **Store**: writes artifacts and keeps index and catalog in lockstep
//! - **Gateway**: provider clients behind a circuit-breaking fallback chain
//! - **Pipeline**: the hit/miss/variety flow served over HTTP by `server`

pub mod cache;
pub mod config;
pub mod error;
pub mod fillers;
pub mod format;
pub mod gateway;
pub mod pipeline;
pub mod server;
pub mod transcode;

pub use config::Settings;
pub use error::{ProxyError, Result};
pub use format::AudioFormat;
pub use pipeline::ServerState;
