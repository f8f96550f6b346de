//! Ordered provider walk with a per-provider circuit breaker.
//!
//! Each provider keeps a bounded window of recent failure timestamps. Once
//! `failure_threshold` counted failures land inside `failure_window`, the
//! circuit opens for `cooldown` and the provider is skipped. Half-open
//! semantics: after the cooldown passes one request is let through; a
//! success clears all failure bookkeeping, a failure reopens the circuit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::format::AudioFormat;
use crate::gateway::GatewayError;
use crate::gateway::provider::TtsProvider;

/// Monotonic clock expressed as seconds; injectable for tests.
pub type NowFn = Box<dyn Fn() -> f64 + Send + Sync>;

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Counted failures inside the window that open the circuit.
    pub failure_threshold: usize,
    /// Sliding window over failure timestamps.
    pub failure_window: Duration,
    /// How long an open circuit skips its provider.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Per-provider transient circuit state.
#[derive(Debug, Default)]
struct CircuitState {
    /// Monotonic timestamps of recent counted failures.
    failures: VecDeque<f64>,
    /// Deadline until which the provider is skipped; 0 when closed.
    open_until: f64,
}

/// Health summary reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Available,
    Unavailable,
    Unknown,
}

/// Walks an ordered provider chain, skipping providers whose circuit is
/// open, until one synthesizes the request.
pub struct FallbackOrchestrator {
    chain: Vec<Arc<dyn TtsProvider>>,
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, CircuitState>>,
    last_error_time: Mutex<Option<DateTime<Utc>>>,
    now_fn: NowFn,
}

impl std::fmt::Debug for FallbackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.chain.iter().map(|p| p.name()).collect();
        f.debug_struct("FallbackOrchestrator")
            .field("chain", &names)
            .finish_non_exhaustive()
    }
}

impl FallbackOrchestrator {
    /// Create an orchestrator over an ordered provider chain.
    pub fn new(chain: Vec<Arc<dyn TtsProvider>>, config: CircuitBreakerConfig) -> Self {
        let start = Instant::now();
        Self::with_clock(chain, config, Box::new(move || start.elapsed().as_secs_f64()))
    }

    /// Same, with an injected monotonic clock (tests).
    pub fn with_clock(
        chain: Vec<Arc<dyn TtsProvider>>,
        config: CircuitBreakerConfig,
        now_fn: NowFn,
    ) -> Self {
        Self {
            chain,
            config,
            circuits: Mutex::new(HashMap::new()),
            last_error_time: Mutex::new(None),
            now_fn,
        }
    }

    /// Synthesize through the chain.
    ///
    /// Providers whose circuit is open are skipped. A terminal failure
    /// aborts the walk; transient failures are recorded and the walk
    /// continues. Exhaustion maps to HTTP 503 at the edge.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        model: &str,
        format: AudioFormat,
    ) -> Result<Bytes, GatewayError> {
        let mut errors = Vec::new();

        for provider in &self.chain {
            let name = provider.name();
            if self.is_circuit_open(name) {
                info!(provider = name, "skipping provider: circuit open");
                continue;
            }

            info!(provider = name, "trying provider");
            match provider.synthesize(text, voice, model, format).await {
                Ok(audio) => {
                    self.clear_failures(name);
                    info!(provider = name, "provider succeeded");
                    return Ok(audio);
                }
                Err(e) => {
                    warn!(provider = name, status = ?e.status(), error = %e, "provider failed");
                    errors.push(format!("{name}: {e}"));
                    *self.last_error_time.lock().expect("last error lock") = Some(Utc::now());

                    if e.counts_as_failure() {
                        self.record_failure(name);
                    }
                    if !e.should_fallback() {
                        return Err(GatewayError::Terminal(e));
                    }
                }
            }
        }

        Err(GatewayError::Exhausted { errors })
    }

    /// Chain-wide availability summary.
    pub fn provider_status(&self) -> ProviderStatus {
        if self.chain.is_empty() {
            return ProviderStatus::Unknown;
        }
        let all_open = self.chain.iter().all(|p| self.is_circuit_open(p.name()));
        if all_open {
            ProviderStatus::Unavailable
        } else {
            ProviderStatus::Available
        }
    }

    /// Wall-clock time of the most recent provider failure.
    pub fn last_error_time(&self) -> Option<DateTime<Utc>> {
        *self.last_error_time.lock().expect("last error lock")
    }

    fn record_failure(&self, provider: &str) {
        let now = (self.now_fn)();
        let mut circuits = self.circuits.lock().expect("circuit lock");
        let state = circuits.entry(provider.to_owned()).or_default();
        prune_failures(state, now, self.config.failure_window);
        state.failures.push_back(now);
        if state.failures.len() >= self.config.failure_threshold {
            state.open_until = now + self.config.cooldown.as_secs_f64();
            warn!(
                provider,
                failures = state.failures.len(),
                window_secs = self.config.failure_window.as_secs(),
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    fn clear_failures(&self, provider: &str) {
        let mut circuits = self.circuits.lock().expect("circuit lock");
        if let Some(state) = circuits.get_mut(provider) {
            state.failures.clear();
            state.open_until = 0.0;
        }
    }

    fn is_circuit_open(&self, provider: &str) -> bool {
        let now = (self.now_fn)();
        let mut circuits = self.circuits.lock().expect("circuit lock");
        let state = circuits.entry(provider.to_owned()).or_default();
        prune_failures(state, now, self.config.failure_window);
        if state.open_until > now {
            return true;
        }
        if state.open_until != 0.0 {
            // Cooldown passed: half-open, let the next request probe.
            state.open_until = 0.0;
        }
        false
    }
}

fn prune_failures(state: &mut CircuitState, now: f64, window: Duration) {
    let cutoff = now - window.as_secs_f64();
    while state.failures.front().is_some_and(|t| *t < cutoff) {
        state.failures.pop_front();
    }
}
