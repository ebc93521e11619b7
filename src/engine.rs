use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::ChatTransport;
use crate::cache::{Fingerprint, ResponseCache};
use crate::config::EngineConfig;
use crate::decoder::{decode_response, UpdateSink};
use crate::dedup::RequestDeduplicator;
use crate::error::EngineResult;
use crate::metrics::{PerformanceSummary, PerformanceTracker};
use crate::models::{ChatRequest, PerformanceSample, ResponsePayload, UserProfile};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, RetryingTransport};

/// Shared delivery state: one cache, one in-flight registry and one set of
/// metrics per engine. Sessions and the preloader hold it through an `Arc`.
pub struct StreamingEngine {
    config: EngineConfig,
    cache: Arc<ResponseCache>,
    dedup: RequestDeduplicator,
    transport: RetryingTransport,
    metrics: Mutex<PerformanceTracker>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let transport = RetryingTransport::new(transport, limiter, RetryPolicy::from_config(&config));
        Self {
            cache: Arc::new(ResponseCache::new(config.max_cache_entries)),
            dedup: RequestDeduplicator::new(),
            transport,
            metrics: Mutex::new(PerformanceTracker::new()),
            sweeper: Mutex::new(None),
            config,
        }
    }

    /// Builds the engine and starts the periodic cache sweep. Needs a tokio runtime.
    pub fn start(config: EngineConfig, transport: Arc<dyn ChatTransport>) -> Arc<Self> {
        let engine = Arc::new(Self::new(config, transport));
        let handle = engine.cache.spawn_sweeper(engine.config.cache_sweep_interval());
        *lock(&engine.sweeper) = Some(handle);
        log::info!(
            "Streaming engine started for {} (cache TTL {:?}, {} attempts)",
            engine.config.endpoint,
            engine.config.cache_ttl(),
            engine.transport.policy().attempts
        );
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn fingerprint(&self, query: &str, profile: Option<&UserProfile>) -> Fingerprint {
        Fingerprint::new(query, profile)
    }

    pub fn cached(&self, fingerprint: &Fingerprint) -> Option<ResponsePayload> {
        self.cache.get(fingerprint)
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.dedup.is_in_flight(fingerprint)
    }

    /// Requests the rate limiter would still admit in the current window.
    pub fn remaining_admissions(&self) -> u32 {
        self.transport.remaining_admissions()
    }

    /// Fetches a response through dedup, rate limiting, retries and decoding,
    /// then caches it for `ttl`.
    ///
    /// When an identical request is already running, this call joins it and
    /// `updates` receives nothing; only the request's originator streams.
    pub async fn fetch(
        self: &Arc<Self>,
        request: ChatRequest,
        ttl: Duration,
        updates: Option<UpdateSink>,
    ) -> EngineResult<ResponsePayload> {
        let fingerprint = self.fingerprint(&request.message, request.user_profile.as_ref());
        let engine = Arc::clone(self);
        let key = fingerprint.clone();

        self.dedup
            .dedupe(&fingerprint, move || async move {
                let body = engine.transport.send(&request).await?;
                let idle_timeout = engine.transport.policy().timeout;
                let payload = decode_response(body, idle_timeout, updates.as_ref()).await?;
                engine.cache.put(key, payload.clone(), ttl);
                Ok(payload)
            })
            .await
    }

    pub fn record(&self, sample: PerformanceSample) {
        lock(&self.metrics).record(sample);
    }

    pub fn performance(&self) -> PerformanceSummary {
        lock(&self.metrics).summary()
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

// A poisoned lock only means a panic elsewhere; the data is still usable
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
