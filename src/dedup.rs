use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::Fingerprint;
use crate::error::EngineResult;
use crate::models::ResponsePayload;

type InFlightFuture = BoxFuture<'static, EngineResult<ResponsePayload>>;

struct InFlightEntry {
    generation: u64,
    // Weak, so the registry never keeps an abandoned request alive
    handle: WeakShared<InFlightFuture>,
}

type Registry = DashMap<Fingerprint, InFlightEntry>;

/// Removes the registry entry when the shared future settles or is dropped.
struct RegistryGuard {
    registry: Arc<Registry>,
    fingerprint: Fingerprint,
    generation: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .remove_if(&self.fingerprint, |_, entry| entry.generation == generation);
    }
}

/// Collapses concurrent identical requests into one shared in-flight future.
#[derive(Default)]
pub struct RequestDeduplicator {
    in_flight: Arc<Registry>,
    next_generation: AtomicU64,
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight request for `fingerprint`, or starts one with
    /// `factory`. The factory is not invoked when a request is already running.
    pub async fn dedupe<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        factory: F,
    ) -> EngineResult<ResponsePayload>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<ResponsePayload>> + Send + 'static,
    {
        self.join_or_start(fingerprint, factory).await
    }

    // Lookup and registration happen under one shard lock, so two racing
    // callers cannot both start a request.
    fn join_or_start<F, Fut>(&self, fingerprint: &Fingerprint, factory: F) -> Shared<InFlightFuture>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<ResponsePayload>> + Send + 'static,
    {
        match self.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(shared) = occupied.get().handle.upgrade() {
                    log::debug!("Joining in-flight request {}", fingerprint);
                    return shared;
                }
                // dropped request whose guard has not run yet
                let (entry, shared) = self.start(fingerprint, factory);
                if let Some(entry) = entry {
                    occupied.insert(entry);
                }
                shared
            }
            Entry::Vacant(vacant) => {
                let (entry, shared) = self.start(fingerprint, factory);
                if let Some(entry) = entry {
                    vacant.insert(entry);
                }
                shared
            }
        }
    }

    fn start<F, Fut>(&self, fingerprint: &Fingerprint, factory: F) -> (Option<InFlightEntry>, Shared<InFlightFuture>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<ResponsePayload>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = RegistryGuard {
            registry: Arc::clone(&self.in_flight),
            fingerprint: fingerprint.clone(),
            generation,
        };
        let request = factory();
        let shared = async move {
            let _guard = guard;
            request.await
        }
        .boxed()
        .shared();

        log::debug!("Started request {}", fingerprint);
        let entry = shared
            .downgrade()
            .map(|handle| InFlightEntry { generation, handle });
        (entry, shared)
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.in_flight.contains_key(fingerprint)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
