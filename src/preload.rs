use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::normalize_query;
use crate::config::PreloadConfig;
use crate::engine::{lock, StreamingEngine};
use crate::models::{ChatRequest, ResponsePayload, UserContext, UserProfile};

/// Admissions left untouched for foreground requests.
const FOREGROUND_RESERVE: u32 = 5;

/// High-frequency questions fetched on first activation.
pub const COMMON_QUERIES: [&str; 15] = [
    "What skills should I learn for AI engineering?",
    "How do I prepare for a job interview?",
    "How can I improve my resume?",
    "What career paths fit my background?",
    "How do I negotiate a higher salary?",
    "What does a product manager do?",
    "How do I build a professional network?",
    "What are the most in-demand tech skills?",
    "How do I switch careers into tech?",
    "How should I write a cover letter?",
    "What certifications are worth getting?",
    "How do I ask for a promotion?",
    "What is a good answer to tell me about yourself?",
    "How do I find a mentor?",
    "How do I stay productive working remotely?",
];

struct PredictionRule {
    triggers: &'static [&'static str],
    follow_ups: &'static [&'static str],
}

const PREDICTION_RULES: &[PredictionRule] = &[
    PredictionRule {
        triggers: &["skill", "learn"],
        follow_ups: &[
            "What are the best resources to learn these skills?",
            "How long does it take to learn these skills?",
            "Which of these skills are most in demand?",
        ],
    },
    PredictionRule {
        triggers: &["interview", "job"],
        follow_ups: &[
            "What are common interview questions for this role?",
            "How should I prepare for a technical interview?",
            "What questions should I ask the interviewer?",
        ],
    },
    PredictionRule {
        triggers: &["resume", "cv"],
        follow_ups: &[
            "How can I make my resume stand out?",
            "What should I put in my resume summary?",
            "How long should my resume be?",
        ],
    },
    PredictionRule {
        triggers: &["career", "switch", "transition"],
        follow_ups: &[
            "How do I switch careers without direct experience?",
            "How do I build a portfolio for a career change?",
            "Which transferable skills should I highlight?",
        ],
    },
    PredictionRule {
        triggers: &["salary", "negotiat", "offer"],
        follow_ups: &[
            "What is a fair salary for my role?",
            "Should I accept the first offer?",
            "How do I negotiate benefits besides salary?",
        ],
    },
];

/// Candidate next queries for `query`, at most `limit`, in rule order.
pub fn predict_follow_ups(query: &str, limit: usize) -> Vec<String> {
    let normalized = normalize_query(query);
    let mut candidates: Vec<String> = Vec::new();
    for rule in PREDICTION_RULES {
        if !rule.triggers.iter().any(|trigger| normalized.contains(trigger)) {
            continue;
        }
        for follow_up in rule.follow_ups {
            if candidates.len() == limit {
                return candidates;
            }
            if normalize_query(follow_up) != normalized && !candidates.iter().any(|c| c == follow_up) {
                candidates.push(follow_up.to_string());
            }
        }
    }
    candidates
}

/// What the orchestrator needs from a preloader.
#[async_trait]
pub trait Preloader: Send + Sync {
    /// A prefetched response for this query, if one is ready.
    async fn get_preloaded(&self, query: &str, profile: Option<&UserProfile>) -> Option<ResponsePayload>;

    /// Called after every resolved query with the session's updated context.
    async fn update_context(&self, query: &str, profile: Option<&UserProfile>, context: &UserContext);
}

/// Preloader that never prefetches.
pub struct NoopPreloader;

#[async_trait]
impl Preloader for NoopPreloader {
    async fn get_preloaded(&self, _query: &str, _profile: Option<&UserProfile>) -> Option<ResponsePayload> {
        None
    }

    async fn update_context(&self, _query: &str, _profile: Option<&UserProfile>, _context: &UserContext) {}
}

struct PreloadJob {
    query: String,
    profile: Option<UserProfile>,
}

struct PreloadInner {
    engine: Arc<StreamingEngine>,
    settings: PreloadConfig,
    ttl: Duration,
    queue: Mutex<VecDeque<PreloadJob>>,
    draining: AtomicBool,
    activated: AtomicBool,
}

#[derive(Clone)]
pub struct PredictivePreloader {
    inner: Arc<PreloadInner>,
}

impl PredictivePreloader {
    pub fn new(engine: Arc<StreamingEngine>) -> Self {
        let settings = engine.config().preload.clone();
        let ttl = engine.config().preload_cache_ttl();
        Self {
            inner: Arc::new(PreloadInner {
                engine,
                settings,
                ttl,
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                activated: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the one-time warm-up of `COMMON_QUERIES` for `profile`.
    /// Returns `None` if the preloader was already activated.
    pub fn activate(&self, profile: Option<UserProfile>) -> Option<JoinHandle<()>> {
        if self.inner.activated.swap(true, Ordering::SeqCst) {
            return None;
        }
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            log::info!("Warming cache with {} common queries", COMMON_QUERIES.len());
            let throttle = Duration::from_millis(inner.settings.warmup_throttle);
            for (i, query) in COMMON_QUERIES.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(throttle).await;
                }
                inner.prefetch(query, profile.as_ref()).await;
            }
            log::info!("Cache warm-up finished");
        }))
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    fn enqueue(&self, candidates: Vec<String>, profile: Option<&UserProfile>) {
        let engine = &self.inner.engine;
        let mut queue = lock(&self.inner.queue);
        for candidate in candidates {
            let key = engine.fingerprint(&candidate, profile);
            if engine.cache().contains(&key) || engine.is_in_flight(&key) {
                continue;
            }
            if queue.iter().any(|job| job.query == candidate) {
                continue;
            }
            log::debug!("Queued preload: {}", candidate);
            queue.push_back(PreloadJob { query: candidate, profile: profile.cloned() });
        }
    }

    fn schedule_drain(&self) {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drain().await });
    }
}

impl PreloadInner {
    async fn drain(&self) {
        let gap = Duration::from_millis(self.settings.queue_gap);
        loop {
            let next = lock(&self.queue).pop_front();
            let Some(job) = next else {
                self.draining.store(false, Ordering::SeqCst);
                // work may have been queued after the pop; take it unless another drain did
                if lock(&self.queue).is_empty() || self.draining.swap(true, Ordering::SeqCst) {
                    break;
                }
                continue;
            };
            self.prefetch(&job.query, job.profile.as_ref()).await;
            tokio::time::sleep(gap).await;
        }
    }

    async fn prefetch(&self, query: &str, profile: Option<&UserProfile>) {
        let key = self.engine.fingerprint(query, profile);
        if self.engine.cache().contains(&key) {
            log::debug!("Preload skipped, already cached: {}", query);
            return;
        }
        if self.engine.remaining_admissions() <= FOREGROUND_RESERVE {
            log::debug!("Preload skipped, keeping rate budget for foreground: {}", query);
            return;
        }
        let request = ChatRequest::new(query, profile).preload();
        match self.engine.fetch(request, self.ttl, None).await {
            Ok(_) => log::debug!("Preloaded: {}", query),
            Err(e) => log::warn!("Preload failed for '{}': {}", query, e),
        }
    }
}

#[async_trait]
impl Preloader for PredictivePreloader {
    async fn get_preloaded(&self, query: &str, profile: Option<&UserProfile>) -> Option<ResponsePayload> {
        if !self.inner.settings.enabled {
            return None;
        }
        let engine = &self.inner.engine;
        let key = engine.fingerprint(query, profile);
        // only a present entry counts towards cache statistics here
        if !engine.cache().contains(&key) {
            return None;
        }
        engine.cached(&key)
    }

    async fn update_context(&self, query: &str, profile: Option<&UserProfile>, context: &UserContext) {
        log::debug!(
            "Updating predictions after query #{} ({:?} session)",
            context.query_count,
            context.interaction_pattern
        );

        if !self.inner.settings.enabled {
            return;
        }
        let candidates = predict_follow_ups(query, self.inner.settings.max_candidates);
        if candidates.is_empty() {
            return;
        }
        self.enqueue(candidates, profile);
        if self.queued() > 0 {
            self.schedule_drain();
        }
    }
}
