use futures::future::{AbortHandle, Abortable};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::decoder::StreamUpdate;
use crate::engine::{lock, StreamingEngine};
use crate::error::{EngineError, EngineResult};
use crate::metrics::PerformanceSummary;
use crate::models::{
    ChatRequest, ConnectionStatus, HistoryEntry, Message, PerformanceSample, ResponsePayload, Role,
    StreamingState, UserContext, UserProfile,
};
use crate::preload::Preloader;

pub const FALLBACK_MESSAGE: &str =
    "I'm having trouble connecting right now. Please try again in a moment.";

/// Change notifications for the UI, in the order they happen.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    MessageAppended {
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    MessageChunk {
        message_id: Uuid,
        delta: String,
        is_first_chunk: bool,
    },
    /// Suggestions or action items changed on a streaming message.
    MessageUpdated {
        message: Message,
    },
    MessageFinished {
        message: Message,
    },
    #[serde(rename_all = "camelCase")]
    MessageRemoved {
        message_id: Uuid,
    },
    StatusChanged {
        state: StreamingState,
    },
}

pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty input, or another send was still in flight.
    Ignored,
    CacheHit,
    Streamed,
    /// Replaced by the fallback message; see `StreamingState::error`.
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub state: StreamingState,
}

#[derive(Default)]
struct SessionInner {
    messages: Vec<Message>,
    state: StreamingState,
    last_input: Option<(String, Option<UserProfile>)>,
    abort: Option<AbortHandle>,
    context: UserContext,
}

impl SessionInner {
    fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn remove_message(&mut self, id: Uuid) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| message.id != id);
        self.messages.len() != before
    }

    // False once clear_messages (or a newer send) took the session over
    fn owns(&self, id: Uuid) -> bool {
        self.state.current_message == Some(id)
    }

    // Records a resolved query; the classification is published through the state
    fn record_query(&mut self, query: &str) -> UserContext {
        self.context.record(query);
        self.state.interaction_pattern = self.context.interaction_pattern;
        self.context.clone()
    }
}

/// One conversation: accepts user queries, serves them from cache or the
/// network, and keeps the observable message list and status up to date.
/// Cheap to clone; clones share the same conversation.
#[derive(Clone)]
pub struct ChatSession {
    engine: Arc<StreamingEngine>,
    preloader: Arc<dyn Preloader>,
    inner: Arc<Mutex<SessionInner>>,
    events: Option<EventSink>,
}

impl ChatSession {
    pub fn new(engine: Arc<StreamingEngine>, preloader: Arc<dyn Preloader>) -> Self {
        Self {
            engine,
            preloader,
            inner: Arc::new(Mutex::new(SessionInner::default())),
            events: None,
        }
    }

    pub fn with_event_sink(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot { messages: inner.messages.clone(), state: inner.state.clone() }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn state(&self) -> StreamingState {
        self.lock().state.clone()
    }

    pub fn performance(&self) -> PerformanceSummary {
        self.engine.performance()
    }

    /// Sends one user query. Never fails: errors end up in the fallback message
    /// and `StreamingState::error`.
    pub async fn send_message(&self, text: &str, profile: Option<&UserProfile>) -> SendOutcome {
        let query = text.trim();
        if query.is_empty() {
            log::debug!("Ignoring empty message");
            return SendOutcome::Ignored;
        }

        let started = Instant::now();
        let history = {
            let mut inner = self.lock();
            if inner.state.is_streaming {
                log::warn!("Ignoring message while another request is in flight");
                return SendOutcome::Ignored;
            }
            let history = self.history(&inner.messages);
            inner.state.is_streaming = true;
            inner.state.error = None;
            inner.state.cache_hit = false;
            inner.last_input = Some((query.to_string(), profile.cloned()));
            let user_message = Message::user(query);
            inner.messages.push(user_message.clone());
            self.emit(SessionEvent::MessageAppended { message: user_message });
            self.emit_status(&inner);
            history
        };

        let fingerprint = self.engine.fingerprint(query, profile);
        let cached = match self.preloader.get_preloaded(query, profile).await {
            Some(payload) => {
                log::info!("Serving preloaded response for {}", fingerprint);
                Some(payload)
            }
            None => self.engine.cached(&fingerprint),
        };
        if let Some(payload) = cached {
            let context = self.finish_from_cache(query, &payload, started);
            self.preloader.update_context(query, profile, &context).await;
            return SendOutcome::CacheHit;
        }

        let placeholder = Message::streaming_placeholder();
        let message_id = placeholder.id;
        let (abort_handle, registration) = AbortHandle::new_pair();
        {
            let mut inner = self.lock();
            inner.messages.push(placeholder.clone());
            inner.state.current_message = Some(message_id);
            inner.state.connection_status = ConnectionStatus::Connecting;
            inner.abort = Some(abort_handle);
            self.emit(SessionEvent::MessageAppended { message: placeholder });
            self.emit_status(&inner);
        }

        let request = ChatRequest::new(query, profile).with_history(history);
        let result = self.stream_into(message_id, request, registration).await;

        match result {
            Ok(payload) => {
                if let Some(context) = self.finish_streamed(query, message_id, &payload, started) {
                    self.preloader.update_context(query, profile, &context).await;
                }
                SendOutcome::Streamed
            }
            Err(EngineError::Aborted) => {
                self.finish_cancelled(message_id);
                SendOutcome::Cancelled
            }
            Err(e) => {
                self.finish_failed(message_id, &e);
                SendOutcome::Failed
            }
        }
    }

    /// Replays the last input, dropping a trailing fallback message first.
    pub async fn retry_last_message(&self) -> SendOutcome {
        let input = {
            let mut inner = self.lock();
            if inner.state.is_streaming {
                return SendOutcome::Ignored;
            }
            let Some((query, profile)) = inner.last_input.clone() else {
                log::debug!("Nothing to retry");
                return SendOutcome::Ignored;
            };
            if inner.messages.last().map(|m| m.is_error).unwrap_or(false) {
                if let Some(fallback) = inner.messages.pop() {
                    self.emit(SessionEvent::MessageRemoved { message_id: fallback.id });
                }
                // the replay appends the user message again
                let repeated = inner
                    .messages
                    .last()
                    .map(|m| m.role == Role::User && m.content == query)
                    .unwrap_or(false);
                if repeated {
                    if let Some(user_message) = inner.messages.pop() {
                        self.emit(SessionEvent::MessageRemoved { message_id: user_message.id });
                    }
                }
            }
            (query, profile)
        };
        log::info!("Retrying last message");
        self.send_message(&input.0, input.1.as_ref()).await
    }

    /// Aborts the in-flight send, if any.
    pub fn cancel(&self) -> bool {
        match self.lock().abort.take() {
            Some(handle) => {
                log::info!("Cancelling in-flight request");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Resets messages, status and the interaction context. The engine cache is kept.
    pub fn clear_messages(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.abort.take() {
            handle.abort();
        }
        inner.messages.clear();
        inner.state = StreamingState::default();
        inner.last_input = None;
        inner.context = UserContext::new();
        log::info!("Conversation cleared");
        self.emit_status(&inner);
    }

    async fn stream_into(
        &self,
        message_id: Uuid,
        request: ChatRequest,
        registration: futures::future::AbortRegistration,
    ) -> EngineResult<ResponsePayload> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ttl = self.engine.config().cache_ttl();
        let fetch = Abortable::new(self.engine.fetch(request, ttl, Some(tx)), registration);
        futures::pin_mut!(fetch);

        let mut first_chunk = true;
        let result = loop {
            tokio::select! {
                biased;
                Some(update) = rx.recv() => self.apply_update(message_id, update, &mut first_chunk),
                result = &mut fetch => break result,
            }
        };
        // updates sent right before completion
        while let Ok(update) = rx.try_recv() {
            self.apply_update(message_id, update, &mut first_chunk);
        }

        match result {
            Ok(result) => result,
            Err(_aborted) => Err(EngineError::Aborted),
        }
    }

    fn apply_update(&self, message_id: Uuid, update: StreamUpdate, first_chunk: &mut bool) {
        let mut inner = self.lock();
        if !inner.owns(message_id) {
            return;
        }
        if matches!(update, StreamUpdate::Started) {
            inner.state.connection_status = ConnectionStatus::Connected;
            self.emit_status(&inner);
        }
        let Some(message) = inner.message_mut(message_id) else {
            return;
        };
        match update {
            StreamUpdate::Started => {
                message.content.clear();
                message.suggestions.clear();
                message.action_items.clear();
            }
            StreamUpdate::Delta(delta) => {
                message.content.push_str(&delta);
                let event = SessionEvent::MessageChunk {
                    message_id,
                    delta,
                    is_first_chunk: *first_chunk,
                };
                *first_chunk = false;
                self.emit(event);
            }
            StreamUpdate::Suggestions(suggestions) => {
                message.suggestions = suggestions;
                let message = message.clone();
                self.emit(SessionEvent::MessageUpdated { message });
            }
            StreamUpdate::ActionItems(action_items) => {
                message.action_items = action_items;
                let message = message.clone();
                self.emit(SessionEvent::MessageUpdated { message });
            }
        }
    }

    fn finish_from_cache(&self, query: &str, payload: &ResponsePayload, started: Instant) -> UserContext {
        let sample = PerformanceSample::new(started.elapsed(), true);
        self.engine.record(sample);

        let mut inner = self.lock();
        let message = Message::assistant(payload);
        inner.messages.push(message.clone());
        let interaction_pattern = inner.state.interaction_pattern;
        inner.state = StreamingState {
            is_streaming: false,
            current_message: None,
            error: None,
            response_time_ms: Some(sample.response_time_ms),
            cache_hit: true,
            optimization_level: Some(sample.optimization_level),
            connection_status: ConnectionStatus::Connected,
            interaction_pattern,
        };
        let context = inner.record_query(query);
        self.emit(SessionEvent::MessageAppended { message });
        self.emit_status(&inner);
        context
    }

    fn finish_streamed(
        &self,
        query: &str,
        message_id: Uuid,
        payload: &ResponsePayload,
        started: Instant,
    ) -> Option<UserContext> {
        let sample = PerformanceSample::new(started.elapsed(), false);
        self.engine.record(sample);

        let mut inner = self.lock();
        if !inner.owns(message_id) {
            return None;
        }
        if let Some(message) = inner.message_mut(message_id) {
            message.finish_with(payload);
            let message = message.clone();
            self.emit(SessionEvent::MessageFinished { message });
        }
        inner.abort = None;
        let interaction_pattern = inner.state.interaction_pattern;
        inner.state = StreamingState {
            is_streaming: false,
            current_message: None,
            error: None,
            response_time_ms: Some(sample.response_time_ms),
            cache_hit: false,
            optimization_level: Some(sample.optimization_level),
            connection_status: ConnectionStatus::Connected,
            interaction_pattern,
        };
        let context = inner.record_query(query);
        self.emit_status(&inner);
        Some(context)
    }

    fn finish_cancelled(&self, message_id: Uuid) {
        let mut inner = self.lock();
        if !inner.owns(message_id) {
            return;
        }
        // partial output stays as a finished message
        let partial = inner
            .message_mut(message_id)
            .filter(|message| !message.content.is_empty())
            .map(|message| {
                message.is_streaming = false;
                message.clone()
            });
        match partial {
            Some(message) => self.emit(SessionEvent::MessageFinished { message }),
            None => {
                inner.remove_message(message_id);
                self.emit(SessionEvent::MessageRemoved { message_id });
            }
        }
        inner.abort = None;
        inner.state.is_streaming = false;
        inner.state.current_message = None;
        inner.state.connection_status = ConnectionStatus::Disconnected;
        self.emit_status(&inner);
    }

    fn finish_failed(&self, message_id: Uuid, error: &EngineError) {
        log::error!("Request failed: {}", error);
        let mut inner = self.lock();
        if !inner.owns(message_id) {
            return;
        }
        if inner.remove_message(message_id) {
            self.emit(SessionEvent::MessageRemoved { message_id });
        }
        let fallback = Message::fallback(FALLBACK_MESSAGE);
        inner.messages.push(fallback.clone());
        inner.abort = None;
        inner.state.is_streaming = false;
        inner.state.current_message = None;
        inner.state.error = Some(error.to_string());
        inner.state.connection_status = ConnectionStatus::Disconnected;
        self.emit(SessionEvent::MessageAppended { message: fallback });
        self.emit_status(&inner);
    }

    // Last messages before the new query, without fallbacks or partial output
    fn history(&self, messages: &[Message]) -> Vec<HistoryEntry> {
        let window = self.engine.config().history_window;
        let eligible: Vec<&Message> = messages
            .iter()
            .filter(|m| !m.is_error && !m.is_streaming)
            .collect();
        eligible[eligible.len().saturating_sub(window)..]
            .iter()
            .map(|m| HistoryEntry { role: m.role, content: m.content.clone() })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        lock(&self.inner)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                log::warn!("Session event receiver dropped");
            }
        }
    }

    fn emit_status(&self, inner: &SessionInner) {
        self.emit(SessionEvent::StatusChanged { state: inner.state.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::config::EngineConfig;
    use crate::models::InteractionPattern;
    use crate::preload::{NoopPreloader, PredictivePreloader, COMMON_QUERIES};
    use crate::test_support::{answer_body, sse_body, Reply, ScriptedTransport};
    use async_trait::async_trait;
    use std::time::Duration;

    const AI_QUERY: &str = "What skills should I learn for AI engineering?";

    fn engine(transport: &Arc<ScriptedTransport>) -> Arc<StreamingEngine> {
        Arc::new(StreamingEngine::new(EngineConfig::default(), transport.clone()))
    }

    fn session(transport: &Arc<ScriptedTransport>) -> ChatSession {
        ChatSession::new(engine(transport), Arc::new(NoopPreloader))
    }

    #[derive(Default)]
    struct FakePreloader {
        ready: Option<ResponsePayload>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Preloader for FakePreloader {
        async fn get_preloaded(&self, _query: &str, _profile: Option<&UserProfile>) -> Option<ResponsePayload> {
            self.ready.clone()
        }

        async fn update_context(&self, query: &str, _profile: Option<&UserProfile>, _context: &UserContext) {
            self.seen.lock().unwrap().push(query.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_query_is_served_from_cache() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Slow(
            Duration::from_millis(1500),
            answer_body(&["Learn ", "Python."]),
        )));
        let session = session(&transport);

        assert_eq!(session.send_message(AI_QUERY, None).await, SendOutcome::Streamed);
        let first = session.state();
        assert!(!first.cache_hit);
        assert_eq!(first.response_time_ms, Some(1500));

        assert_eq!(session.send_message(AI_QUERY, None).await, SendOutcome::CacheHit);
        let second = session.state();
        assert!(second.cache_hit);
        assert_eq!(second.response_time_ms, Some(0));
        assert_eq!(transport.calls(), 1);

        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "Learn Python.");
        assert_eq!(messages[3].content, "Learn Python.");
        assert!(messages.iter().all(|m| !m.is_streaming));

        let performance = session.performance();
        assert_eq!(performance.total_requests, 2);
        assert_eq!(performance.cache_hit_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn warmed_common_query_resolves_without_network() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(answer_body(&["ok"]))));
        let engine = engine(&transport);
        let preloader = PredictivePreloader::new(Arc::clone(&engine));
        preloader.activate(None);
        let session = ChatSession::new(engine, Arc::new(preloader));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let warmed = transport.calls();
        assert_eq!(warmed, COMMON_QUERIES.len());

        let outcome = session.send_message("What does a product manager do?", None).await;

        assert_eq!(outcome, SendOutcome::CacheHit);
        assert!(session.state().cache_hit);
        assert_eq!(transport.calls(), warmed);
    }

    #[tokio::test]
    async fn injected_preloader_short_circuits_the_network() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Status(500)));
        let preloader = Arc::new(FakePreloader {
            ready: Some(ResponsePayload { content: "prefetched".into(), ..Default::default() }),
            ..Default::default()
        });
        let session = ChatSession::new(engine(&transport), preloader.clone());

        assert_eq!(session.send_message("anything", None).await, SendOutcome::CacheHit);
        assert_eq!(transport.calls(), 0);
        assert_eq!(session.messages()[1].content, "prefetched");
        assert_eq!(*preloader.seen.lock().unwrap(), vec!["anything".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_content_is_emitted_in_order() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(sse_body(&[
            r#"{"type":"start"}"#,
            r#"{"type":"content","content":"A"}"#,
            r#"{"type":"suggestions","suggestions":["next?"]}"#,
            r#"{"type":"content","content":"B"}"#,
            r#"{"type":"complete","mood":"calm"}"#,
        ]))));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = session(&transport).with_event_sink(tx);

        assert_eq!(session.send_message("hello", None).await, SendOutcome::Streamed);

        let mut chunks = Vec::new();
        let mut finished = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::MessageChunk { delta, is_first_chunk, .. } => chunks.push((delta, is_first_chunk)),
                SessionEvent::MessageFinished { message } => finished.push(message),
                _ => {}
            }
        }
        assert_eq!(chunks, vec![("A".to_string(), true), ("B".to_string(), false)]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].content, "AB");
        assert_eq!(finished[0].suggestions, vec!["next?".to_string()]);
        assert_eq!(finished[0].mood.as_deref(), Some("calm"));
        assert_eq!(session.state().connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_one_fallback_message() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Status(503)));
        let session = session(&transport);

        assert_eq!(session.send_message("hello", None).await, SendOutcome::Failed);

        assert_eq!(transport.calls(), 3);
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[1].is_error);
        assert_eq!(messages[1].content, FALLBACK_MESSAGE);
        let state = session.state();
        assert!(!state.is_streaming);
        assert!(state.error.unwrap().contains("503"));
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Status(500)));
        let session = session(&transport);

        assert_eq!(session.send_message("   \n", None).await, SendOutcome::Ignored);
        assert!(session.messages().is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_while_streaming_is_ignored() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Slow(
            Duration::from_millis(500),
            answer_body(&["first"]),
        )));
        let session = session(&transport);

        let (first, second) = tokio::join!(
            session.send_message("first question", None),
            session.send_message("second question", None),
        );

        assert_eq!(first, SendOutcome::Streamed);
        assert_eq!(second, SendOutcome::Ignored);
        assert_eq!(transport.calls(), 1);
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_sharing_an_engine_collapse_identical_requests() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Slow(
            Duration::from_millis(500),
            answer_body(&["shared"]),
        )));
        let engine = engine(&transport);
        let a = ChatSession::new(Arc::clone(&engine), Arc::new(NoopPreloader));
        let b = ChatSession::new(engine, Arc::new(NoopPreloader));

        let (first, second) = tokio::join!(a.send_message(AI_QUERY, None), b.send_message(AI_QUERY, None));

        assert_eq!(first, SendOutcome::Streamed);
        assert_eq!(second, SendOutcome::Streamed);
        assert_eq!(transport.calls(), 1);
        assert_eq!(b.messages()[1].content, "shared");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_replaces_the_fallback_message() {
        let transport = Arc::new(ScriptedTransport::sequence(vec![
            Reply::Status(400),
            Reply::Body(answer_body(&["second time lucky"])),
        ]));
        let session = session(&transport);

        assert_eq!(session.send_message("hello", None).await, SendOutcome::Failed);
        assert_eq!(session.retry_last_message().await, SendOutcome::Streamed);

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "second time lucky");
        assert!(session.state().error.is_none());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_keeps_the_cache() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(answer_body(&["cached"]))));
        let session = session(&transport);

        session.send_message(AI_QUERY, None).await;
        session.clear_messages();
        assert!(session.messages().is_empty());
        assert_eq!(session.state(), StreamingState::default());
        assert_eq!(session.retry_last_message().await, SendOutcome::Ignored);

        assert_eq!(session.send_message(AI_QUERY, None).await, SendOutcome::CacheHit);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_partial_output_and_frees_the_request() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Stalling(sse_body(&[
            r#"{"type":"start"}"#,
            r#"{"type":"content","content":"partial"}"#,
        ]))));
        let engine = engine(&transport);
        let session = ChatSession::new(Arc::clone(&engine), Arc::new(NoopPreloader));

        let (outcome, cancelled) = tokio::join!(session.send_message("hello", None), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.cancel()
        });

        assert!(cancelled);
        assert_eq!(outcome, SendOutcome::Cancelled);
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "partial");
        assert!(!messages[1].is_streaming);
        assert_eq!(session.state().connection_status, ConnectionStatus::Disconnected);
        assert!(!engine.is_in_flight(&engine.fingerprint("hello", None)));
        assert!(engine.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_carries_recent_history() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(answer_body(&["answer"]))));
        let session = session(&transport);
        let profile = serde_json::json!({ "role": "student" });

        session.send_message("first", Some(&profile)).await;
        session.send_message("second", Some(&profile)).await;

        let requests = transport.requests();
        assert!(requests[0].conversation_history.is_empty());
        assert_eq!(
            requests[1].conversation_history,
            vec![
                HistoryEntry { role: Role::User, content: "first".into() },
                HistoryEntry { role: Role::Assistant, content: "answer".into() },
            ]
        );
        assert_eq!(requests[1].user_profile, Some(profile));
    }

    #[tokio::test(start_paused = true)]
    async fn quick_successive_queries_report_a_focused_session() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(answer_body(&["ok"]))));
        let session = session(&transport);

        for i in 0..4 {
            session.send_message(&format!("question {i}"), None).await;
        }
        assert_eq!(session.state().interaction_pattern, InteractionPattern::Explorer);

        session.send_message("question 4", None).await;
        let state = session.state();
        assert_eq!(state.interaction_pattern, InteractionPattern::Focused);
        assert_eq!(serde_json::to_value(&state).unwrap()["interactionPattern"], "focused");
        let snapshot = session.snapshot();
        assert_eq!(snapshot.messages.len(), 10);
        assert_eq!(snapshot.state, state);

        session.clear_messages();
        assert_eq!(session.state().interaction_pattern, InteractionPattern::Casual);
    }

    #[tokio::test(start_paused = true)]
    async fn each_send_counts_one_cache_lookup() {
        let transport = Arc::new(ScriptedTransport::always(Reply::Body(answer_body(&["ok"]))));
        let engine = engine(&transport);
        let preloader = PredictivePreloader::new(Arc::clone(&engine));
        let session = ChatSession::new(Arc::clone(&engine), Arc::new(preloader));

        assert_eq!(session.send_message("zzz unrelated", None).await, SendOutcome::Streamed);
        assert_eq!(engine.cache().stats(), CacheStats { entries: 1, hits: 0, misses: 1 });

        assert_eq!(session.send_message("zzz unrelated", None).await, SendOutcome::CacheHit);
        assert_eq!(engine.cache().stats(), CacheStats { entries: 1, hits: 1, misses: 1 });
    }
}
