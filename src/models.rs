use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque user profile, used only as a cache-key component and forwarded to the backend.
pub type UserProfile = serde_json::Value;

/// How many queries `UserContext` remembers.
pub const RECENT_QUERY_CAPACITY: usize = 10;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

// Represents a single turn in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_streaming: bool,
    // Marks the fallback message appended after a failed send
    #[serde(default)]
    pub is_error: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            suggestions: Vec::new(),
            action_items: Vec::new(),
            mood: None,
            confidence: None,
            is_streaming: false,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    /// Empty assistant message that receives streamed content.
    pub fn streaming_placeholder() -> Self {
        Self {
            role: Role::Assistant,
            is_streaming: true,
            ..Self::user(String::new())
        }
    }

    /// Finished assistant message built from a completed response.
    pub fn assistant(payload: &ResponsePayload) -> Self {
        let mut message = Self::streaming_placeholder();
        message.finish_with(payload);
        message
    }

    pub fn fallback(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            is_error: true,
            ..Self::user(content)
        }
    }

    /// Copies the completed response into the message and freezes it.
    pub fn finish_with(&mut self, payload: &ResponsePayload) {
        self.content = payload.content.clone();
        self.suggestions = payload.suggestions.clone();
        self.action_items = payload.action_items.clone();
        self.mood = payload.mood.clone();
        self.confidence = payload.confidence;
        self.is_streaming = false;
    }
}

/// A completed response: what the cache stores and deduplicated callers share.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub content: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One decoded `data:` event of the response stream.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamingChunk {
    Start,
    Content {
        #[serde(default)]
        content: String,
    },
    Suggestions {
        #[serde(default)]
        suggestions: Vec<String>,
    },
    ActionItems {
        #[serde(default, rename = "actionItems")]
        action_items: Vec<String>,
    },
    Complete {
        #[serde(default)]
        mood: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
}

// Entry of the conversationHistory array sent upstream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Request body POSTed to the generation backend.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<UserProfile>,
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload: Option<bool>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, user_profile: Option<&UserProfile>) -> Self {
        Self {
            message: message.into(),
            user_profile: user_profile.cloned(),
            conversation_history: Vec::new(),
            preload: None,
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.conversation_history = history;
        self
    }

    pub fn preload(mut self) -> Self {
        self.preload = Some(true);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InteractionPattern {
    Focused,
    Explorer,
    #[default]
    Casual,
}

impl InteractionPattern {
    /// Buckets a session by how many queries it has seen and how long it has run.
    pub fn classify(query_count: usize, session_age: Duration) -> Self {
        if query_count >= 5 && session_age <= Duration::from_secs(5 * 60) {
            InteractionPattern::Focused
        } else if query_count >= 3 && session_age <= Duration::from_secs(10 * 60) {
            InteractionPattern::Explorer
        } else {
            InteractionPattern::Casual
        }
    }
}

/// Rolling session state used for prediction.
#[derive(Clone, Debug)]
pub struct UserContext {
    pub recent_queries: VecDeque<String>,
    pub query_count: usize,
    pub interaction_pattern: InteractionPattern,
    pub session_start_time: Instant,
}

impl UserContext {
    pub fn new() -> Self {
        Self {
            recent_queries: VecDeque::with_capacity(RECENT_QUERY_CAPACITY),
            query_count: 0,
            interaction_pattern: InteractionPattern::default(),
            session_start_time: Instant::now(),
        }
    }

    /// Records a resolved query and reclassifies the session.
    pub fn record(&mut self, query: &str) {
        if self.recent_queries.len() == RECENT_QUERY_CAPACITY {
            self.recent_queries.pop_front();
        }
        self.recent_queries.push_back(query.to_string());
        self.query_count += 1;
        self.interaction_pattern =
            InteractionPattern::classify(self.query_count, self.session_start_time.elapsed());
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Fast,
    Normal,
    Slow,
}

impl OptimizationLevel {
    pub fn from_elapsed(elapsed: Duration) -> Self {
        if elapsed < Duration::from_secs(2) {
            OptimizationLevel::Fast
        } else if elapsed < Duration::from_secs(5) {
            OptimizationLevel::Normal
        } else {
            OptimizationLevel::Slow
        }
    }
}

/// Timing and outcome of one resolved request.
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub response_time_ms: u64,
    pub cache_hit: bool,
    pub optimization_level: OptimizationLevel,
}

impl PerformanceSample {
    pub fn new(elapsed: Duration, cache_hit: bool) -> Self {
        Self {
            response_time_ms: elapsed.as_millis() as u64,
            cache_hit,
            optimization_level: OptimizationLevel::from_elapsed(elapsed),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Connecting,
    Disconnected,
}

/// Status object observed by the UI.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingState {
    pub is_streaming: bool,
    pub current_message: Option<Uuid>,
    pub error: Option<String>,
    pub response_time_ms: Option<u64>,
    pub cache_hit: bool,
    pub optimization_level: Option<OptimizationLevel>,
    pub connection_status: ConnectionStatus,
    pub interaction_pattern: InteractionPattern,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_json_uses_type_tag() {
        let chunk: StreamingChunk =
            serde_json::from_str(r#"{"type":"actionItems","actionItems":["a","b"]}"#).unwrap();
        assert_eq!(
            chunk,
            StreamingChunk::ActionItems { action_items: vec!["a".into(), "b".into()] }
        );

        let chunk: StreamingChunk =
            serde_json::from_str(r#"{"type":"complete","mood":"upbeat","confidence":0.9}"#)
                .unwrap();
        assert_eq!(
            chunk,
            StreamingChunk::Complete { mood: Some("upbeat".into()), confidence: Some(0.9) }
        );
    }

    #[test]
    fn request_body_is_camel_case_and_omits_absent_fields() {
        let body = serde_json::to_value(ChatRequest::new("hi", None)).unwrap();
        assert_eq!(body["message"], "hi");
        assert!(body["conversationHistory"].as_array().unwrap().is_empty());
        assert!(body.get("userProfile").is_none());
        assert!(body.get("preload").is_none());

        let body = serde_json::to_value(ChatRequest::new("hi", None).preload()).unwrap();
        assert_eq!(body["preload"], true);
    }

    #[test]
    fn interaction_pattern_thresholds() {
        let minute = Duration::from_secs(60);
        assert_eq!(InteractionPattern::classify(5, 4 * minute), InteractionPattern::Focused);
        assert_eq!(InteractionPattern::classify(5, 6 * minute), InteractionPattern::Explorer);
        assert_eq!(InteractionPattern::classify(3, 9 * minute), InteractionPattern::Explorer);
        assert_eq!(InteractionPattern::classify(3, 11 * minute), InteractionPattern::Casual);
        assert_eq!(InteractionPattern::classify(2, minute), InteractionPattern::Casual);
    }

    #[test]
    fn recent_queries_are_bounded() {
        let mut context = UserContext::new();
        for i in 0..15 {
            context.record(&format!("query {i}"));
        }
        assert_eq!(context.recent_queries.len(), RECENT_QUERY_CAPACITY);
        assert_eq!(context.recent_queries.front().unwrap(), "query 5");
        assert_eq!(context.query_count, 15);
    }

    #[test]
    fn optimization_level_buckets() {
        assert_eq!(OptimizationLevel::from_elapsed(Duration::from_millis(1999)), OptimizationLevel::Fast);
        assert_eq!(OptimizationLevel::from_elapsed(Duration::from_secs(2)), OptimizationLevel::Normal);
        assert_eq!(OptimizationLevel::from_elapsed(Duration::from_secs(5)), OptimizationLevel::Slow);
    }
}
