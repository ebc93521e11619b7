use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::api::{ByteStream, ChatTransport};
use crate::error::{EngineError, EngineResult};
use crate::models::ChatRequest;

#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16),
    Network,
    /// Never answers.
    Hang,
    /// Answers immediately with these body pieces.
    Body(Vec<Vec<u8>>),
    /// Answers after the delay.
    Slow(Duration, Vec<Vec<u8>>),
    /// Sends the pieces, then stalls without closing the body.
    Stalling(Vec<Vec<u8>>),
}

pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn always(reply: Reply) -> Self {
        Self::sequence_then(Vec::new(), reply)
    }

    /// Replays `replies` in order, repeating the last one.
    pub fn sequence(replies: Vec<Reply>) -> Self {
        let fallback = replies.last().cloned().unwrap_or(Reply::Status(500));
        Self::sequence_then(replies, fallback)
    }

    fn sequence_then(replies: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time between consecutive calls.
    pub fn call_gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn endpoint(&self) -> &str {
        "http://backend.test/api/chat/stream"
    }

    async fn open_stream(&self, request: &ChatRequest) -> EngineResult<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Status(status) => Err(EngineError::Http { status, body: "scripted".into() }),
            Reply::Network => Err(EngineError::Network("connection refused".into())),
            Reply::Hang => futures::future::pending().await,
            Reply::Body(pieces) => Ok(body(pieces)),
            Reply::Slow(delay, pieces) => {
                tokio::time::sleep(delay).await;
                Ok(body(pieces))
            }
            Reply::Stalling(pieces) => Ok(Box::pin(
                stream::iter(pieces.into_iter().map(Ok::<_, EngineError>)).chain(stream::pending()),
            )),
        }
    }
}

pub fn body(pieces: Vec<Vec<u8>>) -> ByteStream {
    Box::pin(stream::iter(pieces.into_iter().map(Ok::<_, EngineError>)))
}

/// One `data:` line per JSON event, each delivered as its own read.
pub fn sse_body(events: &[&str]) -> Vec<Vec<u8>> {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event).into_bytes())
        .collect()
}

/// start, one content event per part, complete.
pub fn answer_body(parts: &[&str]) -> Vec<Vec<u8>> {
    let mut events = vec![r#"{"type":"start"}"#.to_string()];
    events.extend(
        parts
            .iter()
            .map(|part| serde_json::json!({ "type": "content", "content": part }).to_string()),
    );
    events.push(r#"{"type":"complete","mood":"encouraging","confidence":0.8}"#.to_string());
    let refs: Vec<&str> = events.iter().map(String::as_str).collect();
    sse_body(&refs)
}
