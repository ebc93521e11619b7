use futures::{stream, Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::ByteStream;
use crate::error::{EngineError, EngineResult};
use crate::models::{ResponsePayload, StreamingChunk};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental change to the message being streamed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A `start` chunk arrived; any previous partial content is void.
    Started,
    Delta(String),
    Suggestions(Vec<String>),
    ActionItems(Vec<String>),
}

pub type UpdateSink = mpsc::UnboundedSender<StreamUpdate>;

/// Buffers body bytes and hands out complete newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and drains every complete line. A trailing partial line
    /// stays buffered for the next read.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            // splitting on b'\n' never cuts a multi-byte UTF-8 sequence
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Bytes of an unterminated trailing line.
    pub fn remainder(&self) -> usize {
        self.pending.len()
    }
}

/// Parses one line. Lines that are not `data:` events, blank data and the
/// `[DONE]` sentinel yield `None`.
pub fn parse_line(line: &str) -> Option<EngineResult<StreamingChunk>> {
    let data = line.strip_prefix(DATA_PREFIX)?.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return None;
    }
    Some(
        serde_json::from_str::<StreamingChunk>(data).map_err(|e| EngineError::StreamParse {
            line: data.to_string(),
            reason: e.to_string(),
        }),
    )
}

struct ChunkReader {
    body: ByteStream,
    lines: LineBuffer,
    ready: VecDeque<StreamingChunk>,
    idle_timeout: Duration,
    exhausted: bool,
}

/// Lazily decodes `body` into chunks.
///
/// Malformed lines are logged and skipped. Transport errors and a read that
/// stalls longer than `idle_timeout` end the stream with an error item. The
/// stream is finite and not restartable.
pub fn chunk_stream(
    body: ByteStream,
    idle_timeout: Duration,
) -> impl Stream<Item = EngineResult<StreamingChunk>> + Send {
    let reader = ChunkReader {
        body,
        lines: LineBuffer::new(),
        ready: VecDeque::new(),
        idle_timeout,
        exhausted: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(chunk) = reader.ready.pop_front() {
                return Some((Ok(chunk), reader));
            }
            if reader.exhausted {
                return None;
            }

            match tokio::time::timeout(reader.idle_timeout, reader.body.next()).await {
                Ok(Some(Ok(bytes))) => {
                    for line in reader.lines.push(&bytes) {
                        match parse_line(&line) {
                            Some(Ok(chunk)) => reader.ready.push_back(chunk),
                            Some(Err(e)) => log::warn!("Skipping stream line: {}", e),
                            None => {}
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    reader.exhausted = true;
                    return Some((Err(e), reader));
                }
                Ok(None) => {
                    reader.exhausted = true;
                    if reader.lines.remainder() > 0 {
                        log::debug!(
                            "Discarding {} bytes of unterminated trailing line",
                            reader.lines.remainder()
                        );
                    }
                }
                Err(_) => {
                    log::warn!("Response body stalled for {:?}", reader.idle_timeout);
                    reader.exhausted = true;
                    return Some((Err(EngineError::Timeout(reader.idle_timeout)), reader));
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Streaming,
    Done,
    Failed,
}

/// State machine folding chunks into one response.
#[derive(Debug)]
pub struct MessageAssembler {
    state: DecoderState,
    payload: ResponsePayload,
    started_at: Instant,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
            payload: ResponsePayload::default(),
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    /// Applies one chunk, returning the update to show, if any.
    /// An `error` chunk fails the assembler and is returned as `Streaming`.
    pub fn apply(&mut self, chunk: StreamingChunk) -> EngineResult<Option<StreamUpdate>> {
        match self.state {
            DecoderState::Done | DecoderState::Failed => {
                log::debug!("Ignoring chunk after stream end: {:?}", chunk);
                return Ok(None);
            }
            DecoderState::Idle | DecoderState::Streaming => {}
        }

        let update = match chunk {
            StreamingChunk::Start => {
                self.state = DecoderState::Streaming;
                self.payload = ResponsePayload::default();
                self.started_at = Instant::now();
                Some(StreamUpdate::Started)
            }
            StreamingChunk::Content { content } => {
                self.ensure_started();
                if content.is_empty() {
                    None
                } else {
                    self.payload.content.push_str(&content);
                    Some(StreamUpdate::Delta(content))
                }
            }
            StreamingChunk::Suggestions { suggestions } => {
                self.ensure_started();
                self.payload.suggestions = suggestions.clone();
                Some(StreamUpdate::Suggestions(suggestions))
            }
            StreamingChunk::ActionItems { action_items } => {
                self.ensure_started();
                self.payload.action_items = action_items.clone();
                Some(StreamUpdate::ActionItems(action_items))
            }
            StreamingChunk::Complete { mood, confidence } => {
                self.ensure_started();
                self.payload.mood = mood;
                self.payload.confidence = confidence;
                self.state = DecoderState::Done;
                log::debug!(
                    "Stream complete: {} chars in {:?}",
                    self.payload.content.len(),
                    self.started_at.elapsed()
                );
                None
            }
            StreamingChunk::Error { error } => {
                self.state = DecoderState::Failed;
                let message = error.unwrap_or_else(|| "stream reported an error".to_string());
                log::error!("Stream error chunk: {}", message);
                return Err(EngineError::Streaming(message));
            }
        };
        Ok(update)
    }

    /// The finished payload; fails unless a `complete` chunk was applied.
    pub fn finish(self) -> EngineResult<ResponsePayload> {
        match self.state {
            DecoderState::Done => Ok(self.payload),
            DecoderState::Idle => Err(EngineError::Streaming("no response received".to_string())),
            DecoderState::Streaming | DecoderState::Failed => Err(EngineError::Streaming(
                "stream ended before completion".to_string(),
            )),
        }
    }

    // `content` ahead of `start` is tolerated as an implicit start
    fn ensure_started(&mut self) {
        if self.state == DecoderState::Idle {
            log::warn!("Chunk arrived before start, treating stream as started");
            self.state = DecoderState::Streaming;
        }
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes `body` to completion, forwarding updates to `updates` as they arrive.
pub async fn decode_response(
    body: ByteStream,
    idle_timeout: Duration,
    updates: Option<&UpdateSink>,
) -> EngineResult<ResponsePayload> {
    let chunks = chunk_stream(body, idle_timeout);
    futures::pin_mut!(chunks);
    let mut assembler = MessageAssembler::new();

    while let Some(chunk) = chunks.next().await {
        if let Some(update) = assembler.apply(chunk?)? {
            if let Some(sink) = updates {
                // the receiver may be gone if the caller cancelled
                let _ = sink.send(update);
            }
        }
        if assembler.is_done() {
            break;
        }
    }

    assembler.finish()
}
