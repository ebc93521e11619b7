use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while delivering a response.
///
/// `Clone` so that one settled result can be handed to every caller that
/// joined a deduplicated request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The attempt exceeded its hard deadline and was aborted.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP client gave up waiting; it does not report its deadline.
    #[error("transport timed out: {0}")]
    TransportTimeout(String),

    /// The connection failed or dropped before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Admission control rejected the call.
    #[error("rate limit exceeded for {endpoint}")]
    RateLimitExceeded { endpoint: String },

    /// The caller cancelled the request.
    #[error("request aborted")]
    Aborted,

    /// A single `data:` line could not be decoded. Recovered by the decoder.
    #[error("malformed stream line ({reason}): {line}")]
    StreamParse { line: String, reason: String },

    /// The stream reported an error or ended without a usable response.
    #[error("streaming failed: {0}")]
    Streaming(String),
}

impl EngineError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// 4xx answers, rate-limit rejections and aborts are terminal; timeouts,
    /// network failures and 5xx answers are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Timeout(_) | EngineError::TransportTimeout(_) | EngineError::Network(_) => true,
            EngineError::Http { status, .. } => (500..600).contains(status),
            EngineError::RateLimitExceeded { .. }
            | EngineError::Aborted
            | EngineError::StreamParse { .. }
            | EngineError::Streaming(_) => false,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::TransportTimeout(err.to_string())
        } else {
            EngineError::Network(err.to_string())
        }
    }
}
