use crate::error::{EngineError, EngineResult};
use crate::models::ChatRequest;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;

// Raw response body, yielded in whatever pieces the network delivers
pub type ByteStream = Pin<Box<dyn Stream<Item = EngineResult<Vec<u8>>> + Send>>;

// Trait defining the single network call the engine makes
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// URL the request is sent to; also the rate-limit key source.
    fn endpoint(&self) -> &str;

    /// POSTs the request and returns the response body once headers arrive.
    async fn open_stream(&self, request: &ChatRequest) -> EngineResult<ByteStream>;
}

// --- HTTP Implementation ---

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_stream(&self, request: &ChatRequest) -> EngineResult<ByteStream> {
        log::info!(
            "Sending stream request to {} (preload: {})",
            self.endpoint,
            request.preload.unwrap_or(false)
        );

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Stream request failed with status {}: {}", status, error_body);
            return Err(EngineError::Http { status: status.as_u16(), body: error_body });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(EngineError::from));

        Ok(Box::pin(body))
    }
}
