pub mod payload;

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt, stream};
use reqwest::Client;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::decoder;
use crate::error::ReviewError;

pub use payload::{PromptBuilder, RequestPayload};

/// Longest response line accepted from the server (1MB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Cap on how much of an error response body is kept for the message.
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Timeout for the liveness probe.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded assistant tokens for one request, in arrival order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ReviewError>> + Send>>;

/// Anything that can turn a payload into a token stream.
///
/// Tasks depend on this rather than on the HTTP client directly.
pub trait TokenSource: Send + Sync + 'static {
    fn open_stream(
        &self,
        payload: RequestPayload,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<TokenStream, ReviewError>> + Send;

    /// Whether the backend looks reachable.
    fn test_connection(&self) -> impl Future<Output = bool> + Send;
}

/// Bounded retry with exponential backoff: `backoff_unit × 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Delay after the failed attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.backoff_unit.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

/// Streaming client for a local chat-completion server.
///
/// Holds one connection pool for the life of the client. Requests are issued
/// one at a time; the task layer never runs two generations at once.
pub struct InferenceClient {
    http: Client,
    api_url: String,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl InferenceClient {
    pub fn new(
        api_url: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ReviewError> {
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("critique/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReviewError::Config(format!("failed to build HTTP client: {e}")))?;

        let api_url = api_url.into();
        tracing::info!(api_url = %api_url, "initialized inference client");

        Ok(Self {
            http,
            api_url,
            request_timeout,
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ReviewError> {
        Self::new(
            config.api_url.clone(),
            config.request_timeout(),
            RetryPolicy::new(config.max_retries),
        )
    }

    /// Liveness endpoint on the same host: `/api/chat` becomes `/api/tags`.
    pub fn liveness_url(&self) -> String {
        self.api_url.replace("/api/chat", "/api/tags")
    }

    /// True only if the liveness endpoint answers HTTP 200 within 5 seconds.
    pub async fn test_connection(&self) -> bool {
        let url = self.liveness_url();
        match self.http.get(&url).timeout(LIVENESS_TIMEOUT).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                tracing::info!(url = %url, "inference server is reachable");
                true
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                tracing::warn!(url = %url, status, "liveness check failed");
                false
            }
            Err(e) => {
                tracing::warn!(url = %url, "liveness check failed: {e}");
                false
            }
        }
    }

    /// Open a streaming chat request and return its decoded tokens.
    ///
    /// Connection failures and timeouts while opening the stream are retried
    /// with exponential backoff; anything else is returned at once. Failures
    /// after the stream has started come through the stream itself and are
    /// never retried, since tokens may already have been delivered.
    pub async fn stream(
        &self,
        payload: &RequestPayload,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, ReviewError> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ReviewError::Cancelled);
            }

            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReviewError::Cancelled),
                result = self.open(payload) => result,
            };

            match result {
                Ok(response) => {
                    tracing::info!(
                        model = %payload.model,
                        attempt = attempt + 1,
                        latency_ms = start.elapsed().as_millis() as u64,
                        "inference stream opened"
                    );
                    return Ok(token_stream(response, self.request_timeout));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "inference request failed: {e}; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ReviewError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(attempts = attempt + 1, "all retry attempts failed: {e}");
                    } else {
                        tracing::error!("non-retryable inference error: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One attempt: send the request and check the status line.
    async fn open(&self, payload: &RequestPayload) -> Result<reqwest::Response, ReviewError> {
        let timeout_ms = self.request_timeout.as_millis() as u64;

        let send = self.http.post(&self.api_url).json(payload).send();
        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| ReviewError::Timeout(timeout_ms))?
            .map_err(|e| ReviewError::from_transport(e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = tokio::time::timeout(self.request_timeout, response.bytes())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            let truncated = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
            return Err(ReviewError::Response {
                message: String::from_utf8_lossy(truncated).into_owned(),
                status: Some(status.as_u16()),
            });
        }

        Ok(response)
    }
}

impl TokenSource for InferenceClient {
    async fn open_stream(
        &self,
        payload: RequestPayload,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ReviewError> {
        self.stream(&payload, &cancel).await
    }

    async fn test_connection(&self) -> bool {
        InferenceClient::test_connection(self).await
    }
}

/// Split the response body into lines, bound each read by `read_timeout`,
/// and decode.
fn token_stream(response: reqwest::Response, read_timeout: Duration) -> TokenStream {
    let timeout_ms = read_timeout.as_millis() as u64;
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let lines = Box::pin(FramedRead::new(
        StreamReader::new(body),
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES),
    ));

    let lines = stream::unfold(lines, move |mut lines| async move {
        let item = match tokio::time::timeout(read_timeout, lines.next()).await {
            Ok(Some(Ok(line))) => Ok(line),
            Ok(Some(Err(e))) => Err(ReviewError::response(format!(
                "failed to read response stream: {e}"
            ))),
            Ok(None) => return None,
            Err(_) => Err(ReviewError::Timeout(timeout_ms)),
        };
        Some((item, lines))
    });

    Box::pin(decoder::decode_lines(lines))
}
