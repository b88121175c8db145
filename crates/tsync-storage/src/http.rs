//! Retrying HTTP GET with per-attempt timeouts, bounded backoff and
//! cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another attempt, everything else is final.
pub fn classify_status(status: u16) -> RetryDisposition {
    if (500..600).contains(&status) || status == 429 {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// `base * 2^attempt`, capped at `max_delay`.
    Exponential,
    /// `base` between every attempt.
    Fixed,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub kind: BackoffKind,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            kind: BackoffKind::Exponential,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            kind: BackoffKind::Fixed,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

/// First attempt gets `initial`, every retry gets the longer `retry` budget.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub initial: Duration,
    pub retry: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            retry: Duration::from_secs(60),
        }
    }
}

impl TimeoutPolicy {
    pub fn for_attempt(&self, attempt_index: usize) -> Duration {
        if attempt_index == 0 {
            self.initial
        } else {
            self.retry.max(self.initial)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub timeout: TimeoutPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("request error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout | Self::Network(_) => RetryDisposition::Retryable,
            Self::Other(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Single-shot GET; retries live in [`HttpFetcher`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .pool_idle_timeout(Duration::from_secs(90));
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    fn classify_error(err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            TransportError::Network(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(&request.url)
            .query(&request.query)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|err| Self::classify_error(&err))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|err| Self::classify_error(&err))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Retries exhausted on 5xx/429/timeout/network errors: the upstream is
    /// down, not our code.
    #[error("{url} unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        url: String,
        attempts: usize,
        last_error: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("request to {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get_bytes(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_with_retry(url, query, cancel).instrument(span).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<T, FetchError> {
        let body = self.get_bytes(url, query, cancel).await?;
        serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let backoff = self.policy.backoff;
        let mut last_error = String::new();

        for attempt in 0..=backoff.max_retries {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled { url: url.to_string() });
            }

            let request = HttpRequest {
                url: url.to_string(),
                query: query.to_vec(),
                timeout: self.policy.timeout.for_attempt(attempt),
            };
            debug!(attempt, timeout_ms = request.timeout.as_millis() as u64, "sending request");

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
                result = self.transport.get(&request) => result,
            };

            match result {
                Ok(resp) if (200..300).contains(&resp.status) => return Ok(resp.body),
                Ok(resp) => {
                    if classify_status(resp.status) == RetryDisposition::NonRetryable {
                        return Err(FetchError::HttpStatus {
                            status: resp.status,
                            url: url.to_string(),
                        });
                    }
                    last_error = format!("http status {}", resp.status);
                }
                Err(err) => {
                    if err.disposition() == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            message: err.to_string(),
                        });
                    }
                    last_error = err.to_string();
                }
            }

            if attempt < backoff.max_retries {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retryable fetch failure"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(FetchError::Cancelled { url: url.to_string() });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(FetchError::Unavailable {
            url: url.to_string(),
            attempts: backoff.max_retries + 1,
            last_error,
        })
    }
}
