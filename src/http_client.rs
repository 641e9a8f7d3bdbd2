//! HTTP Client Module
//!
//! Shared HTTP wrapper for source adapters:
//! - Browser-like default headers (Spanish-first Accept-Language)
//! - Fixed request timeout
//! - Minimum spacing between consecutive requests (politeness delay)
//! - Exponential backoff with jitter for transient failures
//!
//! Errors are reported as `AdapterError` so timeouts, transport failures,
//! HTTP status errors and unparseable payloads stay distinguishable.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AdapterError;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "es-AR,es;q=0.9,en;q=0.8";

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for the adapter HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout
    pub request_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum retries for transient failures
    pub max_retries: u32,
    /// Initial retry delay
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// Minimum spacing between two requests of the same client
    pub request_delay: Duration,
    /// User agent string
    pub user_agent: String,
    /// Extra headers, e.g. from a source's adapter configuration
    pub extra_headers: HashMap<String, String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            request_delay: Duration::from_secs(2),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            extra_headers: HashMap::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.api_timeout_secs),
            max_retries: config.max_retries,
            request_delay: Duration::from_millis(config.request_delay_ms),
            user_agent: config
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ..Default::default()
        }
    }

    /// Adds headers from a source's `extra_headers` configuration object
    pub fn with_extra_headers(mut self, adapter_config: &serde_json::Value) -> Self {
        if let Some(headers) = adapter_config.get("extra_headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    self.extra_headers.insert(name.clone(), value.to_string());
                }
            }
        }
        self
    }
}

/// Polite, retrying HTTP client owned by one adapter instance
pub struct AdapterHttpClient {
    client: Client,
    limiter: Option<Arc<DirectRateLimiter>>,
    config: HttpClientConfig,
}

impl AdapterHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AdapterError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| AdapterError::Config(format!("user agent: {e}")))?,
        );
        for (name, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AdapterError::Config(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AdapterError::Config(format!("header value: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;

        let limiter = Quota::with_period(config.request_delay)
            .map(|quota| Arc::new(RateLimiter::direct(quota)));

        Ok(Self {
            client,
            limiter,
            config,
        })
    }

    /// Creates a client with default configuration
    pub fn with_defaults() -> Result<Self, AdapterError> {
        Self::new(HttpClientConfig::default())
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// GET with query parameters, decoding a JSON body
    pub async fn get_json<T, Q>(&self, url: &str, query: &Q) -> Result<T, AdapterError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let body = self.get_bytes(url, query).await?;
        serde_json::from_slice(&body).map_err(|e| AdapterError::Parse(format!("{url}: {e}")))
    }

    /// GET with query parameters, returning the raw body
    pub async fn get_bytes<Q>(&self, url: &str, query: &Q) -> Result<Vec<u8>, AdapterError>
    where
        Q: Serialize + ?Sized,
    {
        let response = self.execute(|| self.client.get(url).query(query)).await?;
        let body = response.bytes().await.map_err(AdapterError::from)?;
        Ok(body.to_vec())
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_delay)
            .with_max_interval(self.config.max_retry_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.5)
            .with_max_elapsed_time(Some(Duration::from_secs(300)))
            .build()
    }

    /// Sends a request, retrying transient failures up to `max_retries`
    async fn execute<F>(&self, build_request: F) -> Result<Response, AdapterError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let build_request = &build_request;
        let limiter = self.limiter.clone();
        let max_retries = self.config.max_retries;

        backoff::future::retry(self.create_backoff(), move || {
            let limiter = limiter.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(limiter) = limiter {
                    limiter.until_ready().await;
                }

                match build_request().send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(status = %response.status(), attempt, "Request succeeded");
                        Ok(response)
                    }
                    Ok(response) => {
                        let status = response.status();
                        let err = AdapterError::Status {
                            status: status.as_u16(),
                            url: response.url().to_string(),
                        };
                        if is_retryable_status(status) && attempt <= max_retries {
                            warn!(status = %status, attempt, max_retries, "Retryable status, will retry");
                            Err(backoff::Error::transient(err))
                        } else {
                            Err(backoff::Error::permanent(err))
                        }
                    }
                    Err(e) => {
                        let transient = e.is_timeout() || e.is_connect();
                        let err = AdapterError::from(e);
                        if transient && attempt <= max_retries {
                            warn!(error = %err, attempt, "Transient error, will retry");
                            Err(backoff::Error::transient(err))
                        } else {
                            Err(backoff::Error::permanent(err))
                        }
                    }
                }
            }
        })
        .await
    }
}

/// Checks if a status code should trigger a retry
fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::BAD_GATEWAY
            | StatusCode::REQUEST_TIMEOUT
    )
}
