use crate::cancel::Cancellation;
use crate::config::{ClientConfig, Settings};
use crate::github::{
    models::{self, RateLimitResponse},
    rate_limiter::{RateBudget, RateCategory, RateLimiter},
    retry::{self, RetryDecision, RetryPolicy},
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What to do when the rate limiter says a request may not go out yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
    /// Sleep until the budget allows the request
    #[default]
    Wait,
    /// Fail immediately with [`Error::RateLimited`]
    Reject,
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub mode: RateLimitMode,
    /// Overrides the configured retry ceiling for this request
    pub max_retries: Option<u32>,
    pub cancel: Cancellation,
}

impl RequestOptions {
    pub fn new(cancel: &Cancellation) -> Self {
        Self {
            cancel: cancel.clone(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: RateLimitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Observability counters describing the client's own behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// HTTP requests dispatched, retries included
    pub requests: u64,
    /// Requests that ended in an error response or transport failure
    pub errors: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Requests rejected locally by the rate limiter
    pub rate_limited: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    /// Milliseconds since the epoch, 0 when unset
    last_request_ms: AtomicI64,
}

/// GitHub API client
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    config: Arc<ClientConfig>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    stats: Arc<StatsCounters>,
}

impl ApiClient {
    /// Create a new GitHub client
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_parts(
            settings.client.clone(),
            RateLimiter::from_config(&settings.rate_limit),
            RetryPolicy::new(settings.retry.clone()),
        )
    }

    /// Create a client around an existing limiter and retry policy. Clients
    /// sharing one [`RateLimiter`] share one view of the budget.
    pub fn with_parts(
        config: ClientConfig,
        rate_limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&config.user_agent)
                .map_err(|e| Error::Config(format!("Invalid user agent: {e}")))?,
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            header::HeaderValue::from_static("2022-11-28"),
        );

        // Add authentication if token is provided
        if let Some(token) = &config.auth_token {
            let mut auth_value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Config(format!("Invalid GitHub token: {e}")))?;
            auth_value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, auth_value);
        } else {
            warn!("No GitHub token configured, requests run against the anonymous rate limit");
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: Arc::new(config),
            rate_limiter,
            retry,
            stats: Arc::new(StatsCounters::default()),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Issue a request against an API path (e.g. `/repos/acme/tools`).
    ///
    /// Returns `Ok(None)` for responses without a body (204). Rate limiting,
    /// retries and stats are handled here for every caller.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        opts: &RequestOptions,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let category = RateCategory::from_path(path);
        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);
        let mode = opts.mode;
        let cancel = &opts.cancel;

        self.retry
            .execute(
                |attempt| {
                    let method = method.clone();
                    let url = url.as_str();
                    async move {
                        if attempt > 0 {
                            self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        }
                        self.acquire(category, mode, cancel).await?;
                        cancel.run(self.send_once(method, url, category)).await
                    }
                },
                |e| match (mode, e) {
                    (RateLimitMode::Reject, Error::RateLimited { .. }) => RetryDecision::Fatal,
                    _ => retry::classify(e, Utc::now()),
                },
                opts.max_retries,
                cancel,
            )
            .await
    }

    /// GET a JSON document that must be present
    pub async fn get<T>(&self, path: &str, cancel: &Cancellation) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.get_with(path, &RequestOptions::new(cancel)).await
    }

    pub async fn get_with<T>(&self, path: &str, opts: &RequestOptions) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.request(Method::GET, path, opts)
            .await?
            .ok_or_else(|| Error::Decode(format!("Empty response body for {path}")))
    }

    /// GET a JSON array; an empty (204) response is an empty list
    pub async fn get_list<T>(&self, path: &str, opts: &RequestOptions) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        Ok(self
            .request::<Vec<T>>(Method::GET, path, opts)
            .await?
            .unwrap_or_default())
    }

    /// Wait for (or reject on) the rate limiter before dispatch
    async fn acquire(
        &self,
        category: RateCategory,
        mode: RateLimitMode,
        cancel: &Cancellation,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            let reservation = self.rate_limiter.reserve(category).await;
            if reservation.stale {
                self.resync_rate_limits(cancel).await?;
            }
            if reservation.allowed {
                return Ok(());
            }

            match mode {
                RateLimitMode::Reject => {
                    self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                    let reset_at = chrono::Duration::from_std(reservation.wait)
                        .ok()
                        .map(|wait| Utc::now() + wait);
                    return Err(Error::RateLimited { category, reset_at });
                }
                RateLimitMode::Wait => {
                    let wait = reservation.wait.max(Duration::from_millis(100));
                    info!("Rate limit reached for {}, waiting {:?}", category, wait);
                    self.retry.pause(wait, cancel).await?;
                }
            }
        }
    }

    /// Make a single HTTP request to GitHub API
    async fn send_once<T>(
        &self,
        method: Method,
        url: &str,
        fallback: RateCategory,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        debug!("GitHub API request: {} {}", method, url);
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_request_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let response = match self.client.request(method, url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Http(e));
            }
        };

        // Update rate limit from headers
        let category = self
            .rate_limiter
            .update_from_headers(response.headers(), &self.config.headers, fallback)
            .await;

        let status = response.status();

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let body = response.bytes().await.map_err(|e| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Error::Http(e)
            })?;
            if body.is_empty() {
                return Ok(None);
            }
            return serde_json::from_slice(&body).map(Some).map_err(|e| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Error::Decode(format!("Failed to parse GitHub API response: {e}"))
            });
        }

        self.stats.errors.fetch_add(1, Ordering::Relaxed);

        let headers = response.headers().clone();
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());
        let message = models::error_message(&error_body);

        let err = self.error_for_status(status, category, &headers, message, url);
        match &err {
            Error::NotFound(_) => debug!("GitHub API: not found: {}", url),
            _ => error!("GitHub API error: {} - {}", status, err.log_safe()),
        }
        Err(err)
    }

    fn error_for_status(
        &self,
        status: StatusCode,
        category: RateCategory,
        headers: &header::HeaderMap,
        message: String,
        url: &str,
    ) -> Error {
        match status {
            StatusCode::NOT_FOUND => Error::NotFound(url.to_string()),
            StatusCode::UNAUTHORIZED => Error::Authentication(message),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                match self.rate_limit_reset(headers, &message) {
                    Some(reset_at) => Error::RateLimited { category, reset_at },
                    None if status == StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
                        category,
                        reset_at: None,
                    },
                    None => Error::Authentication(message),
                }
            }
            s if s.is_server_error() => Error::Server { status: s.as_u16() },
            s => Error::Api {
                status: s.as_u16(),
                message,
            },
        }
    }

    /// Detect rate-limit semantics on a 403/429. The outer `Option` says
    /// whether the response is a rate limit at all; the inner one carries
    /// the reset time when it is known.
    #[allow(clippy::option_option)]
    fn rate_limit_reset(
        &self,
        headers: &header::HeaderMap,
        message: &str,
    ) -> Option<Option<DateTime<Utc>>> {
        let names = &self.config.headers;
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        if let Some(secs) = header(&names.retry_after).and_then(|s| s.trim().parse::<i64>().ok()) {
            return Some(Some(Utc::now() + chrono::Duration::seconds(secs)));
        }

        let reset_at = header(&names.reset)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));

        if header(&names.remaining) == Some("0") {
            return Some(reset_at);
        }

        if message.to_lowercase().contains("rate limit") {
            return Some(reset_at);
        }

        None
    }

    /// Re-query the platform's `/rate_limit` endpoint and reseed every
    /// category's budget from it
    pub async fn refresh_rate_limits(
        &self,
        cancel: &Cancellation,
    ) -> Result<Vec<(RateCategory, RateBudget)>> {
        let response: RateLimitResponse = self.get("/rate_limit", cancel).await?;
        self.apply_rate_limits(&response).await;
        Ok(self.rate_limiter.snapshot().await)
    }

    /// Best-effort re-query after a budget went stale. Sent directly so it
    /// never waits on the limiter it is refreshing; only cancellation fails.
    async fn resync_rate_limits(&self, cancel: &Cancellation) -> Result<()> {
        let url = format!(
            "{}/rate_limit",
            self.config.api_base_url.trim_end_matches('/')
        );
        let response = cancel
            .run(self.send_once::<RateLimitResponse>(Method::GET, &url, RateCategory::Core))
            .await;

        match response {
            Ok(Some(response)) => {
                self.apply_rate_limits(&response).await;
                debug!("Rate limits re-queried after a stale budget");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!("Could not re-query rate limits: {}", e.log_safe());
                Ok(())
            }
        }
    }

    async fn apply_rate_limits(&self, response: &RateLimitResponse) {
        for (resource, limit) in &response.resources {
            let Some(category) = RateCategory::from_resource(resource) else {
                continue;
            };
            let Some(reset_at) = DateTime::from_timestamp(limit.reset, 0) else {
                continue;
            };
            self.rate_limiter
                .update(category, Some(limit.limit), limit.remaining, reset_at)
                .await;
        }
    }

    /// Get request statistics
    pub fn get_stats(&self) -> ClientStats {
        let last_ms = self.stats.last_request_ms.load(Ordering::Relaxed);
        ClientStats {
            requests: self.stats.requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            last_request_at: (last_ms != 0)
                .then(|| DateTime::from_timestamp_millis(last_ms))
                .flatten(),
        }
    }

    /// Clear request statistics. The rate limiter's state is untouched.
    pub fn reset_stats(&self) {
        self.stats.requests.store(0, Ordering::Relaxed);
        self.stats.errors.store(0, Ordering::Relaxed);
        self.stats.retries.store(0, Ordering::Relaxed);
        self.stats.rate_limited.store(0, Ordering::Relaxed);
        self.stats.last_request_ms.store(0, Ordering::Relaxed);
    }
}
