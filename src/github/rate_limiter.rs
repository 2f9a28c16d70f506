use crate::config::{RateLimitConfig, RateLimitHeaders, WindowConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Partition of the platform's rate limit. Each category has its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Core,
    Search,
    CodeSearch,
    Graphql,
}

impl RateCategory {
    /// Infer the category a request path is billed against
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        if path.starts_with("/search/code") {
            RateCategory::CodeSearch
        } else if path.starts_with("/search/") {
            RateCategory::Search
        } else if path.starts_with("/graphql") {
            RateCategory::Graphql
        } else {
            RateCategory::Core
        }
    }

    /// Parse the resource name reported by the platform
    pub fn from_resource(resource: &str) -> Option<Self> {
        match resource.trim() {
            "core" => Some(RateCategory::Core),
            "search" => Some(RateCategory::Search),
            "code_search" => Some(RateCategory::CodeSearch),
            "graphql" => Some(RateCategory::Graphql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Core => "core",
            RateCategory::Search => "search",
            RateCategory::CodeSearch => "code_search",
            RateCategory::Graphql => "graphql",
        }
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known server budget for one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateBudget {
    pub limit: u32,
    /// Server-reported remaining, decremented locally per reservation
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl RateBudget {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Answer to a reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub allowed: bool,
    pub wait: Duration,
    /// The known budget had passed its reset and was dropped
    pub stale: bool,
}

impl Reservation {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            stale: false,
        }
    }

    fn deny(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
            stale: false,
        }
    }
}

#[derive(Debug, Default)]
struct CategoryState {
    budget: Option<RateBudget>,
    /// Reservation times inside the local pacing window
    recent: VecDeque<DateTime<Utc>>,
}

/// Rate limiter for the platform API.
///
/// The server is authoritative: every response resynchronises the budget via
/// [`RateLimiter::update`]. Between responses, reservations are counted down
/// locally so concurrent callers cannot race past the budget. Unknown or
/// stale budgets are treated optimistically; a stale one is flagged on the
/// reservation so the client can re-query it.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<RateCategory, CategoryState>>>,
    buffer: u32,
    windows: HashMap<RateCategory, WindowConfig>,
}

impl RateLimiter {
    /// Create a new rate limiter with a buffer
    pub fn new(buffer: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            buffer,
            windows: HashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            buffer: config.buffer,
            windows: config.windows.clone(),
        }
    }

    /// Requests held back from the server budget
    fn threshold(&self, limit: u32) -> u32 {
        std::cmp::min(self.buffer, limit / 10)
    }

    pub async fn reserve(&self, category: RateCategory) -> Reservation {
        self.reserve_at(category, Utc::now()).await
    }

    /// Ask whether a request in `category` may be sent at `now`. A granted
    /// reservation consumes one unit of the local budget.
    ///
    /// A budget past its reset is dropped and the reservation is marked
    /// `stale`; [`ApiClient`](crate::github::ApiClient) re-queries
    /// `/rate_limit` when it sees the flag.
    pub async fn reserve_at(&self, category: RateCategory, now: DateTime<Utc>) -> Reservation {
        let mut state = self.state.lock().await;
        let entry = state.entry(category).or_default();

        if let Some(window) = self.windows.get(&category) {
            let span = ChronoDuration::milliseconds(window.window_ms as i64);
            while entry.recent.front().is_some_and(|t| *t + span <= now) {
                entry.recent.pop_front();
            }
            if window.limit > 0 && entry.recent.len() >= window.limit as usize {
                let oldest = entry.recent.front().copied().unwrap_or(now);
                let wait = to_std(oldest + span - now);
                debug!(
                    "Local {} window full ({} in {}ms), wait {:?}",
                    category, window.limit, window.window_ms, wait
                );
                return Reservation::deny(wait);
            }
        }

        let stale = entry.budget.as_ref().is_some_and(|b| b.is_stale(now));
        if stale {
            debug!("Rate budget for {} is stale, treating as unknown", category);
            entry.budget = None;
        }

        if let Some(budget) = entry.budget.as_mut() {
            if budget.remaining <= self.threshold(budget.limit) {
                let wait = to_std(budget.reset_at - now);
                warn!(
                    "Rate limit approaching for {} ({}/{}), next slot in {:?}",
                    category, budget.remaining, budget.limit, wait
                );
                return Reservation::deny(wait);
            }
            budget.remaining -= 1;
        }

        if self.windows.contains_key(&category) {
            entry.recent.push_back(now);
        }
        Reservation {
            stale,
            ..Reservation::allow()
        }
    }

    /// Resynchronise a category with the server's view
    pub async fn update(
        &self,
        category: RateCategory,
        limit: Option<u32>,
        remaining: u32,
        reset_at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        let entry = state.entry(category).or_default();
        let limit = limit
            .or(entry.budget.as_ref().map(|b| b.limit))
            .unwrap_or(remaining);

        entry.budget = Some(RateBudget {
            limit,
            remaining,
            reset_at,
            observed_at: Utc::now(),
        });

        debug!(
            "Rate limit updated for {}: {}/{} (resets at {})",
            category, remaining, limit, reset_at
        );
    }

    /// Update rate limit from API response headers. Returns the category the
    /// server billed, falling back to `fallback` when it is not reported.
    pub async fn update_from_headers(
        &self,
        headers: &reqwest::header::HeaderMap,
        names: &RateLimitHeaders,
        fallback: RateCategory,
    ) -> RateCategory {
        let category = header_str(headers, &names.resource)
            .and_then(RateCategory::from_resource)
            .unwrap_or(fallback);

        let limit = header_str(headers, &names.limit).and_then(|s| s.parse().ok());
        let remaining = header_str(headers, &names.remaining).and_then(|s| s.parse().ok());
        let reset_at = header_str(headers, &names.reset)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));

        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            self.update(category, limit, remaining, reset_at).await;
        }

        category
    }

    /// Current budget for a category, if one has been observed
    pub async fn budget(&self, category: RateCategory) -> Option<RateBudget> {
        let state = self.state.lock().await;
        state.get(&category).and_then(|s| s.budget.clone())
    }

    /// All observed budgets, ordered by category
    pub async fn snapshot(&self) -> Vec<(RateCategory, RateBudget)> {
        let state = self.state.lock().await;
        let mut budgets: Vec<_> = state
            .iter()
            .filter_map(|(category, s)| s.budget.clone().map(|b| (*category, b)))
            .collect();
        budgets.sort_by_key(|(category, _)| *category);
        budgets
    }

    /// Forget every observed budget
    pub async fn reset(&self) {
        self.state.lock().await.clear();
    }

    pub fn buffer(&self) -> u32 {
        self.buffer
    }
}

fn header_str<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn to_std(delta: ChronoDuration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}
