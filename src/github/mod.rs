pub mod client;
pub mod models;
pub mod parser;
pub mod rate_limiter;
pub mod retry;

pub use client::{ApiClient, ClientStats, RateLimitMode, RequestOptions};
pub use parser::{parse_repository_url, RepositoryRef};
pub use rate_limiter::{RateBudget, RateCategory, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};

/// Percent-encode each segment of a repository-relative path, keeping `/`
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
