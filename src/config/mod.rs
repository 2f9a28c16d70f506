pub mod queries;

use crate::error::{Error, Result};
use crate::github::rate_limiter::RateCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use queries::{QueryConfig, QueryEntry};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const MARKETPLACE_MANIFEST_PATH: &str = ".claude-plugin/marketplace.json";
pub const PLUGIN_MANIFEST_PATH: &str = ".claude-plugin/plugin.json";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub client: ClientConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub search: SearchConfig,
    pub metadata: MetadataConfig,
    pub content: ContentConfig,
    pub scan: ScanConfig,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub headers: RateLimitHeaders,
}

// Hand-written so the token never ends up in logs
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("api_base_url", &self.api_base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            user_agent: format!("marketplace-scanner/{}", env!("CARGO_PKG_VERSION")),
            api_base_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: 30,
            headers: RateLimitHeaders::default(),
        }
    }
}

/// Names of the response headers that report rate-limit state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: String,
    pub remaining: String,
    pub reset: String,
    pub resource: String,
    pub retry_after: String,
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self {
            limit: "x-ratelimit-limit".to_string(),
            remaining: "x-ratelimit-remaining".to_string(),
            reset: "x-ratelimit-reset".to_string(),
            resource: "x-ratelimit-resource".to_string(),
            retry_after: "retry-after".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub limit: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests held back from each server budget
    pub buffer: u32,
    /// Local pacing windows per category
    pub windows: HashMap<RateCategory, WindowConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let windows = HashMap::from([
            (
                RateCategory::Core,
                WindowConfig {
                    limit: 5000,
                    window_ms: 3_600_000,
                },
            ),
            (
                RateCategory::Search,
                WindowConfig {
                    limit: 30,
                    window_ms: 60_000,
                },
            ),
        ]);
        Self {
            buffer: 50,
            windows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub max_results_per_page: u32,
    pub max_total_results: u32,
    pub exclude_forks: bool,
    pub exclude_archived: bool,
    pub min_stars: Option<u32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results_per_page: 100,
            max_total_results: 1000,
            exclude_forks: true,
            exclude_archived: true,
            min_stars: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub fetch_languages: bool,
    pub fetch_contributors: bool,
    pub fetch_commits: bool,
    pub max_contributors: u32,
    pub max_commits: u32,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub concurrency: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            fetch_languages: true,
            fetch_contributors: true,
            fetch_commits: true,
            max_contributors: 10,
            max_commits: 30,
            cache_enabled: true,
            cache_ttl_secs: 3600,
            concurrency: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub max_file_size: u64,
    pub allowed_encodings: Vec<String>,
    pub cache_ttl_secs: u64,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub concurrency: usize,
    /// Promote content-screening findings to hard errors
    pub strict_validation: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1_048_576, // 1MB
            allowed_encodings: vec!["base64".to_string(), "utf-8".to_string()],
            cache_ttl_secs: 3600,
            timeout_secs: 30,
            retry_attempts: 3,
            concurrency: 5,
            strict_validation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Candidate manifest paths, tried in order
    pub manifest_paths: Vec<String>,
    pub concurrency: usize,
    /// Drop repositories without a valid manifest from the records
    pub require_manifest: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            manifest_paths: vec![
                MARKETPLACE_MANIFEST_PATH.to_string(),
                PLUGIN_MANIFEST_PATH.to_string(),
            ],
            concurrency: 5,
            require_manifest: false,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("Invalid {name} value"))),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(default)
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let auth_token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.trim().is_empty());

        let client = ClientConfig {
            auth_token,
            user_agent: env_or("GITHUB_USER_AGENT", defaults.client.user_agent)?,
            api_base_url: env_or("GITHUB_API_URL", defaults.client.api_base_url)?,
            request_timeout_secs: env_or(
                "GITHUB_REQUEST_TIMEOUT",
                defaults.client.request_timeout_secs,
            )?,
            headers: RateLimitHeaders {
                limit: env_or("RATE_LIMIT_HEADER_LIMIT", defaults.client.headers.limit)?,
                remaining: env_or(
                    "RATE_LIMIT_HEADER_REMAINING",
                    defaults.client.headers.remaining,
                )?,
                reset: env_or("RATE_LIMIT_HEADER_RESET", defaults.client.headers.reset)?,
                resource: env_or(
                    "RATE_LIMIT_HEADER_RESOURCE",
                    defaults.client.headers.resource,
                )?,
                retry_after: env_or(
                    "RATE_LIMIT_HEADER_RETRY_AFTER",
                    defaults.client.headers.retry_after,
                )?,
            },
        };

        let mut rate_limit = defaults.rate_limit;
        rate_limit.buffer = env_or("GITHUB_RATE_LIMIT_BUFFER", rate_limit.buffer)?;
        for (category, var) in [
            (RateCategory::Core, "GITHUB_CORE_RATE_LIMIT"),
            (RateCategory::Search, "GITHUB_SEARCH_RATE_LIMIT"),
        ] {
            if let Some(window) = rate_limit.windows.get_mut(&category) {
                window.limit = env_or(var, window.limit)?;
            }
        }

        let retry = RetryConfig {
            enabled: env_or("RETRY_ENABLED", defaults.retry.enabled)?,
            max_retries: env_or("RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.retry.base_delay_ms)?,
            max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
        };

        let min_stars = match std::env::var("SEARCH_MIN_STARS") {
            Ok(value) => Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config("Invalid SEARCH_MIN_STARS value".to_string()))?,
            ),
            Err(_) => None,
        };

        let search = SearchConfig {
            max_results_per_page: env_or(
                "SEARCH_PER_PAGE",
                defaults.search.max_results_per_page,
            )?,
            max_total_results: env_or("SEARCH_MAX_RESULTS", defaults.search.max_total_results)?,
            exclude_forks: env_or("SEARCH_EXCLUDE_FORKS", defaults.search.exclude_forks)?,
            exclude_archived: env_or("SEARCH_EXCLUDE_ARCHIVED", defaults.search.exclude_archived)?,
            min_stars,
        };

        let metadata = MetadataConfig {
            fetch_languages: env_or("METADATA_FETCH_LANGUAGES", defaults.metadata.fetch_languages)?,
            fetch_contributors: env_or(
                "METADATA_FETCH_CONTRIBUTORS",
                defaults.metadata.fetch_contributors,
            )?,
            fetch_commits: env_or("METADATA_FETCH_COMMITS", defaults.metadata.fetch_commits)?,
            max_contributors: env_or(
                "METADATA_MAX_CONTRIBUTORS",
                defaults.metadata.max_contributors,
            )?,
            max_commits: env_or("METADATA_MAX_COMMITS", defaults.metadata.max_commits)?,
            cache_enabled: env_or("METADATA_CACHE_ENABLED", defaults.metadata.cache_enabled)?,
            cache_ttl_secs: env_or("METADATA_CACHE_TTL", defaults.metadata.cache_ttl_secs)?,
            concurrency: env_or("METADATA_CONCURRENCY", defaults.metadata.concurrency)?,
        };

        let content = ContentConfig {
            max_file_size: env_or("CONTENT_MAX_FILE_SIZE", defaults.content.max_file_size)?,
            allowed_encodings: env_list(
                "CONTENT_ALLOWED_ENCODINGS",
                defaults.content.allowed_encodings,
            ),
            cache_ttl_secs: env_or("CONTENT_CACHE_TTL", defaults.content.cache_ttl_secs)?,
            timeout_secs: env_or("CONTENT_TIMEOUT", defaults.content.timeout_secs)?,
            retry_attempts: env_or("CONTENT_RETRY_ATTEMPTS", defaults.content.retry_attempts)?,
            concurrency: env_or("CONTENT_CONCURRENCY", defaults.content.concurrency)?,
            strict_validation: env_or("MANIFEST_STRICT", defaults.content.strict_validation)?,
        };

        let scan = ScanConfig {
            manifest_paths: env_list("SCAN_MANIFEST_PATHS", defaults.scan.manifest_paths),
            concurrency: env_or("SCAN_CONCURRENCY", defaults.scan.concurrency)?,
            require_manifest: env_or("SCAN_REQUIRE_MANIFEST", defaults.scan.require_manifest)?,
        };

        Ok(Settings {
            client,
            rate_limit,
            retry,
            search,
            metadata,
            content,
            scan,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.client.api_base_url)
            .map_err(|e| Error::Config(format!("Invalid API base URL: {e}")))?;

        if self.client.user_agent.trim().is_empty() {
            return Err(Error::Config("User agent must not be empty".to_string()));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "Retry base delay must not exceed max delay".to_string(),
            ));
        }

        if !(1..=100).contains(&self.search.max_results_per_page) {
            return Err(Error::Config(
                "Search page size must be between 1 and 100".to_string(),
            ));
        }

        if self.search.max_total_results == 0 {
            return Err(Error::Config(
                "Search result cap must be non-zero".to_string(),
            ));
        }

        if self.metadata.max_contributors > 100 || self.metadata.max_commits > 100 {
            return Err(Error::Config(
                "Contributor and commit limits must not exceed 100".to_string(),
            ));
        }

        if self.content.max_file_size == 0 {
            return Err(Error::Config("Max file size must be non-zero".to_string()));
        }

        if self.content.allowed_encodings.is_empty() {
            return Err(Error::Config(
                "At least one content encoding must be allowed".to_string(),
            ));
        }
        for encoding in &self.content.allowed_encodings {
            if !matches!(encoding.as_str(), "base64" | "utf-8") {
                return Err(Error::Config(format!(
                    "Unsupported content encoding: {encoding}"
                )));
            }
        }

        if self.metadata.concurrency == 0
            || self.content.concurrency == 0
            || self.scan.concurrency == 0
        {
            return Err(Error::Config("Concurrency must be non-zero".to_string()));
        }

        if self.scan.manifest_paths.is_empty() {
            return Err(Error::Config(
                "At least one manifest path is required".to_string(),
            ));
        }

        for (category, window) in &self.rate_limit.windows {
            if window.window_ms == 0 {
                return Err(Error::Config(format!(
                    "Rate limit window for {category} must be non-zero"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.search.max_results_per_page = 0;
        assert!(settings.validate().is_err());

        settings.search.max_results_per_page = 101;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let mut settings = Settings::default();
        settings.retry.base_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let mut settings = Settings::default();
        settings.content.allowed_encodings.push("utf-16".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.retry.base_delay(), Duration::from_millis(1000));
        assert_eq!(settings.retry.max_delay(), Duration::from_millis(30_000));
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.content.max_file_size, 1_048_576);
        assert_eq!(settings.metadata.max_contributors, 10);
        assert_eq!(settings.metadata.max_commits, 30);
        assert_eq!(
            settings.rate_limit.windows[&RateCategory::Search],
            WindowConfig {
                limit: 30,
                window_ms: 60_000
            }
        );
    }

    #[test]
    fn test_client_config_debug_redacts_token() {
        let config = ClientConfig {
            auth_token: Some("ghp_supersecret".to_string()),
            ..ClientConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("ghp_supersecret"));
        assert!(debug.contains("<redacted>"));
    }
}
