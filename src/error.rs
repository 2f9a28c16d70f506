use crate::github::rate_limiter::RateCategory;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited on '{category}' (resets at {})", display_reset(.reset_at))]
    RateLimited {
        category: RateCategory,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Content too large: {size} bytes (max: {max})")]
    ContentTooLarge { size: u64, max: u64 },

    #[error("Manifest validation failed: {}", .errors.join("; "))]
    ValidationFailed {
        errors: Vec<String>,
        warnings: Vec<String>,
    },

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Content decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn display_reset(reset_at: &Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Coarse failure buckets reported to the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Authentication,
    RateLimited,
    TransientNetwork,
    NotFound,
    ContentTooLarge,
    ValidationFailed,
    Cancelled,
    Other,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::Authentication => "authentication",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::TransientNetwork => "transient_network",
            FailureCategory::NotFound => "not_found",
            FailureCategory::ContentTooLarge => "content_too_large",
            FailureCategory::ValidationFailed => "validation_failed",
            FailureCategory::Cancelled => "cancelled",
            FailureCategory::Other => "other",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Map this error onto the failure taxonomy used in scan summaries.
    /// Exhausted retries are reported under the category of the last failure.
    pub fn category(&self) -> FailureCategory {
        match self {
            Error::Authentication(_) => FailureCategory::Authentication,
            Error::RateLimited { .. } => FailureCategory::RateLimited,
            Error::Http(_) | Error::Server { .. } | Error::Timeout(_) => {
                FailureCategory::TransientNetwork
            }
            Error::NotFound(_) => FailureCategory::NotFound,
            Error::ContentTooLarge { .. } => FailureCategory::ContentTooLarge,
            Error::ValidationFailed { .. } => FailureCategory::ValidationFailed,
            Error::Cancelled => FailureCategory::Cancelled,
            Error::RetriesExhausted { source, .. } => source.category(),
            _ => FailureCategory::Other,
        }
    }

    /// True when the error invalidates every subsequent call, so a batch
    /// should stop scheduling new work.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self.category(), FailureCategory::Authentication)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Get a sanitized error message safe for logging
    /// Filters out potentially sensitive information
    pub fn log_safe(&self) -> String {
        match self {
            // reqwest errors carry the full request URL
            Error::Http(e) if e.is_timeout() => "External HTTP request timed out".to_string(),
            Error::Http(_) => "External HTTP request failed".to_string(),

            Error::Authentication(_) => "Authentication failed (details redacted)".to_string(),

            Error::Internal(msg) | Error::Config(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("password")
                    || lower.contains("secret")
                    || lower.contains("token")
                    || lower.contains("key")
                {
                    "Internal error (details redacted)".to_string()
                } else {
                    self.to_string()
                }
            }

            Error::Io(_) => "File system operation failed".to_string(),
            Error::RetriesExhausted { attempts, source } => {
                format!("Giving up after {attempts} attempts: {}", source.log_safe())
            }

            _ => self.to_string(),
        }
    }
}
