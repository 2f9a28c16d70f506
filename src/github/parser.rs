use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Minimal repository identity.
///
/// Two refs are equal iff their `full_name` matches case-insensitively, so
/// refs can be used directly as deduplication keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub full_name: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        let owner = owner.into();
        let name = name.into();
        let full_name = format!("{owner}/{name}");
        Self {
            owner,
            name,
            full_name,
        }
    }

    /// Build from a `owner/name` string as reported by the API
    pub fn from_full_name(full_name: &str) -> Result<Self> {
        match full_name.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(owner, name))
            }
            _ => Err(Error::Validation(format!(
                "Invalid repository full name: {full_name}"
            ))),
        }
    }

    /// Lower-cased `full_name`, the deduplication key
    pub fn key(&self) -> String {
        self.full_name.to_lowercase()
    }
}

impl PartialEq for RepositoryRef {
    fn eq(&self, other: &Self) -> bool {
        self.full_name.eq_ignore_ascii_case(&other.full_name)
    }
}

impl Eq for RepositoryRef {}

impl Hash for RepositoryRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_name.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// Owner and repository names are restricted to `[A-Za-z0-9._-]`, which
/// makes them safe to interpolate into API paths.
pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parse a GitHub repository URL
/// Accepts formats:
/// - https://github.com/owner/repo
/// - https://github.com/owner/repo/
/// - https://github.com/owner/repo.git
/// - github.com/owner/repo
/// - owner/repo
pub fn parse_repository_url(url: &str) -> Result<RepositoryRef> {
    let url = url.trim();

    // Remove trailing slashes and .git suffix
    let url = url.trim_end_matches('/').trim_end_matches(".git");

    // Remove protocol if present
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    // Remove github.com if present
    let url = url.strip_prefix("github.com/").unwrap_or(url);

    // Now we should have owner/repo or owner/repo/something
    let parts: Vec<&str> = url.split('/').collect();

    if parts.len() < 2 {
        return Err(Error::Validation(
            "Invalid GitHub repository URL format. Expected: owner/repo".to_string(),
        ));
    }

    let owner = parts[0].trim();
    let repo = parts[1].trim();

    if owner.is_empty() || repo.is_empty() {
        return Err(Error::Validation(
            "Repository owner and name cannot be empty".to_string(),
        ));
    }

    if !is_valid_name(owner) || !is_valid_name(repo) {
        return Err(Error::Validation(format!(
            "Repository owner and name may only contain letters, digits, '-', '_' and '.': {owner}/{repo}"
        )));
    }

    Ok(RepositoryRef::new(owner, repo))
}
