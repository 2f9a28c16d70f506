use crate::github::models::{Commit, Contributor, Repository};
use crate::github::RepositoryRef;
use crate::manifest::ParsedManifest;
use crate::utils::sanitize::truncate;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

const ACTIVE_WITHIN_DAYS: i64 = 90;
const RECENT_COMMIT_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributorSummary {
    pub login: String,
    pub contributions: u64,
    pub html_url: Option<String>,
}

impl ContributorSummary {
    /// Anonymous contributors have no login and are skipped
    pub fn from_contributor(contributor: Contributor) -> Option<Self> {
        Some(Self {
            login: contributor.login?,
            contributions: contributor.contributions,
            html_url: contributor.html_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub sha: String,
    /// First line of the message
    pub message: String,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl From<Commit> for CommitSummary {
    fn from(commit: Commit) -> Self {
        let date = commit
            .commit
            .committer
            .as_ref()
            .and_then(|c| c.date)
            .or_else(|| commit.commit.author.as_ref().and_then(|a| a.date));
        let author = commit
            .author
            .map(|user| user.login)
            .or_else(|| commit.commit.author.and_then(|a| a.name));
        let message = commit.commit.message.lines().next().unwrap_or_default();

        Self {
            sha: commit.sha,
            message: truncate(message, 200),
            author,
            date,
        }
    }
}

/// Derived signals about a repository's upkeep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIndicators {
    pub days_since_push: Option<i64>,
    pub is_active: bool,
    /// Commits within the last 30 days, among those fetched
    pub recent_commits: usize,
    pub has_description: bool,
    pub has_license: bool,
    pub has_homepage: bool,
    pub has_topics: bool,
    /// 0 to 100
    pub health_score: u8,
}

impl HealthIndicators {
    pub fn compute(
        repo: &Repository,
        contributors: &[ContributorSummary],
        commits: &[CommitSummary],
        now: DateTime<Utc>,
    ) -> Self {
        let days_since_push = repo.pushed_at.map(|pushed| (now - pushed).num_days().max(0));
        let is_active = !repo.archived
            && days_since_push.is_some_and(|days| days <= ACTIVE_WITHIN_DAYS);
        let recent_cutoff = now - Duration::days(RECENT_COMMIT_DAYS);
        let recent_commits = commits
            .iter()
            .filter(|c| c.date.is_some_and(|d| d >= recent_cutoff))
            .count();

        let has_description = repo
            .description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty());
        let has_license = repo.license.is_some();
        let has_homepage = repo
            .homepage
            .as_deref()
            .is_some_and(|h| !h.trim().is_empty());
        let has_topics = !repo.topics.is_empty();

        // Activity: up to 40
        let activity = match days_since_push {
            _ if repo.archived => 0,
            Some(days) if days <= 30 => 40,
            Some(days) if days <= ACTIVE_WITHIN_DAYS => 25,
            Some(days) if days <= 365 => 10,
            _ => 0,
        };

        // Documentation: up to 20
        let documentation = if has_description { 10 } else { 0 } + if has_license { 10 } else { 0 };

        // Community: up to 20
        let community = match contributors.len() {
            0 => 0,
            1 => 5,
            2..=4 => 10,
            _ => 15,
        } + if has_topics { 5 } else { 0 };

        // Popularity: up to 20
        let popularity = match repo.stargazers_count {
            0 => 0,
            1..=4 => 5,
            5..=24 => 10,
            25..=99 => 15,
            _ => 20,
        };

        Self {
            days_since_push,
            is_active,
            recent_commits,
            has_description,
            has_license,
            has_homepage,
            has_topics,
            health_score: activity + documentation + community + popularity,
        }
    }
}

/// The assembled, normalized record for one repository in one scan cycle
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryMetadata {
    #[serde(flatten)]
    pub repository: RepositoryRef,
    pub id: u64,
    pub description: Option<String>,
    pub html_url: String,
    pub homepage: Option<String>,
    pub default_branch: Option<String>,
    pub primary_language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub open_issues: u64,
    pub watchers: u64,
    pub topics: Vec<String>,
    pub license: Option<String>,
    pub fork: bool,
    pub archived: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    /// Bytes of code per language
    pub languages: BTreeMap<String, u64>,
    /// Percentage per language, one decimal place
    pub language_percentages: BTreeMap<String, f64>,
    pub contributors: Vec<ContributorSummary>,
    pub recent_commits: Vec<CommitSummary>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub health: HealthIndicators,
    /// Attached only when present and valid
    pub manifest: Option<ParsedManifest>,
    /// Secondary lookups that failed, with a log-safe reason
    pub partial_failures: BTreeMap<String, String>,
    pub assembled_at: DateTime<Utc>,
}

impl RepositoryMetadata {
    pub fn build(
        repo: Repository,
        languages: BTreeMap<String, u64>,
        contributors: Vec<ContributorSummary>,
        recent_commits: Vec<CommitSummary>,
        partial_failures: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let health = HealthIndicators::compute(&repo, &contributors, &recent_commits, now);
        let language_percentages = language_percentages(&languages);
        let last_commit_at = recent_commits
            .iter()
            .filter_map(|c| c.date)
            .max()
            .or(repo.pushed_at);

        let repository = RepositoryRef::from_full_name(&repo.full_name)
            .unwrap_or_else(|_| RepositoryRef::new(repo.owner.login.clone(), repo.name.clone()));
        let license = repo
            .license
            .map(|l| l.spdx_id.filter(|id| id != "NOASSERTION").unwrap_or(l.name));

        Self {
            repository,
            id: repo.id,
            description: repo.description,
            html_url: repo.html_url,
            homepage: repo.homepage.filter(|h| !h.trim().is_empty()),
            default_branch: repo.default_branch,
            primary_language: repo.language,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            open_issues: repo.open_issues_count,
            watchers: repo.watchers_count,
            topics: repo.topics,
            license,
            fork: repo.fork,
            archived: repo.archived,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            pushed_at: repo.pushed_at,
            languages,
            language_percentages,
            contributors,
            recent_commits,
            last_commit_at,
            health,
            manifest: None,
            partial_failures,
            assembled_at: now,
        }
    }

    /// Attach a manifest. Invalid manifests are not attached.
    pub fn with_manifest(mut self, manifest: Option<ParsedManifest>) -> Self {
        self.manifest = manifest.filter(|m| m.is_valid);
        self
    }

    pub fn is_partial(&self) -> bool {
        !self.partial_failures.is_empty()
    }
}

pub fn language_percentages(languages: &BTreeMap<String, u64>) -> BTreeMap<String, f64> {
    let total: u64 = languages.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }
    languages
        .iter()
        .map(|(language, bytes)| {
            let pct = (*bytes as f64 / total as f64) * 100.0;
            (language.clone(), (pct * 10.0).round() / 10.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo(days_since_push: i64, stars: u64) -> Repository {
        let pushed = Utc::now() - Duration::days(days_since_push);
        serde_json::from_value(json!({
            "id": 7,
            "name": "tools",
            "full_name": "acme/tools",
            "owner": {"login": "acme", "id": 1},
            "description": "Handy tools",
            "html_url": "https://github.com/acme/tools",
            "stargazers_count": stars,
            "topics": ["claude-code"],
            "license": {"key": "mit", "name": "MIT License", "spdx_id": "MIT"},
            "pushed_at": pushed.to_rfc3339()
        }))
        .unwrap()
    }

    fn contributors(n: usize) -> Vec<ContributorSummary> {
        (0..n)
            .map(|i| ContributorSummary {
                login: format!("user{i}"),
                contributions: 10,
                html_url: None,
            })
            .collect()
    }

    #[test]
    fn test_health_score_for_active_repository() {
        let now = Utc::now();
        let commits = vec![CommitSummary {
            sha: "a".into(),
            message: "fix".into(),
            author: None,
            date: Some(now - Duration::days(3)),
        }];
        let health = HealthIndicators::compute(&repo(2, 150), &contributors(6), &commits, now);

        assert!(health.is_active);
        assert_eq!(health.recent_commits, 1);
        assert_eq!(health.health_score, 100);
    }

    #[test]
    fn test_health_score_for_stale_repository() {
        let now = Utc::now();
        let health = HealthIndicators::compute(&repo(400, 3), &[], &[], now);

        assert!(!health.is_active);
        assert_eq!(health.days_since_push, Some(400));
        // documentation 20 + topics 5 + popularity 5
        assert_eq!(health.health_score, 30);
    }

    #[test]
    fn test_language_percentages() {
        let languages = BTreeMap::from([
            ("Rust".to_string(), 750u64),
            ("Shell".to_string(), 250u64),
        ]);
        let pct = language_percentages(&languages);
        assert_eq!(pct["Rust"], 75.0);
        assert_eq!(pct["Shell"], 25.0);
        assert!(language_percentages(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_commit_summary_uses_first_line() {
        let commit: Commit = serde_json::from_value(json!({
            "sha": "abc",
            "commit": {
                "message": "Add feature\n\nLong body",
                "author": {"name": "Dev", "date": "2025-01-02T03:04:05Z"}
            },
            "author": null
        }))
        .unwrap();
        let summary = CommitSummary::from(commit);
        assert_eq!(summary.message, "Add feature");
        assert_eq!(summary.author.as_deref(), Some("Dev"));
        assert!(summary.date.is_some());
    }

    #[test]
    fn test_license_prefers_spdx_id() {
        let metadata = RepositoryMetadata::build(
            repo(1, 1),
            BTreeMap::new(),
            Vec::new(),
            Vec::new(),
            BTreeMap::new(),
        );
        assert_eq!(metadata.license.as_deref(), Some("MIT"));
        assert_eq!(metadata.repository.full_name, "acme/tools");
        assert!(metadata.last_commit_at.is_some());
    }
}
