//! Per-repository metadata assembly.
//!
//! The base repository lookup is required; languages, contributors and
//! commits are secondary and their failures only leave gaps in the record.

pub mod models;

pub use models::{CommitSummary, ContributorSummary, HealthIndicators, RepositoryMetadata};

use crate::batch::{run_bounded, BatchOutcome};
use crate::cache::TtlCache;
use crate::cancel::Cancellation;
use crate::config::MetadataConfig;
use crate::github::models::{Commit, Contributor, Repository};
use crate::github::parser::is_valid_name;
use crate::github::{ApiClient, RepositoryRef, RequestOptions};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_PER_PAGE: u32 = 100;

/// Which secondary lookups to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssembleOptions {
    pub fetch_languages: bool,
    pub fetch_contributors: bool,
    pub fetch_commits: bool,
    pub max_contributors: u32,
    pub max_commits: u32,
}

impl From<&MetadataConfig> for AssembleOptions {
    fn from(config: &MetadataConfig) -> Self {
        Self {
            fetch_languages: config.fetch_languages,
            fetch_contributors: config.fetch_contributors,
            fetch_commits: config.fetch_commits,
            max_contributors: config.max_contributors,
            max_commits: config.max_commits,
        }
    }
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self::from(&MetadataConfig::default())
    }
}

impl AssembleOptions {
    /// Base repository data only
    pub fn base_only() -> Self {
        Self {
            fetch_languages: false,
            fetch_contributors: false,
            fetch_commits: false,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct MetadataAssembler {
    client: ApiClient,
    config: MetadataConfig,
    cache: TtlCache<(String, AssembleOptions), RepositoryMetadata>,
}

impl MetadataAssembler {
    pub fn new(client: ApiClient, config: MetadataConfig) -> Self {
        let cache = TtlCache::new(Duration::from_secs(config.cache_ttl_secs));
        Self {
            client,
            config,
            cache,
        }
    }

    pub fn default_options(&self) -> AssembleOptions {
        AssembleOptions::from(&self.config)
    }

    pub fn cache(&self) -> &TtlCache<(String, AssembleOptions), RepositoryMetadata> {
        &self.cache
    }

    /// Assemble the metadata record for one repository
    pub async fn assemble(
        &self,
        repo: &RepositoryRef,
        options: &AssembleOptions,
        cancel: &Cancellation,
    ) -> Result<RepositoryMetadata> {
        if !is_valid_name(&repo.owner) || !is_valid_name(&repo.name) {
            return Err(Error::Validation(format!(
                "Invalid repository identity: {}/{}",
                repo.owner, repo.name
            )));
        }

        let key = (repo.key(), *options);
        if self.config.cache_enabled {
            if let Some(cached) = self.cache.get(&key).await {
                debug!("Metadata cache hit: {}", repo);
                return Ok(cached);
            }
        }

        let base = format!("/repos/{}/{}", repo.owner, repo.name);
        let opts = RequestOptions::new(cancel);

        let (repository, languages, contributors, commits) = tokio::join!(
            self.client.get::<Repository>(&base, cancel),
            async {
                if !options.fetch_languages {
                    return None;
                }
                let path = format!("{base}/languages");
                Some(self.client.get::<BTreeMap<String, u64>>(&path, cancel).await)
            },
            async {
                if !options.fetch_contributors || options.max_contributors == 0 {
                    return None;
                }
                let path = format!(
                    "{base}/contributors?per_page={}",
                    options.max_contributors.min(MAX_PER_PAGE)
                );
                Some(self.client.get_list::<Contributor>(&path, &opts).await)
            },
            async {
                if !options.fetch_commits || options.max_commits == 0 {
                    return None;
                }
                let path = format!(
                    "{base}/commits?per_page={}",
                    options.max_commits.min(MAX_PER_PAGE)
                );
                Some(self.client.get_list::<Commit>(&path, &opts).await)
            },
        );

        // Everything else is meaningless without the base record
        let repository = repository?;

        let mut partial_failures = BTreeMap::new();
        let languages = secondary(repo, "languages", languages, &mut partial_failures)?;
        let contributors = secondary(repo, "contributors", contributors, &mut partial_failures)?;
        let commits = match commits {
            // An empty repository has no commit history
            Some(Err(Error::Api { status: 409, .. })) => Some(Ok(Vec::new())),
            other => other,
        };
        let commits = secondary(repo, "commits", commits, &mut partial_failures)?;

        let contributors: Vec<ContributorSummary> = contributors
            .into_iter()
            .filter_map(ContributorSummary::from_contributor)
            .take(options.max_contributors as usize)
            .collect();
        let commits: Vec<CommitSummary> = commits
            .into_iter()
            .take(options.max_commits as usize)
            .map(CommitSummary::from)
            .collect();

        let metadata = RepositoryMetadata::build(
            repository,
            languages,
            contributors,
            commits,
            partial_failures,
        );

        if self.config.cache_enabled {
            self.cache.insert(key, metadata.clone()).await;
        }

        Ok(metadata)
    }

    /// Assemble many repositories with bounded concurrency. Results are
    /// keyed by repository and never fail as a whole.
    pub async fn get_multiple_repository_metadata(
        &self,
        repos: Vec<RepositoryRef>,
        options: &AssembleOptions,
        cancel: &Cancellation,
    ) -> BatchOutcome<RepositoryRef, RepositoryMetadata> {
        run_bounded(repos, self.config.concurrency, cancel, |repo| async move {
            self.assemble(&repo, options, cancel).await
        })
        .await
    }
}

/// Unpack a secondary lookup: skipped and failed lookups yield an empty
/// value, failures are recorded. Cancellation still propagates.
fn secondary<T: Default>(
    repo: &RepositoryRef,
    field: &str,
    result: Option<Result<T>>,
    failures: &mut BTreeMap<String, String>,
) -> Result<T> {
    match result {
        None => Ok(T::default()),
        Some(Ok(value)) => Ok(value),
        Some(Err(Error::Cancelled)) => Err(Error::Cancelled),
        Some(Err(e)) => {
            warn!("Failed to fetch {} for {}: {}", field, repo, e.log_safe());
            failures.insert(field.to_string(), e.log_safe());
            Ok(T::default())
        }
    }
}
