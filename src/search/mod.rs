//! Repository discovery through the platform's search endpoint.
//!
//! Pages of one query are fetched strictly in order. Results are
//! deduplicated by case-insensitive `full_name` and filtered again on the
//! client, because search qualifiers are only approximate.

pub mod query;

pub use query::{DateRange, SearchFilters, SearchQuery, SearchSort, SEARCH_RESULT_WINDOW};

use crate::cancel::Cancellation;
use crate::config::SearchConfig;
use crate::error::FailureCategory;
use crate::github::models::{Repository, SearchResponse};
use crate::github::{ApiClient, RepositoryRef};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A repository as returned by search, before enrichment
#[derive(Debug, Clone, Serialize)]
pub struct RepositorySearchResult {
    #[serde(flatten)]
    pub repository: RepositoryRef,
    pub description: Option<String>,
    pub html_url: String,
    pub default_branch: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub language: Option<String>,
    pub topics: Vec<String>,
    pub fork: bool,
    pub archived: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    /// The `q` string of the query that first found this repository
    pub matched_query: String,
}

impl RepositorySearchResult {
    fn from_repository(repo: Repository, matched_query: &str) -> Self {
        let repository = RepositoryRef::from_full_name(&repo.full_name)
            .unwrap_or_else(|_| RepositoryRef::new(repo.owner.login.clone(), repo.name.clone()));
        Self {
            repository,
            description: repo.description,
            html_url: repo.html_url,
            default_branch: repo.default_branch,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            language: repo.language,
            topics: repo.topics,
            fork: repo.fork,
            archived: repo.archived,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            pushed_at: repo.pushed_at,
            matched_query: matched_query.to_string(),
        }
    }
}

/// Result of a single query
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub repositories: Vec<RepositorySearchResult>,
    /// Total reported by the platform, before the result cap and post-filters
    pub total_count: u64,
    pub pages_fetched: u32,
    /// The platform flagged at least one page as incomplete (search timeout)
    pub incomplete: bool,
    /// Results dropped by the client-side post-filters
    pub filtered_out: usize,
    /// More results existed than the cap allowed to be read
    pub truncated: bool,
}

impl SearchOutcome {
    pub fn refs(&self) -> Vec<RepositoryRef> {
        self.repositories
            .iter()
            .map(|r| r.repository.clone())
            .collect()
    }
}

/// Per-query line of a discovery sweep
#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub query: String,
    pub total_count: u64,
    pub returned: usize,
    /// Results not already found by an earlier query
    pub new_unique: usize,
    pub pages_fetched: u32,
    pub error: Option<String>,
    pub error_category: Option<FailureCategory>,
}

/// Result of a multi-query discovery sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub repositories: Vec<RepositorySearchResult>,
    pub queries: Vec<QueryStats>,
    pub duplicates_merged: usize,
    pub cancelled: bool,
}

impl SweepOutcome {
    pub fn refs(&self) -> Vec<RepositoryRef> {
        self.repositories
            .iter()
            .map(|r| r.repository.clone())
            .collect()
    }
}

#[derive(Clone)]
pub struct SearchService {
    client: ApiClient,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(client: ApiClient, config: SearchConfig) -> Self {
        Self { client, config }
    }

    /// A query with the configured default filters and limits
    pub fn query(&self, query: impl Into<String>) -> SearchQuery {
        SearchQuery::from_config(query, &self.config)
    }

    /// Run one query, paginating sequentially up to its result cap
    pub async fn search(&self, query: &SearchQuery, cancel: &Cancellation) -> Result<SearchOutcome> {
        query.validate()?;

        let q = query.q();
        let cap = query.result_cap() as usize;
        let page_size = query.page_size as usize;
        let mut outcome = SearchOutcome::default();
        let mut seen = HashSet::new();
        let mut consumed = 0usize;
        let mut page = 1u32;

        debug!("Searching repositories: q={:?}, cap={}", q, cap);

        loop {
            cancel.check()?;

            let response: SearchResponse<Repository> =
                self.client.get(&query.page_path(page), cancel).await?;
            outcome.pages_fetched += 1;
            outcome.total_count = response.total_count;
            outcome.incomplete |= response.incomplete_results;

            let page_len = response.items.len();
            for repo in response.items {
                if consumed >= cap {
                    break;
                }
                consumed += 1;

                if !seen.insert(repo.full_name.to_lowercase()) {
                    continue;
                }
                if !query.filters.matches(&repo) {
                    outcome.filtered_out += 1;
                    continue;
                }
                outcome
                    .repositories
                    .push(RepositorySearchResult::from_repository(repo, &q));
            }

            let exhausted = page_len == 0
                || page_len < page_size
                || consumed as u64 >= response.total_count;
            if exhausted {
                break;
            }
            if consumed >= cap {
                outcome.truncated = true;
                break;
            }
            page += 1;
        }

        if outcome.total_count > cap as u64 {
            outcome.truncated = true;
        }
        if outcome.incomplete {
            warn!("Search results for {:?} were reported incomplete", q);
        }

        debug!(
            "Search {:?}: {} results over {} pages (total {}, {} filtered)",
            q,
            outcome.repositories.len(),
            outcome.pages_fetched,
            outcome.total_count,
            outcome.filtered_out
        );

        Ok(outcome)
    }

    /// Run a discovery sweep. Queries run one after another; repositories
    /// found by several queries are kept once, with the first query's data.
    ///
    /// A failing query is recorded in its stats and the sweep continues,
    /// except for authentication failures which abort the sweep.
    pub async fn search_all(
        &self,
        queries: &[SearchQuery],
        cancel: &Cancellation,
    ) -> Result<SweepOutcome> {
        let mut sweep = SweepOutcome::default();
        let mut seen = HashSet::new();

        for query in queries {
            let q = query.q();
            let outcome = match self.search(query, cancel).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => {
                    warn!("Discovery sweep cancelled before query {:?}", q);
                    sweep.cancelled = true;
                    break;
                }
                Err(e) if e.is_batch_fatal() => return Err(e),
                Err(e) => {
                    warn!("Search query {:?} failed: {}", q, e.log_safe());
                    sweep.queries.push(QueryStats {
                        query: q,
                        total_count: 0,
                        returned: 0,
                        new_unique: 0,
                        pages_fetched: 0,
                        error: Some(e.log_safe()),
                        error_category: Some(e.category()),
                    });
                    continue;
                }
            };

            let returned = outcome.repositories.len();
            let mut new_unique = 0;
            for result in outcome.repositories {
                if seen.insert(result.repository.key()) {
                    new_unique += 1;
                    sweep.repositories.push(result);
                } else {
                    sweep.duplicates_merged += 1;
                }
            }

            sweep.queries.push(QueryStats {
                query: q,
                total_count: outcome.total_count,
                returned,
                new_unique,
                pages_fetched: outcome.pages_fetched,
                error: None,
                error_category: None,
            });
        }

        info!(
            "Discovery sweep: {} unique repositories from {} queries ({} duplicates merged)",
            sweep.repositories.len(),
            sweep.queries.len(),
            sweep.duplicates_merged
        );

        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, RetryConfig};
    use crate::github::retry::tests::RecordingSleeper;
    use crate::github::{RateLimiter, RetryPolicy};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::sync::Arc;

    fn service(base_url: &str) -> SearchService {
        let client = ApiClient::with_parts(
            ClientConfig {
                api_base_url: base_url.to_string(),
                ..ClientConfig::default()
            },
            RateLimiter::new(0),
            RetryPolicy::with_sleeper(RetryConfig::default(), Arc::new(RecordingSleeper::default())),
        )
        .unwrap();
        SearchService::new(client, SearchConfig::default())
    }

    fn item(full_name: &str, stars: u64) -> serde_json::Value {
        let (owner, name) = full_name.split_once('/').unwrap();
        json!({
            "id": stars,
            "name": name,
            "full_name": full_name,
            "owner": {"login": owner, "id": 1},
            "description": null,
            "html_url": format!("https://github.com/{full_name}"),
            "stargazers_count": stars
        })
    }

    #[tokio::test]
    async fn test_min_stars_post_filter() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "total_count": 3,
                    "incomplete_results": false,
                    "items": [item("a/one", 5), item("a/two", 15), item("a/three", 20)]
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let query = SearchQuery::new("").with_filters(SearchFilters {
            min_stars: Some(10),
            ..SearchFilters::default()
        });
        let outcome = service(&server.url())
            .search(&query, &Cancellation::none())
            .await
            .unwrap();

        let stars: Vec<u64> = outcome.repositories.iter().map(|r| r.stars).collect();
        assert_eq!(stars, vec![15, 20]);
        assert_eq!(outcome.filtered_out, 1);
        assert_eq!(outcome.pages_fetched, 1);
    }

    #[tokio::test]
    async fn test_zero_results_is_not_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"total_count": 0, "incomplete_results": false, "items": []}"#)
            .create_async()
            .await;

        let outcome = service(&server.url())
            .search(&SearchQuery::new("nothing-matches"), &Cancellation::none())
            .await
            .unwrap();
        assert!(outcome.repositories.is_empty());
        assert_eq!(outcome.total_count, 0);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_cap_stops_pagination() {
        let mut server = Server::new_async().await;
        let page1: Vec<_> = (0..3).map(|i| item(&format!("o/r{i}"), 10)).collect();
        let first = server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_status(200)
            .with_body(json!({"total_count": 50, "items": page1}).to_string())
            .expect(1)
            .create_async()
            .await;
        let page2: Vec<_> = (3..6).map(|i| item(&format!("o/r{i}"), 10)).collect();
        let second = server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(json!({"total_count": 50, "items": page2}).to_string())
            .expect(1)
            .create_async()
            .await;

        let query = SearchQuery::new("x")
            .with_page_size(3)
            .with_max_total_results(5);
        let outcome = service(&server.url())
            .search(&query, &Cancellation::none())
            .await
            .unwrap();

        assert_eq!(outcome.repositories.len(), 5);
        assert_eq!(outcome.pages_fetched, 2);
        assert!(outcome.truncated);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_query_makes_no_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let result = service(&server.url())
            .search(&SearchQuery::new("  "), &Cancellation::none())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        mock.assert_async().await;
    }
}
