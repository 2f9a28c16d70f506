use crate::config::SearchConfig;
use crate::github::models::Repository;
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The platform never returns more than this many results for one query
pub const SEARCH_RESULT_WINDOW: u32 = 1000;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSort {
    #[default]
    #[serde(rename = "best-match", alias = "best_match")]
    BestMatch,
    Stars,
    Forks,
    Updated,
}

impl SearchSort {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            SearchSort::BestMatch => None,
            SearchSort::Stars => Some("stars"),
            SearchSort::Forks => Some("forks"),
            SearchSort::Updated => Some("updated"),
        }
    }
}

impl std::str::FromStr for SearchSort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-match" | "best_match" => Ok(SearchSort::BestMatch),
            "stars" => Ok(SearchSort::Stars),
            "forks" => Ok(SearchSort::Forks),
            "updated" => Ok(SearchSort::Updated),
            other => Err(Error::Validation(format!("Unknown sort order: {other}"))),
        }
    }
}

/// Inclusive date range; either end may be open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    /// Value part of a `pushed:` qualifier
    fn qualifier(&self) -> Option<String> {
        match (self.from, self.to) {
            (Some(from), Some(to)) => Some(format!("{from}..{to}")),
            (Some(from), None) => Some(format!(">={from}")),
            (None, Some(to)) => Some(format!("<={to}")),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub min_stars: Option<u32>,
    pub min_forks: Option<u32>,
    pub updated: Option<DateRange>,
    pub topics: Vec<String>,
    pub exclude_forks: bool,
    pub exclude_archived: bool,
}

impl SearchFilters {
    /// Search qualifiers expressing these filters server-side. The server's
    /// interpretation is approximate, so results are filtered again locally.
    pub fn qualifiers(&self) -> Vec<String> {
        let mut qualifiers = Vec::new();

        if let Some(stars) = self.min_stars {
            qualifiers.push(format!("stars:>={stars}"));
        }
        if let Some(forks) = self.min_forks {
            qualifiers.push(format!("forks:>={forks}"));
        }
        if let Some(range) = self.updated.as_ref().and_then(DateRange::qualifier) {
            qualifiers.push(format!("pushed:{range}"));
        }
        for topic in &self.topics {
            qualifiers.push(format!("topic:{topic}"));
        }
        if self.exclude_archived {
            qualifiers.push("archived:false".to_string());
        }
        if self.exclude_forks {
            qualifiers.push("fork:false".to_string());
        }

        qualifiers
    }

    /// Client-side post-filter
    pub fn matches(&self, repo: &Repository) -> bool {
        if self.exclude_forks && repo.fork {
            return false;
        }
        if self.exclude_archived && repo.archived {
            return false;
        }
        if let Some(min) = self.min_stars {
            if repo.stargazers_count < u64::from(min) {
                return false;
            }
        }
        if let Some(min) = self.min_forks {
            if repo.forks_count < u64::from(min) {
                return false;
            }
        }
        if let Some(range) = &self.updated {
            match repo.pushed_at.or(repo.updated_at) {
                Some(ts) if range.contains(ts.date_naive()) => {}
                _ => return false,
            }
        }
        self.topics
            .iter()
            .all(|topic| repo.topics.iter().any(|t| t.eq_ignore_ascii_case(topic)))
    }
}

/// One repository search. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub filters: SearchFilters,
    pub page_size: u32,
    pub max_total_results: u32,
    pub sort: SearchSort,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: SearchFilters::default(),
            page_size: MAX_PAGE_SIZE,
            max_total_results: SEARCH_RESULT_WINDOW,
            sort: SearchSort::default(),
        }
    }

    /// A query carrying the configured default filters and limits
    pub fn from_config(query: impl Into<String>, config: &SearchConfig) -> Self {
        Self {
            query: query.into(),
            filters: SearchFilters {
                min_stars: config.min_stars,
                exclude_forks: config.exclude_forks,
                exclude_archived: config.exclude_archived,
                ..SearchFilters::default()
            },
            page_size: config.max_results_per_page,
            max_total_results: config.max_total_results,
            sort: SearchSort::default(),
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_total_results(mut self, max_total_results: u32) -> Self {
        self.max_total_results = max_total_results;
        self
    }

    pub fn with_sort(mut self, sort: SearchSort) -> Self {
        self.sort = sort;
        self
    }

    /// Full `q` parameter: free text followed by qualifiers
    pub fn q(&self) -> String {
        let mut parts = Vec::new();
        let text = self.query.trim();
        if !text.is_empty() {
            parts.push(text.to_string());
        }
        parts.extend(self.filters.qualifiers());
        parts.join(" ")
    }

    /// Hard stop on consumed results, never beyond the platform's window
    pub fn result_cap(&self) -> u32 {
        self.max_total_results.min(SEARCH_RESULT_WINDOW)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(Error::Validation(format!(
                "Search page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.max_total_results == 0 {
            return Err(Error::Validation(
                "Search max_total_results must be non-zero".to_string(),
            ));
        }
        if self.q().is_empty() {
            return Err(Error::Validation(
                "Search needs a query string or at least one filter".to_string(),
            ));
        }
        Ok(())
    }

    /// API path for one page (1-based)
    pub fn page_path(&self, page: u32) -> String {
        let mut path = format!(
            "/search/repositories?q={}&per_page={}&page={}",
            urlencoding::encode(&self.q()),
            self.page_size,
            page
        );
        if let Some(sort) = self.sort.as_param() {
            path.push_str("&sort=");
            path.push_str(sort);
            path.push_str("&order=desc");
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn repo(stars: u64, fork: bool, archived: bool) -> Repository {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "tools",
            "full_name": "acme/tools",
            "owner": {"login": "acme", "id": 1},
            "description": null,
            "html_url": "https://github.com/acme/tools",
            "stargazers_count": stars,
            "forks_count": 2,
            "fork": fork,
            "archived": archived,
            "topics": ["Claude-Code", "plugins"],
            "pushed_at": "2025-03-10T08:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_qualifiers() {
        let filters = SearchFilters {
            min_stars: Some(10),
            min_forks: Some(2),
            updated: Some(DateRange {
                from: NaiveDate::from_ymd_opt(2025, 1, 1),
                to: None,
            }),
            topics: vec!["claude-code".to_string()],
            exclude_forks: true,
            exclude_archived: true,
        };
        let query = SearchQuery::new("marketplace").with_filters(filters);
        assert_eq!(
            query.q(),
            "marketplace stars:>=10 forks:>=2 pushed:>=2025-01-01 topic:claude-code archived:false fork:false"
        );
    }

    #[test]
    fn test_page_path_is_encoded() {
        let query = SearchQuery::new("path:.claude-plugin marketplace")
            .with_page_size(50)
            .with_sort(SearchSort::Stars);
        assert_eq!(
            query.page_path(2),
            "/search/repositories?q=path%3A.claude-plugin%20marketplace&per_page=50&page=2&sort=stars&order=desc"
        );
    }

    #[test]
    fn test_post_filter() {
        let filters = SearchFilters {
            min_stars: Some(10),
            exclude_forks: true,
            exclude_archived: true,
            ..SearchFilters::default()
        };
        assert!(filters.matches(&repo(15, false, false)));
        assert!(!filters.matches(&repo(5, false, false)));
        assert!(!filters.matches(&repo(15, true, false)));
        assert!(!filters.matches(&repo(15, false, true)));

        let topics = SearchFilters {
            topics: vec!["claude-code".to_string()],
            ..SearchFilters::default()
        };
        assert!(topics.matches(&repo(0, false, false)));
    }

    #[test]
    fn test_date_range_filter() {
        let in_range = SearchFilters {
            updated: Some(DateRange {
                from: NaiveDate::from_ymd_opt(2025, 3, 1),
                to: NaiveDate::from_ymd_opt(2025, 3, 31),
            }),
            ..SearchFilters::default()
        };
        assert!(in_range.matches(&repo(0, false, false)));

        let mut stale = repo(0, false, false);
        stale.pushed_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(!in_range.matches(&stale));
    }

    #[test]
    fn test_sort_from_str() {
        assert_eq!("stars".parse::<SearchSort>().unwrap(), SearchSort::Stars);
        assert_eq!("Best-Match".parse::<SearchSort>().unwrap(), SearchSort::BestMatch);
        assert!("popularity".parse::<SearchSort>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SearchQuery::new("x").validate().is_ok());
        assert!(SearchQuery::new("").validate().is_err());
        assert!(SearchQuery::new("")
            .with_filters(SearchFilters {
                min_stars: Some(10),
                ..SearchFilters::default()
            })
            .validate()
            .is_ok());
        assert!(SearchQuery::new("x").with_page_size(0).validate().is_err());
        assert!(SearchQuery::new("x").with_page_size(101).validate().is_err());
    }

    #[test]
    fn test_result_cap_respects_window() {
        assert_eq!(SearchQuery::new("x").with_max_total_results(5000).result_cap(), 1000);
        assert_eq!(SearchQuery::new("x").with_max_total_results(150).result_cap(), 150);
    }
}
