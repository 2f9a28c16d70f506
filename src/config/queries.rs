use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::search::{DateRange, SearchFilters, SearchQuery, SearchSort};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A discovery sweep: the list of search queries run during one scan cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub version: u32,
    pub queries: Vec<QueryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntry {
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub min_stars: Option<u32>,
    #[serde(default)]
    pub min_forks: Option<u32>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub updated_after: Option<NaiveDate>,
    #[serde(default)]
    pub updated_before: Option<NaiveDate>,
    #[serde(default)]
    pub exclude_forks: Option<bool>,
    #[serde(default)]
    pub exclude_archived: Option<bool>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub max_results: Option<u32>,
    #[serde(default)]
    pub sort: SearchSort,
}

fn default_true() -> bool {
    true
}

impl QueryEntry {
    /// Build a search query, filling unset fields from the global defaults
    pub fn to_search_query(&self, defaults: &SearchConfig) -> SearchQuery {
        let updated = match (self.updated_after, self.updated_before) {
            (None, None) => None,
            (from, to) => Some(DateRange { from, to }),
        };

        SearchQuery {
            query: self.query.clone(),
            filters: SearchFilters {
                min_stars: self.min_stars.or(defaults.min_stars),
                min_forks: self.min_forks,
                updated,
                topics: self.topics.clone(),
                exclude_forks: self.exclude_forks.unwrap_or(defaults.exclude_forks),
                exclude_archived: self.exclude_archived.unwrap_or(defaults.exclude_archived),
            },
            page_size: self.per_page.unwrap_or(defaults.max_results_per_page),
            max_total_results: self.max_results.unwrap_or(defaults.max_total_results),
            sort: self.sort,
        }
    }
}

impl QueryConfig {
    /// Load a discovery sweep from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read query config from {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: QueryConfig = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse query config from {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(Error::Config(format!(
                "Unsupported config version: {}. Expected version 1",
                self.version
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.queries {
            if entry.name.trim().is_empty() {
                return Err(Error::Config("Query name must not be empty".to_string()));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::Config(format!("Duplicate query name: {}", entry.name)));
            }
            if let Some(per_page) = entry.per_page {
                if !(1..=100).contains(&per_page) {
                    return Err(Error::Config(format!(
                        "Query '{}': per_page must be between 1 and 100",
                        entry.name
                    )));
                }
            }
            if entry.max_results == Some(0) {
                return Err(Error::Config(format!(
                    "Query '{}': max_results must be non-zero",
                    entry.name
                )));
            }
            if let (Some(from), Some(to)) = (entry.updated_after, entry.updated_before) {
                if from > to {
                    return Err(Error::Config(format!(
                        "Query '{}': updated_after is later than updated_before",
                        entry.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &QueryEntry> {
        self.queries.iter().filter(|q| q.enabled)
    }

    pub fn search_queries(&self, defaults: &SearchConfig) -> Vec<SearchQuery> {
        self.enabled().map(|q| q.to_search_query(defaults)).collect()
    }
}
