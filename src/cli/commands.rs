use crate::cancel::Cancellation;
use crate::config::queries::QueryConfig;
use crate::github::{parse_repository_url, ApiClient, RateBudget, RateCategory};
use crate::manifest::{ManifestFetcher, ParsedManifest, RawManifestContent};
use crate::metadata::{AssembleOptions, MetadataAssembler};
use crate::scan::{ScanReport, ScanRunner};
use crate::search::{SearchService, SearchSort};
use crate::{Error, Result, Settings};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run one repository search
pub async fn search(
    settings: &Settings,
    query: &str,
    min_stars: Option<u32>,
    topics: Vec<String>,
    sort: SearchSort,
    limit: Option<u32>,
    cancel: &Cancellation,
) -> Result<()> {
    let client = ApiClient::new(settings)?;
    let service = SearchService::new(client, settings.search.clone());

    let mut search = service.query(query).with_sort(sort);
    if min_stars.is_some() {
        search.filters.min_stars = min_stars;
    }
    search.filters.topics = topics;
    if let Some(limit) = limit {
        search = search.with_max_total_results(limit);
    }

    let outcome = service.search(&search, cancel).await?;
    info!(
        "{} repositories returned of {} matches ({} pages)",
        outcome.repositories.len(),
        outcome.total_count,
        outcome.pages_fetched
    );
    if outcome.incomplete {
        warn!("Platform reported incomplete results for '{}'", search.q());
    }

    print_json(&outcome)
}

/// Fetch one manifest, or the first configured candidate that exists
pub async fn manifest(
    settings: &Settings,
    repo: &str,
    path: Option<String>,
    cancel: &Cancellation,
) -> Result<()> {
    let repo = parse_repository_url(repo)?;
    let fetcher = ManifestFetcher::new(ApiClient::new(settings)?, settings.content.clone());

    let outcome = match path {
        Some(path) => {
            fetcher
                .fetch_manifest(&repo.owner, &repo.name, &path, cancel)
                .await?
        }
        None => {
            fetcher
                .fetch_first(&repo, &settings.scan.manifest_paths, cancel)
                .await?
        }
    };

    print_json(&outcome)
}

pub async fn metadata(
    settings: &Settings,
    repo: &str,
    base_only: bool,
    cancel: &Cancellation,
) -> Result<()> {
    let repo = parse_repository_url(repo)?;
    let assembler = MetadataAssembler::new(ApiClient::new(settings)?, settings.metadata.clone());
    let options = if base_only {
        AssembleOptions::base_only()
    } else {
        assembler.default_options()
    };

    let metadata = assembler.assemble(&repo, &options, cancel).await?;
    for (field, reason) in &metadata.partial_failures {
        warn!("{} unavailable: {}", field, reason);
    }

    print_json(&metadata)
}

/// Validate a manifest file on disk. The full report is printed either
/// way; an invalid manifest is returned as an error.
pub fn validate(settings: &Settings, file: &Path, strict: bool) -> Result<ParsedManifest> {
    let size_bytes = fs::metadata(file)?.len();
    if size_bytes > settings.content.max_file_size {
        return Err(Error::ContentTooLarge {
            size: size_bytes,
            max: settings.content.max_file_size,
        });
    }

    let mut content = settings.content.clone();
    content.strict_validation |= strict;
    let fetcher = ManifestFetcher::new(ApiClient::new(settings)?, content);

    let manifest = fetcher.parse(RawManifestContent {
        path: file.to_string_lossy().into_owned(),
        encoding: "utf-8".to_string(),
        raw: fs::read(file)?,
        size_bytes,
    })?;

    print_json(&manifest)?;

    if manifest.is_valid {
        eprintln!(
            "\x1b[32m\u{2713}\x1b[0m Valid {} manifest ({} warnings)",
            manifest.kind.map_or("unknown", |k| k.as_str()),
            manifest.warnings.len()
        );
        Ok(manifest)
    } else {
        eprintln!(
            "\x1b[31m\u{2717}\x1b[0m Invalid manifest: {} errors",
            manifest.errors.len()
        );
        manifest.into_valid()
    }
}

/// Run a scan cycle over explicit repositories, or over the repositories
/// discovered by a query file
pub async fn scan(
    settings: &Settings,
    queries: Option<&Path>,
    repos: &[String],
    cancel: &Cancellation,
) -> Result<ScanReport> {
    let runner = ScanRunner::new(ApiClient::new(settings)?, settings);

    let report = if !repos.is_empty() {
        let repos = repos
            .iter()
            .map(|r| parse_repository_url(r))
            .collect::<Result<Vec<_>>>()?;
        runner.scan_repositories(repos, cancel).await
    } else if let Some(path) = queries {
        let config = QueryConfig::from_file(path)?;
        info!(
            "Loaded {} queries ({} enabled) from {}",
            config.queries.len(),
            config.enabled().count(),
            path.display()
        );
        let queries = config.search_queries(&settings.search);
        runner.run(&queries, cancel).await
    } else {
        return Err(Error::Validation(
            "Nothing to scan: pass --queries <file> or at least one --repo".to_string(),
        ));
    };

    print_json(&report)?;
    Ok(report)
}

#[derive(Serialize)]
struct LimitsView {
    category: RateCategory,
    #[serde(flatten)]
    budget: RateBudget,
}

/// Query the platform for current budgets
pub async fn limits(settings: &Settings, cancel: &Cancellation) -> Result<()> {
    let client = ApiClient::new(settings)?;
    let budgets = client.refresh_rate_limits(cancel).await?;

    let view: Vec<LimitsView> = budgets
        .into_iter()
        .map(|(category, budget)| LimitsView { category, budget })
        .collect();

    print_json(&view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_local_plugin_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        fs::write(&path, r#"{"name": "demo-plugin", "version": "1.0.0"}"#).unwrap();

        let manifest = validate(&Settings::default(), &path, false).unwrap();
        assert!(manifest.is_valid);
        assert_eq!(manifest.name(), Some("demo-plugin"));
    }

    #[test]
    fn test_validate_rejects_invalid_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugin.json");
        fs::write(&path, r#"{"version": "1.0.0"}"#).unwrap();

        let result = validate(&Settings::default(), &path, false);
        assert!(matches!(result, Err(Error::ValidationFailed { .. })));
    }

    #[test]
    fn test_validate_checks_size_before_reading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marketplace.json");
        fs::write(&path, "x".repeat(64)).unwrap();

        let mut settings = Settings::default();
        settings.content.max_file_size = 16;
        let result = validate(&settings, &path, false);
        assert!(matches!(result, Err(Error::ContentTooLarge { size: 64, max: 16 })));
    }

    #[tokio::test]
    async fn test_scan_needs_a_source() {
        let result = scan(&Settings::default(), None, &[], &Cancellation::none()).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
