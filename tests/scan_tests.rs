use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::BoxFuture;
use marketplace_scanner::error::FailureCategory;
use marketplace_scanner::github::retry::Sleeper;
use marketplace_scanner::github::{ApiClient, RateLimiter, RepositoryRef, RetryPolicy};
use marketplace_scanner::manifest::{ManifestFetcher, ManifestOutcome};
use marketplace_scanner::metadata::{AssembleOptions, MetadataAssembler};
use marketplace_scanner::scan::ScanStage;
use marketplace_scanner::search::SearchQuery;
use marketplace_scanner::{Cancellation, Error, ScanRunner, Settings};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MANIFEST_PATH: &str = ".claude-plugin/marketplace.json";

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

fn settings(server: &ServerGuard) -> Settings {
    let mut settings = Settings::default();
    settings.client.api_base_url = server.url();
    settings.retry.max_retries = 1;
    settings.scan.manifest_paths = vec![MANIFEST_PATH.to_string()];
    settings.metadata.fetch_languages = false;
    settings.metadata.fetch_contributors = false;
    settings.metadata.fetch_commits = false;
    settings
}

fn client(settings: &Settings) -> ApiClient {
    ApiClient::with_parts(
        settings.client.clone(),
        RateLimiter::new(0),
        RetryPolicy::with_sleeper(settings.retry.clone(), Arc::new(NoSleep)),
    )
    .unwrap()
}

fn repo_body(owner: &str, name: &str, stars: u64) -> String {
    json!({
        "id": stars + 1000,
        "name": name,
        "full_name": format!("{owner}/{name}"),
        "owner": {"login": owner, "id": 1},
        "description": format!("{name} repository"),
        "html_url": format!("https://github.com/{owner}/{name}"),
        "stargazers_count": stars,
        "pushed_at": "2025-06-01T00:00:00Z"
    })
    .to_string()
}

fn file_body(content: &str) -> String {
    json!({
        "name": "marketplace.json",
        "path": MANIFEST_PATH,
        "size": content.len(),
        "type": "file",
        "encoding": "base64",
        "content": STANDARD.encode(content)
    })
    .to_string()
}

fn search_body(full_names: &[&str]) -> String {
    let items: Vec<_> = full_names
        .iter()
        .enumerate()
        .map(|(i, full_name)| {
            let (owner, name) = full_name.split_once('/').unwrap();
            json!({
                "id": i,
                "name": name,
                "full_name": full_name,
                "owner": {"login": owner, "id": 1},
                "html_url": format!("https://github.com/{full_name}"),
                "stargazers_count": 10
            })
        })
        .collect();
    json!({
        "total_count": items.len(),
        "incomplete_results": false,
        "items": items
    })
    .to_string()
}

async fn mock_search(server: &mut ServerGuard, q: &str, status: usize, body: String) {
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::UrlEncoded("q".into(), q.into()))
        .with_status(status)
        .with_body(body)
        .create_async()
        .await;
}

async fn mock_repo(server: &mut ServerGuard, owner: &str, name: &str, stars: u64) {
    server
        .mock("GET", format!("/repos/{owner}/{name}").as_str())
        .with_status(200)
        .with_body(repo_body(owner, name, stars))
        .create_async()
        .await;
}

async fn mock_manifest(server: &mut ServerGuard, owner: &str, name: &str, status: usize, body: String) {
    server
        .mock(
            "GET",
            format!("/repos/{owner}/{name}/contents/{MANIFEST_PATH}").as_str(),
        )
        .with_status(status)
        .with_body(body)
        .create_async()
        .await;
}

#[tokio::test]
async fn test_scan_repositories_collects_records_and_failures() {
    let mut server = Server::new_async().await;

    mock_repo(&mut server, "acme", "tools", 40).await;
    mock_manifest(
        &mut server,
        "acme",
        "tools",
        200,
        file_body(include_str!("fixtures/marketplace.json")),
    )
    .await;

    mock_repo(&mut server, "acme", "empty", 2).await;
    mock_manifest(&mut server, "acme", "empty", 404, r#"{"message":"Not Found"}"#.into()).await;

    mock_repo(&mut server, "acme", "internal", 1).await;
    mock_manifest(
        &mut server,
        "acme",
        "internal",
        200,
        file_body(include_str!("fixtures/unsafe_marketplace.json")),
    )
    .await;

    server
        .mock("GET", "/repos/acme/gone")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .create_async()
        .await;
    mock_manifest(&mut server, "acme", "gone", 404, r#"{"message":"Not Found"}"#.into()).await;

    let settings = settings(&server);
    let runner = ScanRunner::new(client(&settings), &settings);
    let repos = ["acme/tools", "acme/empty", "acme/internal", "acme/gone"]
        .iter()
        .map(|r| RepositoryRef::from_full_name(r).unwrap())
        .collect();

    let report = runner.scan_repositories(repos, &Cancellation::none()).await;

    assert_eq!(report.candidates, 4);
    assert!(!report.cancelled);
    assert!(report.aborted.is_none());

    let names: Vec<_> = report
        .records
        .iter()
        .map(|r| r.repository.full_name.as_str())
        .collect();
    assert_eq!(names, vec!["acme/empty", "acme/internal", "acme/tools"]);

    let tools = &report.records[2];
    let manifest = tools.manifest.as_ref().expect("valid manifest attached");
    assert_eq!(manifest.name(), Some("acme-tools"));
    assert_eq!(manifest.sha256.len(), 64);
    assert!(report.records[0].manifest.is_none());
    assert!(report.records[1].manifest.is_none());

    assert_eq!(report.missing_manifests, 1);
    assert_eq!(report.invalid_manifests.len(), 1);
    let invalid = &report.invalid_manifests[0];
    assert_eq!(invalid.repository.full_name, "acme/internal");
    assert!(invalid
        .manifest
        .errors
        .iter()
        .any(|e| e.contains("disallowed host")));

    assert_eq!(
        report.failure_counts.get(&FailureCategory::ValidationFailed),
        Some(&1)
    );
    assert_eq!(report.failure_counts.get(&FailureCategory::NotFound), Some(&1));
    assert!(report.is_degraded());
}

#[tokio::test]
async fn test_scan_aborts_on_authentication_failure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/repos/".to_string()))
        .with_status(401)
        .with_body(r#"{"message":"Bad credentials"}"#)
        .create_async()
        .await;

    let mut settings = settings(&server);
    settings.scan.concurrency = 1;
    let runner = ScanRunner::new(client(&settings), &settings);
    let repos = (0..5)
        .map(|i| RepositoryRef::new("acme", format!("repo{i}")))
        .collect();

    let report = runner.scan_repositories(repos, &Cancellation::none()).await;

    assert!(report.aborted.is_some());
    assert!(report.records.is_empty());
    assert_eq!(
        report.failure_counts.get(&FailureCategory::Authentication),
        Some(&1)
    );
    // Everything after the first failure was never completed
    assert_eq!(report.failure_counts.get(&FailureCategory::Cancelled), Some(&4));
}

#[tokio::test]
async fn test_scan_with_cancelled_signal_does_no_work() {
    let server = Server::new_async().await;
    let settings = settings(&server);
    let runner = ScanRunner::new(client(&settings), &settings);

    let (handle, cancel) = Cancellation::new();
    handle.cancel();

    let report = runner
        .scan_repositories(vec![RepositoryRef::new("acme", "tools")], &cancel)
        .await;

    assert!(report.cancelled);
    assert!(report.records.is_empty());
}

#[tokio::test]
async fn test_missing_manifest_is_not_an_error() {
    let mut server = Server::new_async().await;
    mock_manifest(&mut server, "acme", "plain", 404, r#"{"message":"Not Found"}"#.into()).await;

    let settings = settings(&server);
    let fetcher = ManifestFetcher::new(client(&settings), settings.content.clone());

    let outcome = fetcher
        .fetch_manifest("acme", "plain", MANIFEST_PATH, &Cancellation::none())
        .await
        .unwrap();

    assert!(matches!(outcome, ManifestOutcome::Missing { .. }));
    assert!(!outcome.exists());
}

#[tokio::test]
async fn test_failed_languages_lookup_leaves_partial_record() {
    let mut server = Server::new_async().await;
    mock_repo(&mut server, "acme", "tools", 40).await;
    server
        .mock("GET", "/repos/acme/tools/languages")
        .with_status(500)
        .with_body("oops")
        .create_async()
        .await;

    let settings = settings(&server);
    let assembler = MetadataAssembler::new(client(&settings), settings.metadata.clone());
    let options = AssembleOptions {
        fetch_languages: true,
        ..AssembleOptions::base_only()
    };

    let metadata = assembler
        .assemble(&RepositoryRef::new("acme", "tools"), &options, &Cancellation::none())
        .await
        .unwrap();

    assert_eq!(metadata.stars, 40);
    assert!(metadata.languages.is_empty());
    assert!(metadata.is_partial());
    assert!(metadata.partial_failures.contains_key("languages"));
}

#[tokio::test]
async fn test_metadata_batch_is_keyed_by_repository() {
    let mut server = Server::new_async().await;
    mock_repo(&mut server, "acme", "one", 1).await;
    mock_repo(&mut server, "acme", "two", 2).await;
    server
        .mock("GET", "/repos/acme/missing")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .create_async()
        .await;

    let settings = settings(&server);
    let assembler = MetadataAssembler::new(client(&settings), settings.metadata.clone());
    let repos = vec![
        RepositoryRef::new("acme", "one"),
        RepositoryRef::new("acme", "missing"),
        RepositoryRef::new("acme", "two"),
    ];

    let outcome = assembler
        .get_multiple_repository_metadata(
            repos,
            &AssembleOptions::base_only(),
            &Cancellation::none(),
        )
        .await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.success_count(), 2);
    let failed: Vec<_> = outcome.failed().map(|(k, _)| k.full_name.clone()).collect();
    assert_eq!(failed, vec!["acme/missing".to_string()]);
    for (repo, metadata) in outcome.succeeded() {
        assert_eq!(repo, &metadata.repository);
    }
}

#[tokio::test]
async fn test_manifest_batch_keeps_per_repository_results() {
    let mut server = Server::new_async().await;
    mock_manifest(
        &mut server,
        "acme",
        "tools",
        200,
        file_body(include_str!("fixtures/marketplace.json")),
    )
    .await;
    mock_manifest(&mut server, "acme", "plain", 404, r#"{"message":"Not Found"}"#.into()).await;
    mock_manifest(
        &mut server,
        "acme",
        "huge",
        200,
        json!({
            "name": "marketplace.json",
            "path": MANIFEST_PATH,
            "size": 50_000_000u64,
            "type": "file",
            "encoding": "base64",
            "content": ""
        })
        .to_string(),
    )
    .await;
    mock_manifest(&mut server, "acme", "flaky", 500, "oops".into()).await;

    let mut settings = settings(&server);
    settings.content.retry_attempts = 1;
    let fetcher = ManifestFetcher::new(client(&settings), settings.content.clone());
    let repos = ["tools", "plain", "huge", "flaky"]
        .iter()
        .map(|name| RepositoryRef::new("acme", *name))
        .collect();

    let outcome = fetcher
        .fetch_multiple_manifests(repos, MANIFEST_PATH, &Cancellation::none())
        .await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.items.len(), 4);

    let results: HashMap<_, _> = outcome
        .items
        .iter()
        .map(|item| (item.key.name.as_str(), &item.result))
        .collect();
    match results["tools"] {
        Ok(ManifestOutcome::Found(manifest)) => assert_eq!(manifest.name(), Some("acme-tools")),
        other => panic!("expected a manifest, got {other:?}"),
    }
    assert!(matches!(results["plain"], Ok(ManifestOutcome::Missing { .. })));
    assert!(matches!(
        results["huge"],
        Err(Error::ContentTooLarge { size: 50_000_000, .. })
    ));
    assert!(results["flaky"].is_err());

    let counts = outcome.failure_counts();
    assert_eq!(counts.get(&FailureCategory::ContentTooLarge), Some(&1));
    assert_eq!(counts.get(&FailureCategory::TransientNetwork), Some(&1));
}

#[tokio::test]
async fn test_manifest_batch_aborts_on_authentication_failure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/repos/acme/".to_string()))
        .with_status(401)
        .with_body(r#"{"message":"Bad credentials"}"#)
        .create_async()
        .await;

    let mut settings = settings(&server);
    settings.content.concurrency = 1;
    let fetcher = ManifestFetcher::new(client(&settings), settings.content.clone());
    let repos: Vec<_> = (0..4)
        .map(|i| RepositoryRef::new("acme", format!("repo{i}")))
        .collect();

    let outcome = fetcher
        .fetch_multiple_manifests(repos, MANIFEST_PATH, &Cancellation::none())
        .await;

    assert!(outcome.aborted.is_some());
    assert!(!outcome.cancelled);
    assert_eq!(outcome.items.len(), 1);
    assert!(matches!(outcome.items[0].result, Err(Error::Authentication(_))));
    let pending: Vec<_> = outcome.pending.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(pending, vec!["repo1", "repo2", "repo3"]);
}

#[tokio::test]
async fn test_run_carries_discovery_into_scan() {
    let mut server = Server::new_async().await;
    mock_search(&mut server, "alpha", 200, search_body(&["acme/x", "acme/y"])).await;
    mock_search(&mut server, "beta", 200, search_body(&["acme/y"])).await;
    mock_search(&mut server, "broken", 500, "oops".into()).await;
    for name in ["x", "y"] {
        mock_repo(&mut server, "acme", name, 3).await;
        mock_manifest(&mut server, "acme", name, 404, r#"{"message":"Not Found"}"#.into()).await;
    }

    let settings = settings(&server);
    let runner = ScanRunner::new(client(&settings), &settings);
    let queries = vec![
        SearchQuery::new("alpha"),
        SearchQuery::new("broken"),
        SearchQuery::new("beta"),
    ];

    let report = runner.run(&queries, &Cancellation::none()).await;

    assert!(!report.cancelled);
    assert!(report.aborted.is_none());
    assert_eq!(report.discovery.len(), 3);
    assert!(report.discovery[1].error.is_some());
    assert_eq!(report.duplicates_merged, 1);
    assert_eq!(report.candidates, 2);

    let discovery: Vec<_> = report
        .failures
        .iter()
        .filter(|f| f.stage == ScanStage::Discovery)
        .collect();
    assert_eq!(discovery.len(), 1);
    assert_eq!(discovery[0].subject, "broken");
    assert_eq!(
        report.failure_counts.get(&FailureCategory::TransientNetwork),
        Some(&1)
    );

    let names: Vec<_> = report
        .records
        .iter()
        .map(|r| r.repository.full_name.as_str())
        .collect();
    assert_eq!(names, vec!["acme/x", "acme/y"]);
    assert_eq!(report.missing_manifests, 2);
}

#[tokio::test]
async fn test_run_with_cancelled_sweep_returns_early() {
    let mut server = Server::new_async().await;
    let search = server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let repos = server
        .mock("GET", Matcher::Regex(r"^/repos/".to_string()))
        .expect(0)
        .create_async()
        .await;

    let settings = settings(&server);
    let runner = ScanRunner::new(client(&settings), &settings);
    let (handle, cancel) = Cancellation::new();
    handle.cancel();

    let report = runner.run(&[SearchQuery::new("alpha")], &cancel).await;

    assert!(report.cancelled);
    assert!(report.records.is_empty());
    assert_eq!(report.candidates, 0);
    search.assert_async().await;
    repos.assert_async().await;
}
