use futures::future::BoxFuture;
use marketplace_scanner::config::queries::QueryConfig;
use marketplace_scanner::config::ClientConfig;
use marketplace_scanner::github::retry::Sleeper;
use marketplace_scanner::github::{ApiClient, RateLimiter, RetryPolicy};
use marketplace_scanner::search::{SearchQuery, SearchService};
use marketplace_scanner::{Cancellation, Error, Settings};
use mockito::{Matcher, Server};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

fn service(base_url: &str) -> SearchService {
    let settings = Settings::default();
    let client = ApiClient::with_parts(
        ClientConfig {
            api_base_url: base_url.to_string(),
            ..ClientConfig::default()
        },
        RateLimiter::new(0),
        RetryPolicy::with_sleeper(settings.retry.clone(), Arc::new(NoSleep)),
    )
    .unwrap();
    SearchService::new(client, settings.search)
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

fn page_body(total: u64, items: Vec<serde_json::Value>) -> String {
    json!({
        "total_count": total,
        "incomplete_results": false,
        "items": items
    })
    .to_string()
}

#[tokio::test]
async fn test_pagination_walks_every_page_in_order() {
    let mut server = Server::new_async().await;

    let mut mocks = Vec::new();
    for (page, count) in [(1u64, 100u64), (2, 100), (3, 50)] {
        let offset = (page - 1) * 100;
        let items = (0..count)
            .map(|i| item(&format!("owner{}/repo", offset + i), offset + i))
            .collect();
        let mock = server
            .mock("GET", "/search/repositories")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "claude plugin".into()),
                Matcher::UrlEncoded("per_page".into(), "100".into()),
                Matcher::UrlEncoded("page".into(), page.to_string()),
            ]))
            .with_status(200)
            .with_body(page_body(250, items))
            .expect(1)
            .create_async()
            .await;
        mocks.push(mock);
    }

    let outcome = service(&server.url())
        .search(&SearchQuery::new("claude plugin"), &Cancellation::none())
        .await
        .unwrap();

    for mock in &mocks {
        mock.assert_async().await;
    }
    assert_eq!(outcome.pages_fetched, 3);
    assert_eq!(outcome.total_count, 250);
    assert_eq!(outcome.repositories.len(), 250);
    assert_eq!(outcome.repositories[0].repository.full_name, "owner0/repo");
    assert_eq!(outcome.repositories[249].repository.full_name, "owner249/repo");
    assert!(!outcome.truncated);
}

#[tokio::test]
async fn test_sweep_merges_duplicates_across_queries() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::UrlEncoded("q".into(), "alpha".into()))
        .with_status(200)
        .with_body(page_body(2, vec![item("acme/x", 5), item("acme/y", 6)]))
        .create_async()
        .await;
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::UrlEncoded("q".into(), "beta".into()))
        .with_status(200)
        .with_body(page_body(2, vec![item("Acme/Y", 60), item("acme/z", 7)]))
        .create_async()
        .await;

    let queries = vec![SearchQuery::new("alpha"), SearchQuery::new("beta")];
    let sweep = service(&server.url())
        .search_all(&queries, &Cancellation::none())
        .await
        .unwrap();

    let names: Vec<_> = sweep
        .repositories
        .iter()
        .map(|r| r.repository.full_name.as_str())
        .collect();
    assert_eq!(names, vec!["acme/x", "acme/y", "acme/z"]);
    // First-seen data wins
    assert_eq!(sweep.repositories[1].stars, 6);
    assert_eq!(sweep.duplicates_merged, 1);
    assert_eq!(sweep.queries.len(), 2);
    assert_eq!(sweep.queries[1].returned, 2);
    assert_eq!(sweep.queries[1].new_unique, 1);
}

#[tokio::test]
async fn test_sweep_records_failed_query_and_continues() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::UrlEncoded("q".into(), "broken".into()))
        .with_status(422)
        .with_body(r#"{"message":"Validation Failed"}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::UrlEncoded("q".into(), "fine".into()))
        .with_status(200)
        .with_body(page_body(1, vec![item("acme/x", 5)]))
        .create_async()
        .await;

    let queries = vec![SearchQuery::new("broken"), SearchQuery::new("fine")];
    let sweep = service(&server.url())
        .search_all(&queries, &Cancellation::none())
        .await
        .unwrap();

    assert_eq!(sweep.repositories.len(), 1);
    assert!(sweep.queries[0].error.is_some());
    assert!(sweep.queries[1].error.is_none());
}

#[tokio::test]
async fn test_sweep_stops_on_authentication_failure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/search/repositories")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"message":"Bad credentials"}"#)
        .expect(1)
        .create_async()
        .await;

    let queries = vec![SearchQuery::new("alpha"), SearchQuery::new("beta")];
    let result = service(&server.url())
        .search_all(&queries, &Cancellation::none())
        .await;

    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[test]
fn test_query_file_drives_sweep() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
version: 1
queries:
  - name: marketplaces
    query: "marketplace.json in:path"
    min_stars: 3
    sort: updated
  - name: off
    query: "legacy"
    enabled: false
"#,
    )
    .unwrap();

    let config = QueryConfig::from_file(file.path()).unwrap();
    let queries = config.search_queries(&Settings::default().search);

    assert_eq!(queries.len(), 1);
    assert!(queries[0].q().starts_with("marketplace.json in:path"));
    assert!(queries[0].q().contains("stars:>=3"));
    assert!(queries[0].validate().is_ok());
}
