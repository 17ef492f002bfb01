use forge_discovery::dedup::Deduplicator;
use forge_discovery::durable_log::{DurableLog, InMemoryLog};
use forge_discovery::issue::{normalize_issue, Issue};
use forge_discovery::publisher::{BatchPublisher, OPEN_ISSUES_INDEX_KEY, STREAM_KEY};
use serde_json::json;
use std::sync::Arc;

fn issue_node(url: &str, title: &str) -> serde_json::Value {
    json!({
        "id": format!("I_{url}"),
        "number": 1,
        "title": title,
        "url": url,
        "state": "OPEN",
        "createdAt": "2024-01-01T00:00:00Z",
    })
}

/// Two strategies discovering the same issue publish it exactly once, and
/// the durable log ends up with a single record carrying that issue's data.
#[tokio::test]
async fn overlapping_strategies_publish_an_issue_exactly_once() {
    let log = Arc::new(InMemoryLog::new());
    let dedup = Arc::new(Deduplicator::new(log.clone()));
    let publisher = BatchPublisher::new(dedup, log.clone(), 10, 10_000);

    let url = "https://forge.example/good-first-issue/demo/issues/7";
    let issue_a = normalize_issue(&issue_node(url, "Add docs")).unwrap();
    let issue_b = normalize_issue(&issue_node(url, "Add docs (refetched)")).unwrap();

    assert!(publisher.publish(issue_a).await.unwrap());
    assert!(!publisher.publish(issue_b).await.unwrap());

    publisher.flush().await.unwrap();
    assert_eq!(log.stream_len(STREAM_KEY).await.unwrap(), 1);

    let snapshot = log.snapshot(STREAM_KEY);
    let decoded: Issue = serde_json::from_str(&snapshot[0]).unwrap();
    assert_eq!(decoded.title, "Add docs");
}

/// A batch larger than the configured size flushes automatically partway
/// through, and any remainder still reaches the log once drained explicitly.
#[tokio::test]
async fn batch_flush_boundary_is_exact() {
    let log = Arc::new(InMemoryLog::new());
    let dedup = Arc::new(Deduplicator::new(log.clone()));
    let publisher = BatchPublisher::new(dedup, log.clone(), 3, 10_000);

    for i in 0..7 {
        let url = format!("https://forge.example/demo/issues/{i}");
        let issue = normalize_issue(&issue_node(&url, "t")).unwrap();
        publisher.publish(issue).await.unwrap();
    }

    // 7 published with batch size 3: two full batches auto-flushed (6),
    // one left buffered until an explicit flush.
    assert_eq!(log.stream_len(STREAM_KEY).await.unwrap(), 6);
    publisher.flush().await.unwrap();
    assert_eq!(log.stream_len(STREAM_KEY).await.unwrap(), 7);
}

/// A URL that fell out of the shared seen-set via the retention sweep is
/// legitimately rediscoverable — eviction, not a dedup bug.
#[tokio::test]
async fn sweep_retention_allows_rediscovery_after_expiry() {
    let log = Arc::new(InMemoryLog::new());
    let dedup = Deduplicator::new(log.clone());

    let url = "https://forge.example/demo/issues/99";
    dedup.mark_seen(url).await.unwrap();
    assert!(dedup.is_duplicate(url).await.unwrap());

    // Force eviction by sweeping with a cutoff far in the future.
    let future_cutoff = chrono::Utc::now() + chrono::Duration::days(365);
    log.sweep_seen(
        forge_discovery::dedup::SEEN_SET_KEY,
        forge_discovery::dedup::SEEN_INDEX_KEY,
        future_cutoff.timestamp(),
    )
    .await
    .unwrap();

    assert!(!log.is_member(forge_discovery::dedup::SEEN_SET_KEY, url).await.unwrap());
}

/// Issues lacking a title or URL are silently dropped by normalization and
/// never reach the publisher at all.
#[tokio::test]
async fn malformed_nodes_never_reach_the_log() {
    let log = Arc::new(InMemoryLog::new());
    let dedup = Arc::new(Deduplicator::new(log.clone()));
    let publisher = BatchPublisher::new(dedup, log.clone(), 10, 10_000);

    let missing_title = json!({
        "id": "I_1",
        "number": 1,
        "title": "",
        "url": "https://forge.example/demo/issues/1",
        "state": "OPEN",
        "createdAt": "2024-01-01T00:00:00Z",
    });
    assert!(normalize_issue(&missing_title).is_none());

    publisher.flush().await.unwrap();
    assert_eq!(log.stream_len(STREAM_KEY).await.unwrap(), 0);
}

/// A published open issue is sampled into a tracked batch and, once the
/// staleness checker observes it closed, drops out of the open-issues index
/// so later sweeps don't keep re-reporting it.
#[tokio::test]
async fn published_issue_flows_through_the_open_issues_index_to_a_state_change() {
    use forge_discovery::forge_client::ForgeClient;
    use forge_discovery::staleness::{StalenessChecker, TrackedIssue};
    use std::time::Duration;

    let log = Arc::new(InMemoryLog::new());
    let dedup = Arc::new(Deduplicator::new(log.clone()));
    let publisher = BatchPublisher::new(dedup, log.clone(), 1, 10_000);

    let url = "https://forge.example/rust-lang/rust/issues/1";
    let node = json!({
        "id": "I_1",
        "number": 1,
        "title": "Fix the thing",
        "url": url,
        "state": "OPEN",
        "createdAt": "2024-01-01T00:00:00Z",
        "repository": { "owner": { "login": "rust-lang" }, "name": "rust" },
    });
    let issue = normalize_issue(&node).unwrap();
    assert!(publisher.publish(issue).await.unwrap());

    let sampled = log.sample_open_issues(OPEN_ISSUES_INDEX_KEY, 10).await.unwrap();
    assert_eq!(sampled.len(), 1);
    let tracked: TrackedIssue = serde_json::from_str(&sampled[0].1).unwrap();
    assert_eq!(tracked.url, url);
    assert_eq!(tracked.repo_owner, "rust-lang");

    let client = Arc::new(ForgeClient::new("tok".to_string(), 1, Duration::from_secs(5)).unwrap());
    let checker = StalenessChecker::new(client, log.clone(), 10_000);
    let batch = checker.sample_batch(10).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].url, url);

    // Exercise the untrack path the way a confirmed closure inside
    // `StalenessChecker::run` would trigger, without a real network call.
    log.untrack_open_issue(OPEN_ISSUES_INDEX_KEY, url).await.unwrap();
    assert!(log.sample_open_issues(OPEN_ISSUES_INDEX_KEY, 10).await.unwrap().is_empty());
}
