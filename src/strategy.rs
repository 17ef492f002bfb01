use crate::forge_client::ForgeClient;
use crate::issue::Issue;
use crate::publisher::BatchPublisher;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub name: &'static str,
    pub query: &'static str,
    pub priority: Priority,
    pub interval: Duration,
    pub max_results: usize,
}

/// The fixed set of discovery strategies, one search query each, run on their
/// own interval and independently coalesced by the scheduler.
pub fn discovery_strategies() -> Vec<Strategy> {
    vec![
        Strategy {
            name: "good_first_issues",
            query: r#"is:open is:issue label:"good first issue" sort:updated-desc"#,
            priority: Priority::High,
            interval: Duration::from_secs(30 * 60),
            max_results: 200,
        },
        Strategy {
            name: "help_wanted",
            query: r#"is:open is:issue label:"help wanted" sort:updated-desc"#,
            priority: Priority::High,
            interval: Duration::from_secs(30 * 60),
            max_results: 200,
        },
        Strategy {
            name: "beginner_friendly",
            query: r#"is:open is:issue label:"beginner friendly" OR label:"beginner-friendly" sort:updated-desc"#,
            priority: Priority::Medium,
            interval: Duration::from_secs(60 * 60),
            max_results: 100,
        },
        Strategy {
            name: "python_issues",
            query: r#"is:open is:issue label:"good first issue" language:python sort:stars-desc"#,
            priority: Priority::Medium,
            interval: Duration::from_secs(60 * 60),
            max_results: 100,
        },
        Strategy {
            name: "javascript_issues",
            query: r#"is:open is:issue label:"good first issue" language:javascript sort:stars-desc"#,
            priority: Priority::Medium,
            interval: Duration::from_secs(60 * 60),
            max_results: 100,
        },
        Strategy {
            name: "typescript_issues",
            query: r#"is:open is:issue label:"good first issue" language:typescript sort:stars-desc"#,
            priority: Priority::Medium,
            interval: Duration::from_secs(60 * 60),
            max_results: 100,
        },
        Strategy {
            name: "documentation",
            query: r#"is:open is:issue label:"documentation" label:"good first issue" sort:updated-desc"#,
            priority: Priority::Low,
            interval: Duration::from_secs(120 * 60),
            max_results: 50,
        },
        Strategy {
            name: "trending_repos",
            query: r#"is:open is:issue stars:>1000 label:"good first issue" sort:updated-desc"#,
            priority: Priority::Low,
            interval: Duration::from_secs(120 * 60),
            max_results: 100,
        },
    ]
}

/// Outcome of a single [`run_strategy`] call: how many issues were published,
/// and whether any publish attempt failed. The scheduler uses `had_error` to
/// keep its per-strategy error counter honest even though a single failed
/// publish doesn't abort the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyRunOutcome {
    pub published: usize,
    pub had_error: bool,
}

/// Drives one end-to-end discovery run for `strategy`: fetch, normalize,
/// publish. Every error is caught and logged here rather than propagated —
/// a single strategy's failure must never take down the scheduler loop — but
/// the outcome still reports whether one occurred so callers can track it.
pub async fn run_strategy(strategy: &Strategy, client: &ForgeClient, publisher: Arc<BatchPublisher>) -> StrategyRunOutcome {
    tracing::info!(strategy = strategy.name, "running strategy");

    let mut candidates = Vec::new();
    client
        .search_issues(strategy.query, Some(strategy.max_results), |issue| {
            candidates.push(issue);
        })
        .await;

    let outcome = publish_candidates(strategy.name, candidates, &publisher).await;
    tracing::info!(strategy = strategy.name, published = outcome.published, had_error = outcome.had_error, "strategy completed");
    outcome
}

/// Publishes every candidate issue, tallying how many were accepted and
/// whether any publish attempt failed. Split out from [`run_strategy`] so the
/// error-accounting path is exercisable without a live forge client.
async fn publish_candidates(strategy_name: &str, candidates: Vec<Issue>, publisher: &BatchPublisher) -> StrategyRunOutcome {
    let mut published = 0usize;
    let mut had_error = false;
    for issue in candidates {
        match publisher.publish(issue).await {
            Ok(true) => published += 1,
            Ok(false) => {}
            Err(err) => {
                had_error = true;
                tracing::error!(strategy = strategy_name, error = %err, "publish failed during strategy run");
            }
        }
    }
    StrategyRunOutcome { published, had_error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_eight_strategies_with_unique_names() {
        let strategies = discovery_strategies();
        assert_eq!(strategies.len(), 8);
        let mut names: Vec<_> = strategies.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn high_priority_strategies_run_most_often() {
        let strategies = discovery_strategies();
        for s in &strategies {
            if s.priority == Priority::High {
                assert_eq!(s.interval, Duration::from_secs(30 * 60));
            }
        }
    }

    #[test]
    fn every_strategy_has_a_positive_result_cap() {
        for s in discovery_strategies() {
            assert!(s.max_results > 0);
        }
    }

    use crate::dedup::Deduplicator;
    use crate::durable_log::DurableLog;
    use crate::error::{PipelineError, Result};
    use crate::issue::normalize_issue;
    use async_trait::async_trait;
    use serde_json::json;

    /// A [`DurableLog`] whose set operations always fail, used to exercise
    /// the error-accounting path in [`publish_candidates`] without touching
    /// a real forge client or store.
    #[derive(Default)]
    struct FailingLog;

    #[async_trait]
    impl DurableLog for FailingLog {
        async fn append(&self, _stream_key: &str, _payload: &str, _max_len_approx: usize) -> Result<String> {
            Err(PipelineError::DurableLog("unreachable in this test".to_string()))
        }
        async fn stream_len(&self, _stream_key: &str) -> Result<u64> {
            Ok(0)
        }
        async fn read(&self, _stream_key: &str, _count: usize) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
        async fn is_member(&self, _set_key: &str, _url: &str) -> Result<bool> {
            Err(PipelineError::DurableLog("store unavailable".to_string()))
        }
        async fn mark_seen(&self, _set_key: &str, _index_key: &str, _url: &str, _first_seen_unix: i64) -> Result<()> {
            Err(PipelineError::DurableLog("store unavailable".to_string()))
        }
        async fn seen_count(&self, _set_key: &str) -> Result<u64> {
            Ok(0)
        }
        async fn sweep_seen(&self, _set_key: &str, _index_key: &str, _older_than_unix: i64) -> Result<u64> {
            Ok(0)
        }
        async fn track_open_issue(&self, _index_key: &str, _url: &str, _payload: &str) -> Result<()> {
            Err(PipelineError::DurableLog("store unavailable".to_string()))
        }
        async fn untrack_open_issue(&self, _index_key: &str, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn sample_open_issues(&self, _index_key: &str, _count: usize) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    fn sample_issue(url: &str) -> Issue {
        let node = json!({
            "id": "I_1",
            "number": 1,
            "title": "t",
            "url": url,
            "state": "OPEN",
            "createdAt": "2024-01-01T00:00:00Z",
        });
        normalize_issue(&node).unwrap()
    }

    #[tokio::test]
    async fn publish_candidates_reports_error_when_publish_fails() {
        let log = Arc::new(FailingLog);
        let dedup = Arc::new(Deduplicator::new(log.clone()));
        let publisher = BatchPublisher::new(dedup, log, 100, 1000);

        let outcome = publish_candidates("test_strategy", vec![sample_issue("https://forge.example/a/1")], &publisher).await;

        assert_eq!(outcome.published, 0);
        assert!(outcome.had_error);
    }

    #[tokio::test]
    async fn publish_candidates_reports_no_error_on_success() {
        let log = Arc::new(crate::durable_log::InMemoryLog::new());
        let dedup = Arc::new(Deduplicator::new(log.clone()));
        let publisher = BatchPublisher::new(dedup, log, 100, 1000);

        let outcome = publish_candidates("test_strategy", vec![sample_issue("https://forge.example/a/1")], &publisher).await;

        assert_eq!(outcome.published, 1);
        assert!(!outcome.had_error);
    }
}
