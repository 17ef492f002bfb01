use crate::issue::{normalize_issue, Issue, RepoMetadata};
use crate::rate_limiter::RateLimiter;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Semaphore;

const GRAPHQL_URL: &str = "https://api.github.com/graphql";
const DEFAULT_RETRIES: u32 = 3;
const SEARCH_PAGE_SIZE: usize = 100;

const SEARCH_ISSUES_QUERY: &str = r#"
query SearchIssues($query: String!, $first: Int!, $after: String) {
  rateLimit { limit cost remaining resetAt }
  search(query: $query, type: ISSUE, first: $first, after: $after) {
    issueCount
    pageInfo { endCursor hasNextPage }
    edges {
      node {
        ... on Issue {
          id number title body url state createdAt updatedAt closedAt
          labels(first: 10) { nodes { name } }
          repository {
            nameWithOwner
            owner { login }
            name
            url
            stargazerCount
            forkCount
            primaryLanguage { name }
            repositoryTopics(first: 10) { nodes { topic { name } } }
            pushedAt
          }
        }
      }
    }
  }
}
"#;

const CHECK_ISSUE_STATUS_QUERY: &str = r#"
query CheckIssueStatus($owner: String!, $repo: String!, $number: Int!) {
  repository(owner: $owner, name: $repo) {
    issue(number: $number) { state stateReason closedAt }
  }
  rateLimit { remaining resetAt }
}
"#;

const GET_REPO_METADATA_QUERY: &str = r#"
query GetRepoMetadata($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    nameWithOwner
    stargazerCount
    forkCount
    pushedAt
    primaryLanguage { name }
    repositoryTopics(first: 20) { nodes { topic { name } } }
  }
  rateLimit { remaining resetAt }
}
"#;

/// Outcome of [`check_issue_status`](ForgeClient::check_issue_status) when the
/// underlying query could not be resolved (deleted issue, repo renamed away,
/// or the query failed after retries). Distinguished from `Open`/`Closed` so
/// the staleness checker never mistakes "don't know" for "still open".
#[derive(Debug, Clone, PartialEq)]
pub enum IssueStatus {
    Open,
    Closed { reason: Option<String>, closed_at: Option<DateTime<Utc>> },
    Unknown,
}

/// Async GraphQL client for a single forge (GitHub-shaped API), with cursor
/// pagination, bounded concurrency, and rate-limit-aware retry.
///
/// Mirrors the source's `GitHubStreamClient`: one HTTP client, one
/// [`RateLimiter`], and a semaphore capping in-flight requests regardless of
/// how many strategies are driving the client concurrently.
pub struct ForgeClient {
    http: reqwest::Client,
    token: String,
    rate_limiter: RateLimiter,
    semaphore: Semaphore,
}

impl ForgeClient {
    pub fn new(token: String, max_concurrent: usize, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            token,
            rate_limiter: RateLimiter::github_default(),
            semaphore: Semaphore::new(max_concurrent.max(1)),
        })
    }

    /// Searches issues matching `query`, normalizing each result and invoking
    /// `on_issue` as pages arrive. Stops once `max_results` records have been
    /// yielded, or the forge reports no further pages.
    pub async fn search_issues<F>(&self, query: &str, max_results: Option<usize>, mut on_issue: F) -> usize
    where
        F: FnMut(Issue),
    {
        let mut cursor: Option<String> = None;
        let mut yielded = 0usize;
        let page_size = max_results.map(|m| m.min(SEARCH_PAGE_SIZE)).unwrap_or(SEARCH_PAGE_SIZE);

        loop {
            let variables = json!({ "query": query, "first": page_size, "after": cursor });
            let data = self.execute_query(SEARCH_ISSUES_QUERY, variables).await;

            let edges = data
                .get("search")
                .and_then(|s| s.get("edges"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if edges.is_empty() {
                break;
            }

            for edge in &edges {
                let Some(node) = edge.get("node") else { continue };
                if let Some(issue) = normalize_issue(node) {
                    on_issue(issue);
                    yielded += 1;
                    if let Some(max) = max_results {
                        if yielded >= max {
                            return yielded;
                        }
                    }
                }
            }

            let page_info = data.get("search").and_then(|s| s.get("pageInfo"));
            let has_next = page_info.and_then(|p| p.get("hasNextPage")).and_then(Value::as_bool).unwrap_or(false);
            if !has_next {
                break;
            }
            cursor = page_info
                .and_then(|p| p.get("endCursor"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        yielded
    }

    /// Lightweight status check for a single issue, used by the staleness
    /// checker to avoid refetching the full search payload.
    pub async fn check_issue_status(&self, owner: &str, repo: &str, number: u64) -> IssueStatus {
        let variables = json!({ "owner": owner, "repo": repo, "number": number });
        let data = self.execute_query(CHECK_ISSUE_STATUS_QUERY, variables).await;

        let Some(issue) = data.get("repository").and_then(|r| r.get("issue")) else {
            return IssueStatus::Unknown;
        };
        if issue.is_null() {
            return IssueStatus::Unknown;
        }

        let state = issue.get("state").and_then(Value::as_str).unwrap_or("").to_ascii_uppercase();
        if state == "OPEN" {
            return IssueStatus::Open;
        }

        let reason = issue.get("stateReason").and_then(Value::as_str).map(str::to_string);
        let closed_at = issue
            .get("closedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        IssueStatus::Closed { reason, closed_at }
    }

    pub async fn get_repo_metadata(&self, owner: &str, name: &str) -> Option<RepoMetadata> {
        let variables = json!({ "owner": owner, "name": name });
        let data = self.execute_query(GET_REPO_METADATA_QUERY, variables).await;
        let repo = data.get("repository")?;
        if repo.is_null() {
            return None;
        }

        let topics = repo
            .get("repositoryTopics")
            .and_then(|t| t.get("nodes"))
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("topic").and_then(|t| t.get("name")).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(RepoMetadata {
            name_with_owner: repo.get("nameWithOwner").and_then(Value::as_str).unwrap_or("").to_string(),
            stars: repo.get("stargazerCount").and_then(Value::as_u64).unwrap_or(0),
            forks: repo.get("forkCount").and_then(Value::as_u64).unwrap_or(0),
            primary_language: repo
                .get("primaryLanguage")
                .and_then(|l| l.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            topics,
            last_push: repo
                .get("pushedAt")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    /// Executes a single GraphQL request with retry on transient failure.
    /// Returns an empty object on total failure so callers never need to
    /// special-case "no data" versus "error" — both read as absent fields.
    async fn execute_query(&self, query: &str, variables: Value) -> Value {
        self.rate_limiter.wait_if_needed().await;
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        for attempt in 0..DEFAULT_RETRIES {
            let body = json!({ "query": query, "variables": variables });
            let sent = self
                .http
                .post(GRAPHQL_URL)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "forge request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5 * (attempt as u64 + 1))).await;
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                let parsed: Value = match response.json().await {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to decode forge response body");
                        return Value::Object(Default::default());
                    }
                };

                if let Some(rate_limit) = parsed.get("data").and_then(|d| d.get("rateLimit")) {
                    let remaining = rate_limit.get("remaining").and_then(Value::as_i64);
                    let reset_at = rate_limit
                        .get("resetAt")
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc));
                    self.rate_limiter.update_from_response(remaining, reset_at).await;
                }

                if let Some(errors) = parsed.get("errors") {
                    tracing::warn!(?errors, "forge returned graphql errors alongside data");
                }

                self.rate_limiter.reset_backoff().await;
                return parsed.get("data").cloned().unwrap_or(Value::Object(Default::default()));
            }

            if status.as_u16() == 403 {
                tracing::warn!("forge rate limited (403), backing off");
                self.rate_limiter.increase_backoff().await;
                tokio::time::sleep(Duration::from_secs(60 * (attempt as u64 + 1))).await;
                continue;
            }

            if status.is_server_error() {
                tracing::warn!(status = %status, attempt, "forge server error, retrying");
                tokio::time::sleep(Duration::from_secs(5 * (attempt as u64 + 1))).await;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "forge request failed, not retrying");
            return Value::Object(Default::default());
        }

        Value::Object(Default::default())
    }
}

pub fn split_repo_path(repo_url: &str) -> Option<(String, String)> {
    let trimmed = repo_url.trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let repo = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    Some((owner, repo))
}
