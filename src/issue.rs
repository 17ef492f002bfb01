use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Issue lifecycle state. Any forge value other than `"OPEN"` (case-insensitive)
/// is mapped to `Closed` — the normalizer never invents a third state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    fn from_forge_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("open") {
            IssueState::Open
        } else {
            IssueState::Closed
        }
    }
}

/// Normalized issue record, the unit passed through the discovery pipeline.
///
/// `url` is the dedup identity: two records with equal `url`
/// refer to the same issue regardless of any other field drift between fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub forge_id: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub url: String,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_url: String,
    pub repo_stars: u64,
    pub repo_forks: u64,
    pub repo_primary_language: Option<String>,
    pub repo_topics: Vec<String>,
    pub repo_last_push: Option<DateTime<Utc>>,
}

/// Metadata returned by `get_repo_metadata`; deliberately a separate type from
/// `Issue` since it is fetched standalone, not nested inside a search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub name_with_owner: String,
    pub stars: u64,
    pub forks: u64,
    pub primary_language: Option<String>,
    pub topics: Vec<String>,
    pub last_push: Option<DateTime<Utc>>,
}

/// Emitted by the Staleness Checker. Never mutates an `Issue` already in the
/// durable log — it is its own record type, appended alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueStateChange {
    pub url: String,
    pub new_state: IssueState,
    pub reason: Option<String>,
    pub observed_at: DateTime<Utc>,
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

/// Parses a single GraphQL search-result node into a normalized [`Issue`].
///
/// Missing nested fields default to empty collections or `None` — never to an
/// invalid sentinel.
pub fn normalize_issue(node: &Value) -> Option<Issue> {
    let url = node.get("url").and_then(Value::as_str)?.to_string();
    if url.is_empty() {
        return None;
    }

    let repo = node.get("repository").cloned().unwrap_or(Value::Null);

    let labels = node
        .get("labels")
        .and_then(|l| l.get("nodes"))
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|n| n.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let repo_topics = repo
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

    let state_raw = str_field(node, "state");
    let mut state = IssueState::from_forge_str(&state_raw);

    let created_at = parse_timestamp(node.get("createdAt").unwrap_or(&Value::Null))
        .unwrap_or_else(Utc::now);
    let updated_at = parse_timestamp(node.get("updatedAt").unwrap_or(&Value::Null))
        .unwrap_or(created_at);
    let closed_at = parse_timestamp(node.get("closedAt").unwrap_or(&Value::Null));

    // Invariant (b): closed_at implies state = closed.
    if closed_at.is_some() {
        state = IssueState::Closed;
    }

    let title = str_field(node, "title");
    if title.is_empty() {
        return None;
    }

    Some(Issue {
        forge_id: str_field(node, "id"),
        number: node.get("number").and_then(Value::as_u64).unwrap_or(0),
        title,
        body: str_field(node, "body"),
        url,
        state,
        created_at,
        updated_at,
        closed_at,
        labels,
        repo_owner: repo
            .get("owner")
            .and_then(|o| o.get("login"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        repo_name: repo.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
        repo_url: repo.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
        repo_stars: repo.get("stargazerCount").and_then(Value::as_u64).unwrap_or(0),
        repo_forks: repo.get("forkCount").and_then(Value::as_u64).unwrap_or(0),
        repo_primary_language: repo
            .get("primaryLanguage")
            .and_then(|l| l.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        repo_topics,
        repo_last_push: parse_timestamp(repo.get("pushedAt").unwrap_or(&Value::Null)),
    })
}
