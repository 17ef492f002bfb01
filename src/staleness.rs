use crate::durable_log::DurableLog;
use crate::forge_client::{split_repo_path, ForgeClient, IssueStatus};
use crate::issue::IssueStateChange;
use crate::publisher::OPEN_ISSUES_INDEX_KEY;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const STATE_CHANGE_STREAM_KEY: &str = "issues:state_changes";
pub const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_CHECK_CONCURRENCY: usize = 10;

/// A previously published issue, as read back from the open-issues index the
/// batch publisher maintains. The staleness checker never re-derives this
/// from the discovery stream itself — it only samples the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub number: u64,
}

/// Periodically re-checks a batch of previously-discovered open issues and
/// emits an [`IssueStateChange`] for any that have since closed.
///
/// Grounded in the source's lightweight `check_issue_status` query: this
/// never refetches the full issue body, only state/reason/closedAt.
pub struct StalenessChecker {
    client: Arc<ForgeClient>,
    log: Arc<dyn DurableLog>,
    max_log_len: usize,
    concurrency: usize,
}

impl StalenessChecker {
    pub fn new(client: Arc<ForgeClient>, log: Arc<dyn DurableLog>, max_log_len: usize) -> Self {
        Self { client, log, max_log_len, concurrency: DEFAULT_CHECK_CONCURRENCY }
    }

    /// Samples up to `count` previously-published open issues from the
    /// index the batch publisher maintains, decoding each entry back into a
    /// [`TrackedIssue`]. Malformed entries are skipped rather than failing
    /// the whole batch.
    pub async fn sample_batch(&self, count: usize) -> Vec<TrackedIssue> {
        match self.log.sample_open_issues(OPEN_ISSUES_INDEX_KEY, count).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(_, payload)| serde_json::from_str::<TrackedIssue>(&payload).ok())
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to sample open issues for staleness check");
                Vec::new()
            }
        }
    }

    /// Checks up to `batch.len()` issues concurrently, appending a
    /// state-change record for each one found closed. Returns the number of
    /// closures recorded.
    pub async fn run(&self, batch: &[TrackedIssue]) -> usize {
        let checked = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let client = self.client.clone();
        let log = self.log.clone();
        let max_log_len = self.max_log_len;

        stream::iter(batch.to_vec())
            .for_each_concurrent(self.concurrency, |issue| {
                let client = client.clone();
                let log = log.clone();
                let checked = checked.clone();
                let closed = closed.clone();
                async move {
                    checked.fetch_add(1, Ordering::Relaxed);

                    let status = client.check_issue_status(&issue.repo_owner, &issue.repo_name, issue.number).await;

                    let (reason, closed_at) = match status {
                        IssueStatus::Open => return,
                        IssueStatus::Unknown => {
                            tracing::warn!(url = %issue.url, "staleness check could not resolve issue status");
                            return;
                        }
                        IssueStatus::Closed { reason, closed_at } => (reason, closed_at),
                    };

                    let change = IssueStateChange {
                        url: issue.url.clone(),
                        new_state: crate::issue::IssueState::Closed,
                        reason,
                        observed_at: closed_at.unwrap_or_else(Utc::now),
                    };

                    match serde_json::to_string(&change) {
                        Ok(payload) => match log.append(STATE_CHANGE_STREAM_KEY, &payload, max_log_len).await {
                            Ok(_) => {
                                closed.fetch_add(1, Ordering::Relaxed);
                                if let Err(err) = log.untrack_open_issue(OPEN_ISSUES_INDEX_KEY, &issue.url).await {
                                    tracing::warn!(url = %issue.url, error = %err, "failed to remove closed issue from open-issues index");
                                }
                            }
                            Err(err) => tracing::error!(url = %issue.url, error = %err, "failed to record state change"),
                        },
                        Err(err) => tracing::error!(error = %err, "failed to serialize state change"),
                    }
                }
            })
            .await;

        let closed = closed.load(Ordering::Relaxed);
        tracing::info!(checked = checked.load(Ordering::Relaxed), closed, "staleness check completed");
        closed
    }
}

/// Builds a [`TrackedIssue`] from a repo URL plus issue number, the shape the
/// external open-issue index is expected to hand back.
pub fn tracked_issue(url: String, repo_url: &str, number: u64) -> Option<TrackedIssue> {
    let (repo_owner, repo_name) = split_repo_path(repo_url)?;
    Some(TrackedIssue { url, repo_owner, repo_name, number })
}
