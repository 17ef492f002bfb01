use crate::dedup::Deduplicator;
use crate::durable_log::DurableLog;
use crate::error::Result;
use crate::issue::{Issue, IssueState};
use crate::staleness::TrackedIssue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const STREAM_KEY: &str = "issues:discovered";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_LOG_LEN: usize = 100_000;

/// Index of open issues published so far, keyed by URL, sampled by the
/// staleness checker to find candidates worth re-checking.
pub const OPEN_ISSUES_INDEX_KEY: &str = "issues:open_index";

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub duplicates: AtomicU64,
    pub append_failures: AtomicU64,
    pub dropped_batches: AtomicU64,
}

/// Buffers normalized [`Issue`]s and flushes them to the durable log in
/// capped-size batches.
///
/// Marks a URL seen before it is durably appended (the source's ordering,
/// the consistency contract): a crash between `mark_seen` and `flush`
/// loses the issue, which resurfaces on the next strategy run. This is
/// deliberate — not a bug — and is pinned down by
/// [`tests::crash_between_mark_seen_and_flush_loses_the_issue`].
pub struct BatchPublisher {
    dedup: Arc<Deduplicator>,
    log: Arc<dyn DurableLog>,
    batch_size: usize,
    max_log_len: usize,
    buffer: Mutex<Vec<Issue>>,
    pub stats: PublisherStats,
}

impl BatchPublisher {
    pub fn new(dedup: Arc<Deduplicator>, log: Arc<dyn DurableLog>, batch_size: usize, max_log_len: usize) -> Self {
        Self {
            dedup,
            log,
            batch_size: batch_size.max(1),
            max_log_len: max_log_len.max(1),
            buffer: Mutex::new(Vec::new()),
            stats: PublisherStats::default(),
        }
    }

    /// Offers `issue` for publication. Returns `true` if it was accepted
    /// (and possibly triggered a flush), `false` if it was a duplicate or
    /// lacked a URL.
    pub async fn publish(&self, issue: Issue) -> Result<bool> {
        if issue.url.is_empty() {
            return Ok(false);
        }

        if self.dedup.is_duplicate(&issue.url).await? {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        self.dedup.mark_seen(&issue.url).await?;

        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.push(issue);
            buf.len() >= self.batch_size
        };

        if should_flush {
            self.flush().await?;
        }

        Ok(true)
    }

    /// Atomically drains the buffer and appends all records to the durable
    /// log as a pipelined batch. A no-op on an empty buffer. Retries the
    /// append once on failure; on a second failure the batch is dropped and
    /// `stats.dropped_batches` is incremented.
    pub async fn flush(&self) -> Result<usize> {
        let drained = {
            let mut buf = self.buffer.lock().await;
            std::mem::take(&mut *buf)
        };

        if drained.is_empty() {
            return Ok(0);
        }

        let batch_len = drained.len();
        let mut attempt = 0;
        loop {
            match self.append_batch(&drained).await {
                Ok(()) => {
                    self.stats.published.fetch_add(batch_len as u64, Ordering::Relaxed);
                    tracing::info!(count = batch_len, "published issues to stream");
                    return Ok(batch_len);
                }
                Err(err) if attempt == 0 => {
                    attempt += 1;
                    self.stats.append_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "log append failed, retrying once");
                }
                Err(err) => {
                    self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %err, count = batch_len, "log append failed twice, dropping batch");
                    return Ok(0);
                }
            }
        }
    }

    async fn append_batch(&self, issues: &[Issue]) -> Result<()> {
        for issue in issues {
            let payload = serde_json::to_string(issue)?;
            self.log.append(STREAM_KEY, &payload, self.max_log_len).await?;

            if issue.state == IssueState::Open {
                let tracked = TrackedIssue {
                    url: issue.url.clone(),
                    repo_owner: issue.repo_owner.clone(),
                    repo_name: issue.repo_name.clone(),
                    number: issue.number,
                };
                let index_payload = serde_json::to_string(&tracked)?;
                if let Err(err) = self.log.track_open_issue(OPEN_ISSUES_INDEX_KEY, &issue.url, &index_payload).await {
                    tracing::warn!(url = %issue.url, error = %err, "failed to index open issue for staleness checks");
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn buffer_len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}
