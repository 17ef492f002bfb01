use crate::durable_log::DurableLog;
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

pub const SEEN_SET_KEY: &str = "issues:seen_urls";
pub const SEEN_INDEX_KEY: &str = "issues:seen_urls:index";

/// 30-day guarantee: any URL published within this window must still
/// be reported as seen.
pub const RETENTION: chrono::Duration = chrono::Duration::days(30);

/// Two-tier deduplicator keyed by canonical URL.
///
/// The local tier avoids a network round-trip for the common case of a
/// duplicate re-surfacing within the same process; the shared tier (backed by
/// [`DurableLog`]) gives correctness across restarts and horizontal workers.
pub struct Deduplicator {
    local: Mutex<HashSet<String>>,
    shared: Arc<dyn DurableLog>,
}

impl Deduplicator {
    pub fn new(shared: Arc<dyn DurableLog>) -> Self {
        Self {
            local: Mutex::new(HashSet::new()),
            shared,
        }
    }

    /// Checks the local set, then falls back to the shared set on a miss.
    /// A shared-tier hit is cached locally so the next check avoids the
    /// round-trip.
    pub async fn is_duplicate(&self, url: &str) -> Result<bool> {
        if self.local.lock().unwrap().contains(url) {
            return Ok(true);
        }

        if self.shared.is_member(SEEN_SET_KEY, url).await? {
            self.local.lock().unwrap().insert(url.to_string());
            return Ok(true);
        }

        Ok(false)
    }

    /// Adds `url` to both tiers. Calling this twice for the same URL is
    /// equivalent to calling it once.
    pub async fn mark_seen(&self, url: &str) -> Result<()> {
        self.local.lock().unwrap().insert(url.to_string());
        let first_seen = chrono::Utc::now().timestamp();
        self.shared
            .mark_seen(SEEN_SET_KEY, SEEN_INDEX_KEY, url, first_seen)
            .await
    }

    /// Hourly retention sweep: evicts entries whose first-seen
    /// timestamp is older than the 30-day guarantee window.
    pub async fn sweep_retention(&self) -> Result<u64> {
        let cutoff = (chrono::Utc::now() - RETENTION).timestamp();
        self.shared.sweep_seen(SEEN_SET_KEY, SEEN_INDEX_KEY, cutoff).await
    }

    #[cfg(test)]
    pub fn local_len(&self) -> usize {
        self.local.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_log::InMemoryLog;

    fn dedup() -> Deduplicator {
        Deduplicator::new(Arc::new(InMemoryLog::new()))
    }

    #[tokio::test]
    async fn fresh_url_is_not_a_duplicate() {
        let d = dedup();
        assert!(!d.is_duplicate("https://forge.example/a/b/issues/1").await.unwrap());
    }

    #[tokio::test]
    async fn marked_url_is_a_duplicate() {
        let d = dedup();
        d.mark_seen("u1").await.unwrap();
        assert!(d.is_duplicate("u1").await.unwrap());
    }

    #[tokio::test]
    async fn shared_hit_populates_local_cache() {
        let shared = Arc::new(InMemoryLog::new());
        shared.mark_seen(SEEN_SET_KEY, SEEN_INDEX_KEY, "u1", 0).await.unwrap();
        let d = Deduplicator::new(shared);
        assert_eq!(d.local_len(), 0);
        assert!(d.is_duplicate("u1").await.unwrap());
        assert_eq!(d.local_len(), 1);
    }

    #[tokio::test]
    async fn mark_seen_twice_is_idempotent() {
        let d = dedup();
        d.mark_seen("u1").await.unwrap();
        d.mark_seen("u1").await.unwrap();
        assert_eq!(d.local_len(), 1);
    }
}
