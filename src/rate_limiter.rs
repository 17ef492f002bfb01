use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const LOW_WATER: i64 = 100;
const MAX_QUOTA_WAIT: Duration = Duration::from_secs(300);
const MAX_BACKOFF_FACTOR: f64 = 32.0;
const MIN_BACKOFF_FACTOR: f64 = 1.0;

#[derive(Debug, Clone)]
struct Inner {
    remaining: i64,
    reset_at: Option<DateTime<Utc>>,
    backoff_factor: f64,
    last_request: Option<Instant>,
}

/// Enforces minimum inter-request spacing, quota preservation, and failure
/// backoff for a single [`crate::forge_client::ForgeClient`].
///
/// The limiter itself never fails; every contract it enforces is expressed as
/// a delay, never an error.
pub struct RateLimiter {
    min_interval: Duration,
    state: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(quota_limit: u32, quota_window: Duration) -> Self {
        let min_interval = quota_window / quota_limit.max(1);
        Self {
            min_interval,
            state: Mutex::new(Inner {
                remaining: quota_limit as i64,
                reset_at: None,
                backoff_factor: MIN_BACKOFF_FACTOR,
                last_request: None,
            }),
        }
    }

    /// GitHub-style default: 5000 requests per rolling hour.
    pub fn github_default() -> Self {
        Self::new(5000, Duration::from_secs(3600))
    }

    /// Blocks until a request may proceed, honoring both the minimum spacing
    /// and the low-water quota guard.
    pub async fn wait_if_needed(&self) {
        let mut st = self.state.lock().await;

        if let Some(last) = st.last_request {
            let required = self.min_interval.mul_f64(st.backoff_factor);
            let elapsed = last.elapsed();
            if elapsed < required {
                let wait = required - elapsed;
                // Release the lock while sleeping so concurrent callers aren't
                // serialized behind this one's backoff.
                drop(st);
                tokio::time::sleep(wait).await;
                st = self.state.lock().await;
            }
        }

        if st.remaining < LOW_WATER {
            if let Some(reset_at) = st.reset_at {
                let now = Utc::now();
                if reset_at > now {
                    let wait = (reset_at - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .saturating_add(Duration::from_secs(1));
                    let wait = wait.min(MAX_QUOTA_WAIT);
                    tracing::warn!(remaining = st.remaining, wait_s = wait.as_secs(), "rate limit low, waiting");
                    drop(st);
                    tokio::time::sleep(wait).await;
                    st = self.state.lock().await;
                }
            }
        }

        st.last_request = Some(Instant::now());
    }

    /// Updates remaining quota / reset time from a forge response's rate-limit
    /// metadata. Missing fields leave the prior value untouched.
    pub async fn update_from_response(&self, remaining: Option<i64>, reset_at: Option<DateTime<Utc>>) {
        let mut st = self.state.lock().await;
        if let Some(r) = remaining {
            st.remaining = r;
        }
        if let Some(r) = reset_at {
            st.reset_at = Some(r);
        }
    }

    pub async fn increase_backoff(&self) {
        let mut st = self.state.lock().await;
        st.backoff_factor = (st.backoff_factor * 2.0).min(MAX_BACKOFF_FACTOR);
    }

    pub async fn reset_backoff(&self) {
        let mut st = self.state.lock().await;
        st.backoff_factor = (st.backoff_factor / 2.0).max(MIN_BACKOFF_FACTOR);
    }

    #[cfg(test)]
    pub async fn backoff_factor(&self) -> f64 {
        self.state.lock().await.backoff_factor
    }

    #[cfg(test)]
    pub async fn remaining(&self) -> i64 {
        self.state.lock().await.remaining
    }
}
