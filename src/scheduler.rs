use crate::forge_client::ForgeClient;
use crate::publisher::BatchPublisher;
use crate::strategy::{run_strategy, Strategy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct StrategyStats {
    pub last_run: Option<DateTime<Utc>>,
    pub issues_discovered: u64,
    pub runs: u64,
    pub errors: u64,
}

/// Owns one worker task per strategy and the shared stats map they report
/// into. Each worker fires on its own `tokio::time::interval` and also
/// listens on a capacity-1 trigger channel, so a manual [`Scheduler::trigger`]
/// and the periodic timer drive the same execution path.
///
/// `max_instances=1` plus coalescing (the source's APScheduler job options)
/// is reproduced here structurally: the trigger channel has capacity one and
/// is fed with `try_send`, so a trigger arriving while a run is in flight is
/// silently dropped rather than queued — at most one extra run is ever
/// pending per strategy.
pub struct Scheduler {
    strategies: Vec<Strategy>,
    client: Arc<ForgeClient>,
    publisher: Arc<BatchPublisher>,
    stats: Arc<RwLock<HashMap<&'static str, StrategyStats>>>,
    triggers: HashMap<&'static str, mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(strategies: Vec<Strategy>, client: Arc<ForgeClient>, publisher: Arc<BatchPublisher>) -> Self {
        let stats = strategies
            .iter()
            .map(|s| (s.name, StrategyStats::default()))
            .collect();

        Self {
            strategies,
            client,
            publisher,
            stats: Arc::new(RwLock::new(stats)),
            triggers: HashMap::new(),
            handles: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns one worker task per strategy. Idempotent: a second call is a
    /// no-op if workers are already running.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        for strategy in self.strategies.clone() {
            let (tx, rx) = mpsc::channel(1);
            self.triggers.insert(strategy.name, tx);

            let client = self.client.clone();
            let publisher = self.publisher.clone();
            let stats = self.stats.clone();
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(run_worker(strategy, client, publisher, stats, rx, cancel));
            self.handles.push(handle);
        }

        tracing::info!(count = self.handles.len(), "scheduler started");
    }

    /// Requests an out-of-cycle run of `strategy_name`. Returns `false` if no
    /// such strategy exists, or if a run is already queued or in flight
    /// (coalesced, matching the source's `trigger_strategy`).
    pub fn trigger(&self, strategy_name: &str) -> bool {
        match self.triggers.get(strategy_name) {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }

    pub async fn stats(&self) -> HashMap<&'static str, StrategyStats> {
        self.stats.read().await.clone()
    }

    /// Signals every worker to stop after its current run and awaits them.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        self.triggers.clear();
        tracing::info!("scheduler stopped");
    }
}

async fn run_worker(
    strategy: Strategy,
    client: Arc<ForgeClient>,
    publisher: Arc<BatchPublisher>,
    stats: Arc<RwLock<HashMap<&'static str, StrategyStats>>>,
    mut trigger_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(strategy.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so every strategy doesn't run at boot.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {},
            Some(()) = trigger_rx.recv() => {},
        }

        let start = Utc::now();
        let outcome = run_strategy(&strategy, &client, publisher.clone()).await;

        let mut guard = stats.write().await;
        let entry = guard.entry(strategy.name).or_default();
        entry.last_run = Some(start);
        entry.issues_discovered += outcome.published as u64;
        entry.runs += 1;
        if outcome.had_error {
            entry.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Deduplicator;
    use crate::durable_log::InMemoryLog;
    use std::time::Duration;

    fn test_strategy(name: &'static str, interval_ms: u64) -> Strategy {
        Strategy {
            name,
            query: "is:open",
            priority: crate::strategy::Priority::High,
            interval: Duration::from_millis(interval_ms),
            max_results: 10,
        }
    }

    fn test_publisher() -> Arc<BatchPublisher> {
        let log = Arc::new(InMemoryLog::new());
        let dedup = Arc::new(Deduplicator::new(log.clone()));
        Arc::new(BatchPublisher::new(dedup, log, 100, 1000))
    }

    #[tokio::test]
    async fn trigger_on_unknown_strategy_returns_false() {
        let client = Arc::new(ForgeClient::new("tok".to_string(), 1, Duration::from_secs(5)).unwrap());
        let mut scheduler = Scheduler::new(vec![test_strategy("a", 60_000)], client, test_publisher());
        scheduler.start();
        assert!(!scheduler.trigger("does_not_exist"));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stats_start_empty_for_every_registered_strategy() {
        let client = Arc::new(ForgeClient::new("tok".to_string(), 1, Duration::from_secs(5)).unwrap());
        let strategies = vec![test_strategy("a", 60_000), test_strategy("b", 60_000)];
        let scheduler = Scheduler::new(strategies, client, test_publisher());
        let stats = scheduler.stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["a"].runs, 0);
    }

    #[tokio::test]
    async fn second_trigger_before_first_drains_is_coalesced() {
        let client = Arc::new(ForgeClient::new("tok".to_string(), 1, Duration::from_secs(5)).unwrap());
        let mut scheduler = Scheduler::new(vec![test_strategy("a", 3_600_000)], client, test_publisher());
        // Wire the trigger channel directly, without spawning the worker
        // task, so this test exercises only the coalescing semantics of the
        // channel (capacity one, non-blocking send) and never performs a
        // real network call.
        let (tx, _rx) = mpsc::channel(1);
        scheduler.triggers.insert("a", tx);

        let first = scheduler.trigger("a");
        let second = scheduler.trigger("a");
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn stop_is_safe_to_call_before_start() {
        let client = Arc::new(ForgeClient::new("tok".to_string(), 1, Duration::from_secs(5)).unwrap());
        let mut scheduler = Scheduler::new(vec![test_strategy("a", 60_000)], client, test_publisher());
        scheduler.stop().await;
    }
}
