use clap::Parser;
use eyre::{eyre, Result};
use forge_discovery::config::{Args, Config};
use forge_discovery::dedup::Deduplicator;
use forge_discovery::durable_log::{DurableLog, RedisLog};
use forge_discovery::forge_client::ForgeClient;
use forge_discovery::publisher::BatchPublisher;
use forge_discovery::scheduler::Scheduler;
use forge_discovery::staleness::StalenessChecker;
use forge_discovery::strategy::discovery_strategies;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fs2::FileExt;

/// Supervisor lifecycle state. Mirrors the source's scheduler start/stop
/// bookkeeping but names every phase explicitly so a crash during startup is
/// distinguishable from a clean shutdown in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let cfg = Config::from_cli(
        args.token,
        args.redis_url,
        args.max_concurrent,
        args.request_timeout,
        args.batch_size,
        args.max_log_len,
        args.staleness_interval_hours,
        args.staleness_batch_size,
        args.lock_file,
        args.once,
        args.dry_run,
    )?;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("another instance is already running ({}): {e}", cfg.lock_file.display()))?;
    let _lock_guard = lock_file;

    let mut state = RunState::Starting;
    tracing::info!(?state, dry_run = cfg.dry_run, once = cfg.once, "supervisor starting");

    let log: Arc<dyn DurableLog> = if cfg.dry_run {
        Arc::new(forge_discovery::durable_log::InMemoryLog::new())
    } else {
        Arc::new(RedisLog::connect(&cfg.redis_url).await.map_err(|e| eyre!("redis connection failed: {e}"))?)
    };

    let dedup = Arc::new(Deduplicator::new(log.clone()));
    let publisher = Arc::new(BatchPublisher::new(dedup.clone(), log.clone(), cfg.batch_size, cfg.max_log_len));
    let client = Arc::new(
        ForgeClient::new(cfg.token.clone(), cfg.max_concurrent, cfg.request_timeout)
            .map_err(|e| eyre!("failed to build forge client: {e}"))?,
    );
    let staleness = Arc::new(StalenessChecker::new(client.clone(), log.clone(), cfg.max_log_len));

    let mut scheduler = Scheduler::new(discovery_strategies(), client.clone(), publisher.clone());

    if cfg.once {
        for strategy in discovery_strategies() {
            forge_discovery::strategy::run_strategy(&strategy, &client, publisher.clone()).await;
        }
        publisher.flush().await?;
        tracing::info!("single discovery pass complete, exiting");
        return Ok(());
    }

    scheduler.start();
    state = RunState::Running;
    tracing::info!(?state, "scheduler running");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        shutdown.cancel();
    });

    let stats_interval = Duration::from_secs(60);
    let sweep_interval = Duration::from_secs(3600);
    let mut stats_ticker = tokio::time::interval(stats_interval);
    let mut sweep_ticker = tokio::time::interval(sweep_interval);
    let mut staleness_ticker = tokio::time::interval(cfg.staleness_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = stats_ticker.tick() => {
                let stats = scheduler.stats().await;
                tracing::info!(?stats, "scheduler stats");
            }
            _ = sweep_ticker.tick() => {
                match dedup.sweep_retention().await {
                    Ok(evicted) => tracing::info!(evicted, "retention sweep completed"),
                    Err(err) => tracing::warn!(error = %err, "retention sweep failed"),
                }
            }
            _ = staleness_ticker.tick() => {
                let batch = staleness.sample_batch(cfg.staleness_batch_size).await;
                tracing::info!(batch_size = batch.len(), "staleness check starting");
                let _ = staleness.run(&batch).await;
            }
        }
    }

    state = RunState::Draining;
    tracing::info!(?state, "shutting down");
    scheduler.stop().await;
    publisher.flush().await?;

    state = RunState::Stopped;
    tracing::info!(?state, "supervisor stopped");
    Ok(())
}
