use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub redis_url: String,
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub batch_size: usize,
    pub max_log_len: usize,
    pub staleness_interval: Duration,
    pub staleness_batch_size: usize,
    pub lock_file: PathBuf,
    pub once: bool,
    pub dry_run: bool,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli(
        token_override: Option<String>,
        redis_url_override: Option<String>,
        max_concurrent: usize,
        request_timeout_seconds: u64,
        batch_size: usize,
        max_log_len: usize,
        staleness_interval_hours: u64,
        staleness_batch_size: usize,
        lock_file: PathBuf,
        once: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let token = token_override
            .or_else(|| std::env::var("FORGE_TOKEN").ok())
            .or_else(|| std::env::var("API_TOKEN").ok())
            .ok_or_else(|| eyre!("no forge token provided. pass --token, or set FORGE_TOKEN or API_TOKEN"))?;

        let redis_url = redis_url_override
            .or_else(|| std::env::var("LOG_URL").ok())
            .or_else(|| std::env::var("REDIS_URL").ok())
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        if max_concurrent == 0 {
            return Err(eyre!("max concurrent requests must be > 0"));
        }
        if batch_size == 0 {
            return Err(eyre!("batch size must be > 0"));
        }
        if max_log_len == 0 {
            return Err(eyre!("max log length must be > 0"));
        }

        Ok(Self {
            token,
            redis_url,
            max_concurrent,
            request_timeout: Duration::from_secs(request_timeout_seconds.max(1)),
            batch_size,
            max_log_len,
            staleness_interval: Duration::from_secs(staleness_interval_hours.max(1) * 3600),
            staleness_batch_size: staleness_batch_size.max(1),
            lock_file,
            once,
            dry_run,
        })
    }
}

#[derive(clap::Parser, Debug)]
#[command(name = "forge-discovery", version, about = "Continuous forge issue discovery pipeline")]
pub struct Args {
    /// Forge API token. If omitted, reads FORGE_TOKEN then API_TOKEN.
    #[arg(long, env = "FORGE_TOKEN")]
    pub token: Option<String>,

    /// Connection string for the durable log / shared dedup store. If
    /// omitted, reads LOG_URL then REDIS_URL, falling back to a local default.
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Max concurrent in-flight requests to the forge API.
    #[arg(long, default_value_t = 5)]
    pub max_concurrent: usize,

    /// Per-request timeout, in seconds.
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    /// Publisher batch size before an automatic flush.
    #[arg(long, default_value_t = crate::publisher::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Approximate cap on the discovery stream's length.
    #[arg(long, default_value_t = crate::publisher::DEFAULT_MAX_LOG_LEN)]
    pub max_log_len: usize,

    /// Staleness check interval, in hours.
    #[arg(long, default_value_t = 6)]
    pub staleness_interval_hours: u64,

    /// Number of tracked issues checked per staleness run.
    #[arg(long, default_value_t = crate::staleness::DEFAULT_BATCH_SIZE)]
    pub staleness_batch_size: usize,

    /// Single-instance lockfile path.
    #[arg(long, default_value = "forge-discovery.lock")]
    pub lock_file: PathBuf,

    /// Run every strategy once and exit, instead of running continuously.
    #[arg(long)]
    pub once: bool,

    /// Discover and log issues without publishing to the durable log.
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_concurrent() {
        let result = Config::from_cli(
            Some("tok".to_string()),
            Some("redis://localhost".to_string()),
            0,
            30,
            100,
            1000,
            6,
            500,
            PathBuf::from("x.lock"),
            false,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_token_with_env_unset() {
        std::env::remove_var("FORGE_TOKEN");
        std::env::remove_var("API_TOKEN");
        let result = Config::from_cli(
            None,
            Some("redis://localhost".to_string()),
            5,
            30,
            100,
            1000,
            6,
            500,
            PathBuf::from("x.lock"),
            false,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_explicit_token_override() {
        let cfg = Config::from_cli(
            Some("explicit-token".to_string()),
            Some("redis://localhost".to_string()),
            5,
            30,
            100,
            1000,
            6,
            500,
            PathBuf::from("x.lock"),
            false,
            false,
        )
        .unwrap();
        assert_eq!(cfg.token, "explicit-token");
        assert_eq!(cfg.staleness_interval, Duration::from_secs(6 * 3600));
    }
}
