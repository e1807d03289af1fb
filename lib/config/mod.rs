use std::env;
use std::net::{AddrParseError, SocketAddr};
use std::num::NonZeroU32;
use std::time::Duration;

use thiserror::Error;

use crate::accrual::AccrualClientConfig;
use crate::cli::Cli;
use crate::storage::retry::RetryPolicy;
use crate::worker::PollerConfig;

const DEFAULT_ACCRUAL_URL: &str = "http://localhost:8085";
const DB_POOL_MAX_SIZE_CAP: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL is required (env var, DATABASE_URI or --database-url)")]
    MissingDatabaseUrl,

    #[error("invalid metrics bind address `{value}`: {source}")]
    InvalidMetricsBind {
        value: String,
        #[source]
        source: AddrParseError,
    },
}

/// Fully resolved runtime settings for one engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub db_pool_max_size: usize,
    pub accrual: AccrualClientConfig,
    pub workers: usize,
    pub queue_capacity: usize,
    pub pollers: PollerConfig,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
    pub metrics_bind: SocketAddr,
}

impl EngineConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_cli_with_env(cli, |key| env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_cli`] with an injectable environment lookup.
    pub fn from_cli_with_env(
        cli: &Cli,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let database_url = cli
            .database_url
            .clone()
            .or_else(|| lookup("DATABASE_URL"))
            .or_else(|| lookup("DATABASE_URI"))
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let accrual_url = cli
            .accrual_url
            .clone()
            .or_else(|| lookup("ACCRUAL_SYSTEM_ADDRESS"))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ACCRUAL_URL.to_string());

        let metrics_bind = cli.metrics_bind.parse::<SocketAddr>().map_err(|source| {
            ConfigError::InvalidMetricsBind {
                value: cli.metrics_bind.clone(),
                source,
            }
        })?;

        let base_delay = Duration::from_millis(cli.retry_base_ms);
        Ok(Self {
            database_url,
            // Workers, pollers and the store share the pool.
            db_pool_max_size: (cli.workers + 3).min(DB_POOL_MAX_SIZE_CAP),
            accrual: AccrualClientConfig {
                base_url: normalize_accrual_url(&accrual_url),
                timeout: Duration::from_millis(cli.accrual_timeout_ms),
                rate_limit_fallback: Duration::from_secs(cli.rate_limit_fallback_secs),
                requests_per_second: NonZeroU32::new(cli.accrual_rps),
            },
            workers: cli.workers,
            queue_capacity: cli.queue_capacity,
            pollers: PollerConfig {
                batch_size: cli.batch_size,
                new_order_interval: Duration::from_millis(cli.new_order_interval_ms),
                reclaim_interval: Duration::from_millis(cli.reclaim_interval_ms),
                lease: Duration::from_secs(cli.lease_secs),
                balance_interval: Duration::from_millis(cli.balance_interval_ms),
            },
            retry: RetryPolicy {
                max_attempts: cli.retry_attempts,
                base_delay,
                max_delay: Duration::from_millis(cli.retry_max_ms),
                jitter: base_delay / 10,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            metrics_bind,
        })
    }
}

/// Accepts bare `host:port` addresses by assuming plain HTTP.
pub fn normalize_accrual_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
