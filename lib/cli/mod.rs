use crate::build_info;
use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone)]
#[command(
    about = "Loyalty ledger reconciliation worker",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    /// Postgres URL. Falls back to `DATABASE_URL`, then `DATABASE_URI`.
    #[arg(long = "database-url")]
    pub database_url: Option<String>,

    /// Accrual service base address. Falls back to `ACCRUAL_SYSTEM_ADDRESS`.
    #[arg(long = "accrual-url")]
    pub accrual_url: Option<String>,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    #[arg(long = "queue-capacity", default_value_t = 100)]
    pub queue_capacity: usize,
    #[arg(long = "batch-size", default_value_t = 30)]
    pub batch_size: i64,

    #[arg(long = "new-order-interval-ms", default_value_t = 5000)]
    pub new_order_interval_ms: u64,
    #[arg(long = "reclaim-interval-ms", default_value_t = 3000)]
    pub reclaim_interval_ms: u64,
    /// Seconds a PROCESSING claim stays valid before the order is reclaimed.
    #[arg(long = "lease-secs", default_value_t = 300)]
    pub lease_secs: u64,
    #[arg(long = "balance-interval-ms", default_value_t = 30000)]
    pub balance_interval_ms: u64,

    #[arg(long = "retry-attempts", default_value_t = 5)]
    pub retry_attempts: u32,
    #[arg(long = "retry-base-ms", default_value_t = 500)]
    pub retry_base_ms: u64,
    #[arg(long = "retry-max-ms", default_value_t = 8000)]
    pub retry_max_ms: u64,

    #[arg(long = "rate-limit-fallback-secs", default_value_t = 60)]
    pub rate_limit_fallback_secs: u64,
    #[arg(long = "accrual-timeout-ms", default_value_t = 5000)]
    pub accrual_timeout_ms: u64,
    /// Client-side cap on accrual requests per second. 0 disables the limiter.
    #[arg(long = "accrual-rps", default_value_t = 50)]
    pub accrual_rps: u32,

    #[arg(long = "shutdown-grace-secs", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    #[arg(long = "metrics-bind", default_value = "0.0.0.0:3000")]
    pub metrics_bind: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

pub fn validate_cli(cli: &Cli) -> Result<(), String> {
    if cli.workers == 0 {
        return Err("--workers must be > 0".to_string());
    }
    if cli.queue_capacity == 0 {
        return Err("--queue-capacity must be > 0".to_string());
    }
    if cli.batch_size <= 0 {
        return Err(format!("--batch-size must be > 0, got {}", cli.batch_size));
    }
    for (flag, value) in [
        ("--new-order-interval-ms", cli.new_order_interval_ms),
        ("--reclaim-interval-ms", cli.reclaim_interval_ms),
        ("--balance-interval-ms", cli.balance_interval_ms),
        ("--lease-secs", cli.lease_secs),
        ("--accrual-timeout-ms", cli.accrual_timeout_ms),
        ("--rate-limit-fallback-secs", cli.rate_limit_fallback_secs),
    ] {
        if value == 0 {
            return Err(format!("{flag} must be > 0"));
        }
    }
    if cli.retry_attempts == 0 {
        return Err("--retry-attempts must be > 0".to_string());
    }
    if cli.retry_max_ms < cli.retry_base_ms {
        return Err(format!(
            "--retry-max-ms ({}) must be >= --retry-base-ms ({})",
            cli.retry_max_ms, cli.retry_base_ms
        ));
    }
    if cli.lease_secs.saturating_mul(1000) <= cli.reclaim_interval_ms {
        return Err(format!(
            "--lease-secs ({}) must outlast --reclaim-interval-ms ({})",
            cli.lease_secs, cli.reclaim_interval_ms
        ));
    }
    cli.metrics_bind.parse::<SocketAddr>().map_err(|err| {
        format!("invalid --metrics-bind address `{}`: {err}", cli.metrics_bind)
    })?;
    Ok(())
}
