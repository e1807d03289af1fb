use crate::{
    accrual::HttpAccrualClient,
    cli::{validate_cli, Cli},
    config::EngineConfig,
    db::{build_db_pool, run_migrations},
    jobs::{LedgerService, Throttle},
    logging::{format_error_report, init_logging},
    server::setup_server_with_addr,
    service::LoyaltyService,
    state::AppState,
    storage::pg::PgLedgerStore,
    worker::{JobQueue, Pollers, WorkerPool},
};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `cancel` on SIGTERM or SIGINT. Returns early if the token is cancelled elsewhere.
async fn handle_shutdown_signals(cancel: CancellationToken) {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(
                    event = "signal_handler_install_failed",
                    error = %err,
                    "failed to register shutdown signal handlers"
                );
                return;
            }
        };

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
    }

    cancel.cancel();
}

fn report_startup_failure(event: &'static str, what: &str, err: &(dyn std::error::Error + 'static)) {
    let error_report = format_error_report(err);
    error!(
        event,
        error = %err,
        error_report = %error_report,
        "{what}"
    );
    eprintln!("{what}: {err}");
    eprintln!("{error_report}");
}

/// Runs the reconciliation engine until a shutdown signal arrives.
///
/// Returns the process exit code: 2 for invalid arguments, 1 for startup failures.
pub async fn run_engine(cli: Cli) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("ledger_worker", "engine", &cli.log_level);
    let run_span = tracing::info_span!(
        "engine_run",
        service = %logging_context.service,
        environment = %logging_context.environment,
        mode = %logging_context.mode,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();
    info!(event = "engine_starting", "starting ledger engine");

    if let Err(err) = validate_cli(&cli) {
        eprintln!("{err}");
        return 2;
    }
    let config = match EngineConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    let migration_url = config.database_url.clone();
    match tokio::task::spawn_blocking(move || run_migrations(&migration_url)).await {
        Ok(Ok(applied)) => info!(
            event = "migrations_applied",
            count = applied.len(),
            versions = ?applied,
            "database migrations are current"
        ),
        Ok(Err(err)) => {
            report_startup_failure("migrations_failed", "failed to run migrations", &*err);
            return 1;
        }
        Err(err) => {
            report_startup_failure("migrations_failed", "migration task failed", &err);
            return 1;
        }
    }

    let pool = match build_db_pool(&config.database_url, config.db_pool_max_size) {
        Ok(pool) => pool,
        Err(err) => {
            report_startup_failure("db_pool_build_failed", "failed to build db pool", &err);
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let app_state = Arc::new(AppState::new(cancel.clone()));
    let metrics_server_handle = match setup_server_with_addr(app_state, config.metrics_bind).await
    {
        Ok(handle) => handle,
        Err(err) => {
            report_startup_failure(
                "metrics_server_start_failed",
                "failed to start metrics endpoint",
                &err,
            );
            return 1;
        }
    };

    let accrual = match HttpAccrualClient::new(config.accrual.clone()) {
        Ok(client) => client,
        Err(err) => {
            report_startup_failure(
                "accrual_client_build_failed",
                "failed to build accrual client",
                &err,
            );
            metrics_server_handle.abort();
            return 1;
        }
    };
    let store = PgLedgerStore::new(pool, config.retry, cancel.clone());
    let svc: Arc<dyn LedgerService> = Arc::new(LoyaltyService::new(store, accrual));

    let throttle = Arc::new(Throttle::new());
    let (queue, receiver) = JobQueue::bounded(config.queue_capacity);
    let mut pool_handle = tokio::spawn(
        WorkerPool::new(Arc::clone(&svc), receiver, config.workers).run(cancel.clone()),
    );
    let mut pollers = Pollers::new(svc, queue, throttle, config.pollers.clone()).spawn(&cancel);
    let signal_handle = tokio::spawn(handle_shutdown_signals(cancel.clone()));

    info!(
        event = "engine_started",
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        accrual_url = %config.accrual.base_url,
        metrics_bind = %config.metrics_bind,
        "ledger engine running"
    );

    cancel.cancelled().await;

    let drained = tokio::time::timeout(config.shutdown_grace, async {
        while pollers.join_next().await.is_some() {}
        if let Err(err) = (&mut pool_handle).await {
            error!(event = "worker_pool_join_failed", error = %err, "worker pool task failed");
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            event = "shutdown_grace_exceeded",
            grace_secs = config.shutdown_grace.as_secs(),
            "tasks still running after shutdown grace; aborting"
        );
        pollers.abort_all();
        pool_handle.abort();
    }

    signal_handle.abort();
    metrics_server_handle.abort();
    info!(event = "engine_stopped", "ledger engine stopped");
    0
}
