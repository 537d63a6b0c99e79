mod api;
mod auth;
mod concurrency;
mod scheduler;
mod shutdown;
mod state;

use std::sync::Arc;

use pulse_domain::config::{DaemonConfig, HttpConfig, LogConfig, StoreConfig};
use pulse_executor::Executor;
use pulse_queue::Queue;
use pulse_store::Store;
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::concurrency::ConcurrencyGuard;
use crate::scheduler::SchedulerConfig;
use crate::shutdown::Shutdown;
use crate::state::AppState;

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = LogConfig::from_env();
    init_tracing(&log_config);

    // Refuses to start unauthenticated: there is no dev-mode fallback here.
    let http_config = HttpConfig::from_env()?;
    let store_config = StoreConfig::from_env();
    let daemon_config = Arc::new(DaemonConfig::from_env());

    let store = Arc::new(Store::open(&store_config.db_path)?);
    let queue = Arc::new(Queue::new(store));

    let stale_threshold = chrono::Duration::seconds(daemon_config.stale_processing_secs);
    let reset = queue.reconcile_orphaned(stale_threshold).await?;
    if reset > 0 {
        info!(reset, "reconciled orphaned pulses on startup");
    }

    let concurrency = Arc::new(ConcurrencyGuard::new(daemon_config.max_concurrent as u32));
    let api_token_hash = Sha256::digest(http_config.api_token.as_bytes()).to_vec();
    let app_state = AppState::new(queue.clone(), concurrency.clone(), api_token_hash, daemon_config.clone());

    let executor = Arc::new(Executor::new(daemon_config.runner_command.clone()));
    let shutdown = Arc::new(Shutdown::new());

    let app = api::router(app_state);
    let addr = format!("{}:{}", http_config.host, http_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP ingress listening");

    let http_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        http_shutdown.wait().await;
    });

    let scheduler_config = SchedulerConfig {
        tick: std::time::Duration::from_millis(daemon_config.tick_ms),
        batch_limit: daemon_config.batch_limit,
        shutdown_grace: std::time::Duration::from_secs(daemon_config.shutdown_grace_secs),
        executor_timeout: std::time::Duration::from_secs(daemon_config.executor_timeout_secs),
        desk_path: daemon_config.desk_path.clone(),
    };
    let scheduler_task = tokio::spawn(scheduler::run(
        scheduler_config,
        queue,
        executor,
        concurrency,
        shutdown.clone(),
    ));

    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown::signal_received().await;
            info!("shutdown signal received");
            shutdown.trigger();
        })
    };

    let server_result = server.await;
    shutdown.trigger();
    let _ = scheduler_task.await;
    signal_task.abort();

    server_result?;
    info!("pulse-daemon exited cleanly");
    Ok(())
}
