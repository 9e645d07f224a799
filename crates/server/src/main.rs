use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use billsync_core::config::{AppConfig, LoadOptions};
use billsync_server::dispatch_queue::{spawn_worker, DispatchQueue};
use billsync_server::{bootstrap_with_config, logging, router, BatchScheduler};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    logging::init(&config.logging);

    let app = bootstrap_with_config(config).await?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    let (queue, worker) = match app.dispatcher.clone() {
        Some(dispatcher) => {
            let (queue, receiver) = DispatchQueue::bounded(app.config.dispatch.queue_capacity);
            (Some(queue), Some(spawn_worker(receiver, dispatcher)))
        }
        None => (None, None),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(BatchScheduler::new(
        Arc::new(app.engine()),
        Duration::from_secs(app.config.processor.interval_secs),
    ));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "billsync-server listening"
    );

    axum::serve(listener, router(app.webhook_state(queue), app.health_state()))
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "billsync-server stopping"
    );
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(grace, scheduler_handle).await.is_err() {
        tracing::warn!(
            event_name = "system.server.scheduler_shutdown_timeout",
            correlation_id = "shutdown",
            "batch still running at shutdown deadline"
        );
    }
    if let Some(worker) = worker {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(
                event_name = "system.server.dispatch_shutdown_timeout",
                correlation_id = "shutdown",
                "conversion queue not drained at shutdown deadline"
            );
        }
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            error = %error,
            "could not listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
