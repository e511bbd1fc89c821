use std::sync::Arc;

use anyhow::Context;

use reconcile_api::app::{AppServices, build_app};
use reconcile_api::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    reconcile_observability::init_with(&config.observability())?;

    let services = Arc::new(AppServices::from_config(&config).await?);
    let workers = services
        .spawn_workers(config.executor())
        .context("failed to start job workers")?;

    let app = build_app(Arc::clone(&services));
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(
        address = %listener.local_addr()?,
        mode = ?config.execution_mode,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = tokio::task::spawn_blocking(move || workers.shutdown()).await?;
    tracing::info!(
        processed = stats.jobs_processed,
        dead_lettered = stats.jobs_dead_lettered,
        "job workers stopped"
    );
    Ok(())
}
