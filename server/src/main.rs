use std::time::Duration;

use anyhow::Context;
use planflow_core::api::{router, ApiState};
use planflow_core::config::Settings;
use planflow_core::db::{init_db, DatabaseTarget};
use planflow_core::workers::Worker;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                log::warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::load_with_dotenv().context("invalid configuration")?;
    log::info!(
        "starting {} ({}) with {} provider",
        settings.app_name,
        settings.environment,
        settings.ai_provider
    );

    let db = init_db(&DatabaseTarget::from_url(&settings.database_url))?;
    let bind_addr = settings.bind_addr.clone();
    let poll = Duration::from_millis(settings.worker_poll_ms);
    let state = ApiState::from_settings(db.clone(), settings)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Worker::new(
        db,
        state.queue.clone(),
        state.charter.clone(),
        state.planner.clone(),
        poll,
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    log::info!("listening on {bind_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            log::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(err) = worker_handle.await {
        log::error!("job worker panicked: {err}");
    }
    Ok(())
}
