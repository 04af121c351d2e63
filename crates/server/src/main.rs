mod cli;
mod command_handler;
mod db;
mod health_runner;
mod router;
mod startup;
mod state;

use std::time::Duration;

use clap::Parser;
use tracing::info;

use sluice_core::Config;
use sluice_queue::Hooks;

async fn serve(config: &Config, tick: Duration) -> anyhow::Result<()> {
    config.log_summary();
    let state = startup::build_app_state(config, Hooks::default()).await?;

    let health_loop = tokio::spawn(health_runner::run_health_check_loop(
        state.processor.clone(),
        state.scheduler.clone(),
        tick,
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    // Work queued before a restart gets a pass without waiting for the schedule.
    if !state.processor.is_queue_empty().await? {
        info!(queue = %state.processor.identifier(), "queue not empty at startup, dispatching");
        state.processor.dispatch().await?;
    }

    let app = router::build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    health_loop.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }

    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    sluice_core::config::load_dotenv();
    let cli = cli::Cli::parse();
    let config = cli.config();
    config.validate()?;

    cli::run(cli.command, &config).await
}
