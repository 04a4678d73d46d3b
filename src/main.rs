use anyhow::Context;
use chat_engine::{
    app_state::{AppState, Backends},
    config::Config,
    routes, telemetry,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::init(config.environment);

    let backends = Backends::connect(&config).await?;
    let state = AppState::new(&config, backends);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = state
        .delivery_worker(&config)
        .spawn(config.scheduler_workers, shutdown_rx);

    let app = routes::create_routes(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, environment = ?config.environment, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
