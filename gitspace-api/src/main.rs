use anyhow::{Context, Result};
use gitspace_api::{create_app, AppState, Config, Engine};
use gitspace_orchestrator::db::{backup_database, create_pool, run_migrations};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file output is flushed on exit
    let _log_guard = gitspace_logging::init_subscriber();

    info!("Starting gitspace-api service...");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: bind_addr={}, db_path={}",
        config.bind_addr,
        config.db_path.display()
    );

    // Backup before migrations
    if let Some(backup_path) = backup_database(&config.db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(&config.db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let engine = Engine::build(&config, pool)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = engine.start_consumers(shutdown_rx);
    info!("Started {} event consumers", consumers.len());

    let app = create_app(AppState::new(engine.service.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal, stopping gracefully");
        })
        .await
        .context("Server failed")?;

    // Let in-flight handlers finish before exiting
    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            error!("Consumer task failed: {}", e);
        }
    }
    info!("gitspace-api stopped");

    Ok(())
}
