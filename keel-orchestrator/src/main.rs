use std::sync::Arc;

use anyhow::Context;
use keel_orchestrator::api::{self, AppState};
use keel_orchestrator::config::Config;
use keel_orchestrator::engine::{Engine, EngineSettings};
use keel_orchestrator::inventory::Inventory;
use keel_orchestrator::repository::{InMemoryStore, PgStore, Store};
use keel_orchestrator::{db, notify, sweeper};
use keel_runner::channel::{SshChannel, SshOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "keel_orchestrator=info,keel_runner=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keel Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let inventory = Inventory::load(&config.inventory_path)?;
    tracing::info!(
        "Loaded inventory: {} server(s), {} project(s)",
        inventory.servers.len(),
        inventory.projects.len()
    );

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, history is kept in memory only");
            Arc::new(InMemoryStore::new())
        }
    };

    let channel = SshChannel::new(
        inventory.ssh_targets(),
        SshOptions {
            binary: config.ssh_binary.clone(),
            connect_timeout: config.ssh_connect_timeout,
            ..SshOptions::default()
        },
    );

    let engine = Engine::new(store, Arc::new(inventory), Arc::new(channel)).with_settings(
        EngineSettings {
            log_flush_interval: config.log_flush_interval,
            lock_heartbeat_interval: config.lock_heartbeat_interval,
            ..EngineSettings::default()
        },
    );

    let _events = notify::spawn_log_subscriber(&engine.notifier);
    let _sweeper = sweeper::spawn_lock_sweeper(
        engine.clone(),
        config.lock_stale_after,
        config.lock_heartbeat_interval,
    );

    // Build router with all API endpoints
    let app = api::create_router(AppState::new(engine));

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
