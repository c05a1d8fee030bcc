//! fedlink binary entry point

use std::time::Duration;

use fedlink::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background tasks (actor cache pruning)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    init_tracing(&config.logging);
    tracing::info!("Starting fedlink...");
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        users = config.users.names.len(),
        "Configuration loaded"
    );

    fedlink::metrics::init_metrics();

    // 3. Initialize application state
    let state = AppState::in_memory(config.clone()).await?;

    // 4. Build Axum router
    let app = fedlink::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    // 5. Start background tasks
    if let Some(ttl) = config.federation.actor_cache_ttl() {
        spawn_actor_cache_pruning(state.clone(), ttl);
    }

    // 6. Start server
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("fedlink={},tower_http=debug", logging.level).into()
    });

    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Drop expired actor documents once per TTL period
fn spawn_actor_cache_pruning(state: AppState, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let cache = state.directory.cache();
            cache.prune_expired().await;
            let stats = cache.stats().await;
            tracing::debug!(entries = stats.total_entries, "Actor cache pruned");
        }
    });

    tracing::info!(ttl_secs = ttl.as_secs(), "Actor cache pruning task spawned");
}

/// Wait for Ctrl-C, then let queued handshake replies finish
async fn shutdown_signal(state: AppState) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        return;
    }

    tracing::info!(pending = state.tasks.pending(), "Shutting down; draining background tasks");
    if tokio::time::timeout(Duration::from_secs(10), state.tasks.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(pending = state.tasks.pending(), "Background tasks still running at shutdown");
    }
}
