//! WebSocket Chat Hub - Entry Point
//!
//! Starts the persistence worker, the Hub actor and the TCP listener,
//! accepting connections until SIGINT or SIGTERM.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_hub::store::ChatStore;
use chat_hub::{serve, Config, Hub, MemoryCache, MemoryStore, Persister, RoomId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let mut config = Config::from_env()?;

    // Bind address from the command line wins over the environment
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }

    let store = Arc::new(MemoryStore::new());
    let last_room_id = match store.all_rooms().await {
        Ok(rooms) => rooms.iter().map(|r| r.id).max().unwrap_or(RoomId(0)),
        Err(e) => {
            error!("Failed to load rooms: {}", e);
            RoomId(0)
        }
    };

    let (persister, persist_queue) = Persister::new(store.clone());
    tokio::spawn(persister.run());

    let (hub, handle) = Hub::new(
        config.hub_queue_capacity,
        Arc::new(MemoryCache::new()),
        persist_queue,
    );
    let hub = hub
        .with_cache_ttl(config.cache_ttl)
        .with_last_room_id(last_room_id);
    let hub_task = tokio::spawn(hub.run());

    info!("Hub actor started");

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Hub listening on {}", config.addr);

    tokio::select! {
        _ = serve(listener, handle.clone(), store, config.session) => {}
        _ = shutdown_signal() => info!("Shutting down"),
    }

    handle.shutdown();
    if let Err(e) = hub_task.await {
        error!("Hub task failed: {}", e);
    }

    Ok(())
}

/// Wait for SIGINT or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
