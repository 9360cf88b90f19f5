//! mdxai session service
//!
//! Durable agent-session state: producers POST stream events, the service
//! folds them into per-session state, persists every step and pushes each
//! change to WebSocket subscribers.

mod broadcaster;
mod config;
mod logging;
mod paths;
mod persistence;
mod projection;
mod reducer;
mod routes;
mod session_actor;
mod session_command;
mod state;
mod websocket;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{Config, StoreKind};
use crate::persistence::{DurableStore, MemoryStore, SqliteStore};
use crate::routes::AppState;
use crate::state::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let data_dir = paths::resolve_data_dir(config.data_dir.as_deref())?;
    paths::ensure_dirs(&data_dir)?;
    let _logging = logging::init_logging(&paths::log_dir(&data_dir), config.log_format)?;

    let store: Arc<dyn DurableStore> = match config.store {
        StoreKind::Sqlite => {
            let store = SqliteStore::open(paths::db_path(&data_dir)).await?;
            info!(
                component = "server",
                event = "server.store_opened",
                path = %store.path().display(),
                "Opened SQLite session store"
            );
            Arc::new(store)
        }
        StoreKind::Memory => {
            warn!(
                component = "server",
                event = "server.store_in_memory",
                "Using in-memory store; sessions will not survive a restart"
            );
            Arc::new(MemoryStore::default())
        }
    };

    let idle_timeout = config.idle_timeout();
    let registry = Arc::new(
        SessionRegistry::new(store, config.session_defaults()).with_idle_timeout(idle_timeout),
    );
    if let Some(every) = idle_timeout {
        registry.spawn_reaper(every);
    }
    let app = routes::app(AppState {
        registry,
        public_url: config.public_base_url(),
    });

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %addr,
        data_dir = %data_dir.display(),
        "Server listening"
    );
    eprintln!("mdxai-service listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
