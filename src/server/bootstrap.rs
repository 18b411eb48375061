use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::db;
use crate::relay::SaveRelay;
use crate::storage::{InMemorySaveStorage, SaveStorage, SeaOrmSaveStorage};

use super::routes::SaveRelayServer;

const LOG_TARGET: &str = "save_relay::server::bootstrap";

/// Storage engine chosen at deployment time.
#[derive(Clone, Debug)]
pub enum StorageBackend {
    Postgres { database_url: String },
    /// JSON file holding every record; created on first commit.
    File { path: PathBuf },
    /// Volatile, for local testing.
    Memory,
}

impl StorageBackend {
    /// Opens the engine, creating the relational schema when needed.
    pub async fn open(&self) -> Result<Arc<dyn SaveStorage>> {
        let storage: Arc<dyn SaveStorage> = match self {
            StorageBackend::Postgres { database_url } => {
                let connection = db::connect_to(database_url).await?;
                db::ensure_schema(&connection).await?;
                Arc::new(SeaOrmSaveStorage::new(connection))
            }
            StorageBackend::File { path } => Arc::new(
                InMemorySaveStorage::open(path.clone())
                    .with_context(|| format!("failed to open save file {}", path.display()))?,
            ),
            StorageBackend::Memory => {
                warn!(target: LOG_TARGET, "using volatile in-memory storage");
                Arc::new(InMemorySaveStorage::new())
            }
        };
        Ok(storage)
    }

    /// Whether another process may open the store while a server is running.
    /// File stores are rewritten whole by whichever process commits last.
    pub fn allows_concurrent_processes(&self) -> bool {
        matches!(self, StorageBackend::Postgres { .. })
    }

    fn describe(&self) -> String {
        match self {
            StorageBackend::Postgres { .. } => "postgres".to_owned(),
            StorageBackend::File { path } => format!("file:{}", path.display()),
            StorageBackend::Memory => "memory".to_owned(),
        }
    }
}

pub struct ServerConfig {
    pub bind: SocketAddr,
    pub storage: StorageBackend,
    pub relay: RelayConfig,
    /// `None` disables scheduled sweeps; cache purging still runs.
    pub sweep_interval: Option<Duration>,
    pub admin_token: Option<String>,
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    let storage = config.storage.open().await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let relay = SaveRelay::new(storage, clock, config.relay);

    let cancel = CancellationToken::new();
    let sweeper = Arc::clone(relay.sweeper()).spawn(config.sweep_interval, cancel.child_token());

    let server = SaveRelayServer::new(relay, config.admin_token);
    let make_service = server
        .into_router()
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let local_addr = listener.local_addr()?;
    info!(
        target: LOG_TARGET,
        %local_addr,
        storage = %config.storage.describe(),
        sweep_interval_secs = ?config.sweep_interval.map(|every| every.as_secs()),
        "save relay listening"
    );

    let served = axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with error");

    cancel.cancel();
    if let Err(err) = sweeper.await {
        warn!(target: LOG_TARGET, error = %err, "sweeper task ended abnormally");
    }
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target: LOG_TARGET,
            error = %err,
            "failed to install ctrl-c handler"
        );
    }
    info!(target: LOG_TARGET, "shutdown signal received");
}
