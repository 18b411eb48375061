//! CLI pieces shared by the relay binaries.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use chrono::TimeDelta;
use clap::{Args, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use save_relay::config::RelayConfig;
use save_relay::server::StorageBackend;

const DEFAULT_DATA_FILE: &str = "save_relay.json";

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StorageKind {
    Postgres,
    File,
    Memory,
}

#[derive(Debug, Args)]
pub struct StorageArgs {
    /// Storage engine holding players, games and snapshots. A file store is
    /// owned by one process at a time: never point a second process at the
    /// data file of a running server
    #[arg(long, env = "RELAY_STORAGE", value_enum, default_value = "file")]
    pub storage: StorageKind,

    /// SeaORM-compatible Postgres URL (postgres storage)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// JSON data file (file storage)
    #[arg(long, env = "RELAY_DATA_FILE", default_value = DEFAULT_DATA_FILE)]
    pub data_file: PathBuf,

    /// Days without activity before a game or player is reclaimed
    #[arg(long, env = "RELAY_STALE_DAYS", default_value_t = 90)]
    pub stale_days: i64,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "RELAY_LOG_JSON", default_value_t = false)]
    pub json: bool,
}

impl StorageArgs {
    pub fn backend(&self) -> Result<StorageBackend> {
        Ok(match self.storage {
            StorageKind::Postgres => StorageBackend::Postgres {
                database_url: self
                    .database_url
                    .clone()
                    .ok_or_else(|| anyhow!("DATABASE_URL is required for postgres storage"))?,
            },
            StorageKind::File => StorageBackend::File {
                path: self.data_file.clone(),
            },
            StorageKind::Memory => StorageBackend::Memory,
        })
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        if self.stale_days <= 0 {
            return Err(anyhow!("RELAY_STALE_DAYS must be positive"));
        }
        let mut config = RelayConfig::default();
        config.retention.stale_after = TimeDelta::days(self.stale_days);
        Ok(config)
    }
}

pub fn load_dotenv() {
    let manifest_env = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".env");
    dotenv::from_filename(manifest_env).ok();
    dotenv::dotenv().ok();
}

pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(true);

    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }
}
