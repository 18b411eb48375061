use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use save_relay::clock::SystemClock;
use save_relay::relay::SaveRelay;

mod common;

use common::StorageArgs;

const LOG_TARGET: &str = "bin::save_relay_sweep";

#[derive(Debug, Parser)]
#[command(name = "save_relay_sweep")]
#[command(about = "Run one retention sweep against the relay storage", long_about = None)]
struct Cli {
    #[command(flatten)]
    storage: StorageArgs,

    /// Confirm no server holds a file store open. A live server keeps
    /// rewriting the file, so sweep it through `POST /api/sweep` instead
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    common::load_dotenv();
    let cli = Cli::parse();
    common::init_tracing(cli.storage.json);

    let backend = cli.storage.backend()?;
    if !backend.allows_concurrent_processes() && !cli.offline {
        bail!(
            "{:?} storage would be overwritten by a running server; stop the server and pass \
             --offline, or use POST /api/sweep",
            cli.storage.storage
        );
    }
    let storage = backend.open().await?;
    let relay = SaveRelay::new(
        storage,
        Arc::new(SystemClock),
        cli.storage.relay_config()?,
    );
    let report = relay
        .sweeper()
        .sweep()
        .await
        .context("retention sweep failed")?;

    info!(
        target: LOG_TARGET,
        deleted_games = report.deleted_games,
        deleted_players = report.deleted_players,
        deleted_snapshots = report.deleted_snapshots,
        "sweep complete"
    );
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
