use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use save_relay::server::{run_server, ServerConfig};

mod common;

use common::StorageArgs;

const LOG_TARGET: &str = "bin::save_relay_server";
const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "save_relay_server")]
#[command(about = "Serve the save-game relay over HTTP", long_about = None)]
struct Cli {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "RELAY_BIND", default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Seconds between retention sweeps; 0 disables the sweeper
    #[arg(long, env = "RELAY_SWEEP_INTERVAL_SECS", default_value_t = 24 * 60 * 60)]
    sweep_interval_secs: u64,

    /// Token expected in `x-admin-token` by the operator API; unset disables it
    #[arg(long, env = "RELAY_ADMIN_TOKEN")]
    admin_token: Option<String>,

    #[command(flatten)]
    storage: StorageArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    common::load_dotenv();
    let cli = Cli::parse();
    common::init_tracing(cli.storage.json);

    let config = ServerConfig {
        bind: cli.bind,
        storage: cli.storage.backend()?,
        relay: cli
            .storage
            .relay_config()
            .context("invalid retention settings")?,
        sweep_interval: (cli.sweep_interval_secs > 0)
            .then(|| Duration::from_secs(cli.sweep_interval_secs)),
        admin_token: cli.admin_token.filter(|token| !token.is_empty()),
    };
    info!(
        target: LOG_TARGET,
        bind = %config.bind,
        sweep_interval_secs = cli.sweep_interval_secs,
        "starting save relay"
    );
    run_server(config).await
}
