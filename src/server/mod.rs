//! HTTP surface of the relay: client save sync, account endpoints and the
//! operator retention API.

mod bootstrap;
mod dto;
mod error;
mod logging;
mod routes;

pub use bootstrap::{run_server, ServerConfig, StorageBackend};
pub use error::ApiError;
pub use routes::{ClientIp, SaveRelayServer, ServerContext};
