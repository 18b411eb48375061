//! Save-game relay for turn-based multiplayer games.
//!
//! Clients push and pull gzip+base64 game saves keyed by game id. The
//! [`auth::AuthGate`] resolves who is calling, the
//! [`coordinator::SaveCoordinator`] decides whether a save may be stored and
//! serves the latest one, and the [`sweeper::RetentionSweeper`] reclaims stale
//! games, orphaned players and superseded history.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ids;
pub mod membership;
pub mod relay;
pub mod server;
pub mod storage;
pub mod sweeper;

#[cfg(test)]
pub mod test_utils;

pub use error::{PayloadError, RelayError, StorageError};
pub use ids::{GameId, PlayerId, SnapshotKind};
pub use relay::SaveRelay;
