use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::ids::{GameId, PlayerId, SnapshotKind};

pub mod in_memory;
pub mod sea_orm;

pub use in_memory::InMemorySaveStorage;
pub use self::sea_orm::SeaOrmSaveStorage;

/// Entry point of a storage engine. All access goes through a transaction.
#[async_trait]
pub trait SaveStorage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SaveStorageTxn>, StorageError>;
}

/// One atomic unit of work. Dropping a transaction without calling
/// [`SaveStorageTxn::commit`] discards every change made through it.
#[async_trait]
pub trait SaveStorageTxn: Send {
    async fn load_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Option<StoredPlayer>, StorageError>;

    async fn upsert_player_secret(&mut self, update: PlayerSecretUpdate)
        -> Result<(), StorageError>;

    /// Refreshes `updated_at`/`update_ip`. Returns false when the player does not exist.
    async fn touch_player(
        &mut self,
        player_id: &PlayerId,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn set_player_retention(
        &mut self,
        player_id: &PlayerId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError>;

    async fn load_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError>;

    /// Loads a game for modification, serializing concurrent writers of the same row.
    async fn lock_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError>;

    async fn upsert_game(&mut self, upsert: GameUpsert) -> Result<(), StorageError>;

    async fn set_game_retention(
        &mut self,
        game_id: &GameId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError>;

    async fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<i64, StorageError>;

    /// Latest snapshot by `(created_at desc, turns desc, id desc)`.
    async fn latest_snapshot(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Option<StoredSnapshot>, StorageError>;

    /// Every snapshot of one stream, oldest turn first.
    async fn snapshot_history(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Vec<StoredSnapshot>, StorageError>;

    async fn list_games(&mut self) -> Result<Vec<StoredGame>, StorageError>;

    /// Games whose recorded membership includes `player_id`, most recently updated first.
    async fn games_for_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Vec<StoredGame>, StorageError>;

    async fn list_players(&mut self) -> Result<Vec<StoredPlayer>, StorageError>;

    async fn list_snapshot_keys(&mut self) -> Result<Vec<SnapshotKey>, StorageError>;

    /// Deletes the games together with all of their snapshots.
    async fn delete_games(&mut self, game_ids: &[GameId]) -> Result<u64, StorageError>;

    async fn delete_players(&mut self, player_ids: &[PlayerId]) -> Result<u64, StorageError>;

    async fn delete_snapshots(&mut self, snapshot_ids: &[i64]) -> Result<u64, StorageError>;

    async fn stats(&mut self) -> Result<StorageStats, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn rollback(self: Box<Self>);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPlayer {
    pub player_id: PlayerId,
    pub password: String,
    pub whitelisted: bool,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub create_ip: Option<String>,
    pub update_ip: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PlayerSecretUpdate {
    pub player_id: PlayerId,
    pub password: String,
    pub ip: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGame {
    pub game_id: GameId,
    /// Human members derived from the most recently accepted snapshot.
    pub players: Vec<PlayerId>,
    pub whitelisted: bool,
    pub turns: i64,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_player: Option<PlayerId>,
}

impl StoredGame {
    pub fn has_member(&self, player_id: &PlayerId) -> bool {
        self.players.iter().any(|member| member == player_id)
    }
}

#[derive(Clone, Debug)]
pub struct GameUpsert {
    pub game_id: GameId,
    pub players: Vec<PlayerId>,
    /// `None` keeps the recorded turn counter (preview writes).
    pub turns: Option<i64>,
    pub writer: PlayerId,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct RetentionFlags {
    pub whitelisted: bool,
    pub remark: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub id: i64,
    pub game_id: GameId,
    pub kind: SnapshotKind,
    pub turns: i64,
    /// Decompressed JSON text of the save.
    pub payload: String,
    pub created_player: PlayerId,
    pub created_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewSnapshot {
    pub game_id: GameId,
    pub kind: SnapshotKind,
    pub turns: i64,
    pub payload: String,
    pub created_player: PlayerId,
    pub created_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot identity without its payload, for retention bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotKey {
    pub id: i64,
    pub game_id: GameId,
    pub kind: SnapshotKind,
    pub turns: i64,
    pub created_at: DateTime<Utc>,
}

impl SnapshotKey {
    /// Sort key under which the greatest snapshot of a stream is authoritative.
    pub fn recency(&self) -> (DateTime<Utc>, i64, i64) {
        (self.created_at, self.turns, self.id)
    }
}

impl From<&StoredSnapshot> for SnapshotKey {
    fn from(snapshot: &StoredSnapshot) -> Self {
        Self {
            id: snapshot.id,
            game_id: snapshot.game_id.clone(),
            kind: snapshot.kind,
            turns: snapshot.turns,
            created_at: snapshot.created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub players: u64,
    pub whitelisted_players: u64,
    pub games: u64,
    pub whitelisted_games: u64,
    pub content_snapshots: u64,
    pub preview_snapshots: u64,
}
