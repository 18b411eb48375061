use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::ids::{GameId, PlayerId, SnapshotKind};

use super::{
    GameUpsert, NewSnapshot, PlayerSecretUpdate, RetentionFlags, SaveStorage, SaveStorageTxn,
    SnapshotKey, StorageStats, StoredGame, StoredPlayer, StoredSnapshot,
};

const LOG_TARGET: &str = "save_relay::storage::in_memory";

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    players: BTreeMap<PlayerId, StoredPlayer>,
    games: BTreeMap<GameId, StoredGame>,
    snapshots: BTreeMap<i64, StoredSnapshot>,
    #[serde(default)]
    next_snapshot_id: i64,
}

impl Inner {
    fn allocate_snapshot_id(&mut self) -> i64 {
        let floor = self.snapshots.keys().next_back().copied().unwrap_or(0);
        self.next_snapshot_id = self.next_snapshot_id.max(floor) + 1;
        self.next_snapshot_id
    }
}

enum Undo {
    Player(PlayerId, Option<StoredPlayer>),
    Game(GameId, Option<StoredGame>),
    Snapshot(i64, Option<StoredSnapshot>),
}

/// Process-local storage engine. With a backing file it doubles as a
/// key-value file store: every committed transaction rewrites the file.
///
/// Transactions hold an exclusive lock on the whole store for their lifetime.
#[derive(Clone)]
pub struct InMemorySaveStorage {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl Default for InMemorySaveStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySaveStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            path: None,
        }
    }

    /// Opens (or starts) a file-backed store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let inner = match std::fs::read(&path) {
            Ok(bytes) => {
                let inner: Inner = serde_json::from_slice(&bytes)?;
                info!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    players = inner.players.len(),
                    games = inner.games.len(),
                    snapshots = inner.snapshots.len(),
                    "loaded save store from file"
                );
                inner
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Inner::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            path: Some(path),
        })
    }
}

#[async_trait]
impl SaveStorage for InMemorySaveStorage {
    async fn begin(&self) -> Result<Box<dyn SaveStorageTxn>, StorageError> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        Ok(Box::new(InMemorySaveTxn {
            guard,
            undo: Vec::new(),
            path: self.path.clone(),
            finished: false,
        }))
    }
}

pub struct InMemorySaveTxn {
    guard: OwnedMutexGuard<Inner>,
    undo: Vec<Undo>,
    path: Option<PathBuf>,
    finished: bool,
}

impl InMemorySaveTxn {
    fn put_player(&mut self, player: StoredPlayer) {
        let id = player.player_id.clone();
        let previous = self.guard.players.insert(id.clone(), player);
        self.undo.push(Undo::Player(id, previous));
    }

    fn put_game(&mut self, game: StoredGame) {
        let id = game.game_id.clone();
        let previous = self.guard.games.insert(id.clone(), game);
        self.undo.push(Undo::Game(id, previous));
    }

    fn remove_game(&mut self, id: &GameId) -> bool {
        match self.guard.games.remove(id) {
            Some(previous) => {
                self.undo.push(Undo::Game(id.clone(), Some(previous)));
                true
            }
            None => false,
        }
    }

    fn remove_snapshot(&mut self, id: i64) -> bool {
        match self.guard.snapshots.remove(&id) {
            Some(previous) => {
                self.undo.push(Undo::Snapshot(id, Some(previous)));
                true
            }
            None => false,
        }
    }

    fn revert(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Player(id, Some(previous)) => {
                    self.guard.players.insert(id, previous);
                }
                Undo::Player(id, None) => {
                    self.guard.players.remove(&id);
                }
                Undo::Game(id, Some(previous)) => {
                    self.guard.games.insert(id, previous);
                }
                Undo::Game(id, None) => {
                    self.guard.games.remove(&id);
                }
                Undo::Snapshot(id, Some(previous)) => {
                    self.guard.snapshots.insert(id, previous);
                }
                Undo::Snapshot(id, None) => {
                    self.guard.snapshots.remove(&id);
                }
            }
        }
    }

    fn stream(&self, game_id: &GameId, kind: SnapshotKind) -> impl Iterator<Item = &StoredSnapshot> {
        let game_id = game_id.clone();
        self.guard
            .snapshots
            .values()
            .filter(move |snapshot| snapshot.game_id == game_id && snapshot.kind == kind)
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(&*self.guard)?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        debug!(
            target: LOG_TARGET,
            path = %path.display(),
            bytes = bytes.len(),
            "persisted save store"
        );
        Ok(())
    }
}

impl Drop for InMemorySaveTxn {
    fn drop(&mut self) {
        if !self.finished {
            self.revert();
        }
    }
}

#[async_trait]
impl SaveStorageTxn for InMemorySaveTxn {
    async fn load_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Option<StoredPlayer>, StorageError> {
        Ok(self.guard.players.get(player_id).cloned())
    }

    async fn upsert_player_secret(
        &mut self,
        update: PlayerSecretUpdate,
    ) -> Result<(), StorageError> {
        let player = match self.guard.players.get(&update.player_id) {
            Some(existing) => StoredPlayer {
                password: update.password,
                updated_at: update.at,
                update_ip: Some(update.ip),
                ..existing.clone()
            },
            None => StoredPlayer {
                player_id: update.player_id,
                password: update.password,
                whitelisted: false,
                remark: None,
                created_at: update.at,
                updated_at: update.at,
                create_ip: Some(update.ip.clone()),
                update_ip: Some(update.ip),
            },
        };
        self.put_player(player);
        Ok(())
    }

    async fn touch_player(
        &mut self,
        player_id: &PlayerId,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(existing) = self.guard.players.get(player_id) else {
            return Ok(false);
        };
        let touched = StoredPlayer {
            updated_at: at,
            update_ip: Some(ip.to_owned()),
            ..existing.clone()
        };
        self.put_player(touched);
        Ok(true)
    }

    async fn set_player_retention(
        &mut self,
        player_id: &PlayerId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        let Some(existing) = self.guard.players.get(player_id) else {
            return Ok(false);
        };
        let updated = StoredPlayer {
            whitelisted: retention.whitelisted,
            remark: retention.remark,
            updated_at: retention.at,
            ..existing.clone()
        };
        self.put_player(updated);
        Ok(true)
    }

    async fn load_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        Ok(self.guard.games.get(game_id).cloned())
    }

    async fn lock_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        // the transaction already owns the whole store
        self.load_game(game_id).await
    }

    async fn upsert_game(&mut self, upsert: GameUpsert) -> Result<(), StorageError> {
        let game = match self.guard.games.get(&upsert.game_id) {
            Some(existing) => StoredGame {
                players: upsert.players,
                turns: upsert.turns.unwrap_or(existing.turns),
                updated_at: upsert.at,
                ..existing.clone()
            },
            None => StoredGame {
                game_id: upsert.game_id,
                players: upsert.players,
                whitelisted: false,
                turns: upsert.turns.unwrap_or(0),
                remark: None,
                created_at: upsert.at,
                updated_at: upsert.at,
                created_player: Some(upsert.writer),
            },
        };
        self.put_game(game);
        Ok(())
    }

    async fn set_game_retention(
        &mut self,
        game_id: &GameId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        let Some(existing) = self.guard.games.get(game_id) else {
            return Ok(false);
        };
        let updated = StoredGame {
            whitelisted: retention.whitelisted,
            remark: retention.remark,
            updated_at: retention.at,
            ..existing.clone()
        };
        self.put_game(updated);
        Ok(true)
    }

    async fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<i64, StorageError> {
        let id = self.guard.allocate_snapshot_id();
        let stored = StoredSnapshot {
            id,
            game_id: snapshot.game_id,
            kind: snapshot.kind,
            turns: snapshot.turns,
            payload: snapshot.payload,
            created_player: snapshot.created_player,
            created_ip: snapshot.created_ip,
            created_at: snapshot.created_at,
        };
        self.guard.snapshots.insert(id, stored);
        self.undo.push(Undo::Snapshot(id, None));
        Ok(id)
    }

    async fn latest_snapshot(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Option<StoredSnapshot>, StorageError> {
        Ok(self
            .stream(game_id, kind)
            .max_by_key(|snapshot| (snapshot.created_at, snapshot.turns, snapshot.id))
            .cloned())
    }

    async fn snapshot_history(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Vec<StoredSnapshot>, StorageError> {
        let mut history: Vec<StoredSnapshot> = self.stream(game_id, kind).cloned().collect();
        history.sort_by_key(|snapshot| (snapshot.turns, snapshot.created_at, snapshot.id));
        Ok(history)
    }

    async fn list_games(&mut self) -> Result<Vec<StoredGame>, StorageError> {
        Ok(self.guard.games.values().cloned().collect())
    }

    async fn games_for_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Vec<StoredGame>, StorageError> {
        let mut games: Vec<StoredGame> = self
            .guard
            .games
            .values()
            .filter(|game| game.has_member(player_id))
            .cloned()
            .collect();
        games.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(games)
    }

    async fn list_players(&mut self) -> Result<Vec<StoredPlayer>, StorageError> {
        Ok(self.guard.players.values().cloned().collect())
    }

    async fn list_snapshot_keys(&mut self) -> Result<Vec<SnapshotKey>, StorageError> {
        Ok(self.guard.snapshots.values().map(SnapshotKey::from).collect())
    }

    async fn delete_games(&mut self, game_ids: &[GameId]) -> Result<u64, StorageError> {
        let mut deleted = 0;
        for game_id in game_ids {
            let owned: Vec<i64> = self
                .guard
                .snapshots
                .values()
                .filter(|snapshot| &snapshot.game_id == game_id)
                .map(|snapshot| snapshot.id)
                .collect();
            for id in owned {
                self.remove_snapshot(id);
            }
            if self.remove_game(game_id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_players(&mut self, player_ids: &[PlayerId]) -> Result<u64, StorageError> {
        let mut deleted = 0;
        for player_id in player_ids {
            if let Some(previous) = self.guard.players.remove(player_id) {
                self.undo.push(Undo::Player(player_id.clone(), Some(previous)));
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_snapshots(&mut self, snapshot_ids: &[i64]) -> Result<u64, StorageError> {
        let mut deleted = 0;
        for id in snapshot_ids {
            if self.remove_snapshot(*id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn stats(&mut self) -> Result<StorageStats, StorageError> {
        let inner = &*self.guard;
        let count = |kind: SnapshotKind| {
            inner
                .snapshots
                .values()
                .filter(|snapshot| snapshot.kind == kind)
                .count() as u64
        };
        Ok(StorageStats {
            players: inner.players.len() as u64,
            whitelisted_players: inner.players.values().filter(|p| p.whitelisted).count() as u64,
            games: inner.games.len() as u64,
            whitelisted_games: inner.games.values().filter(|g| g.whitelisted).count() as u64,
            content_snapshots: count(SnapshotKind::Content),
            preview_snapshots: count(SnapshotKind::Preview),
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if !self.undo.is_empty() {
            if let Err(err) = self.persist().await {
                self.revert();
                self.finished = true;
                return Err(err);
            }
        }
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) {
        self.revert();
        self.finished = true;
    }
}
