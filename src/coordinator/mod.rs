//! Read and write path for game snapshots.
//!
//! Each `(game, kind)` pair is an independent stream that is either absent or
//! has a latest snapshot. Writes are whole-snapshot inserts; the ownership
//! re-check and the insert share one storage transaction, which is the only
//! serialization point between concurrent writers.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::codec::{self, DecodedSave};
use crate::config::{CoordinatorConfig, PayloadLimits};
use crate::error::{RelayError, StorageError};
use crate::ids::{GameId, PlayerId, SnapshotKind};
use crate::membership::extract_human_player_ids;
use crate::storage::{
    GameUpsert, NewSnapshot, RetentionFlags, SaveStorage, StorageStats, StoredGame,
};

const LOG_TARGET: &str = "save_relay::coordinator";

/// Encoded latest snapshot plus what the visibility rule needs.
#[derive(Clone, Debug)]
pub struct CachedSnapshot {
    pub token: Arc<str>,
    pub members: Arc<[PlayerId]>,
    pub spectatable: bool,
}

impl CachedSnapshot {
    fn visible_to(&self, viewer: Option<&PlayerId>) -> bool {
        self.spectatable || viewer.is_some_and(|viewer| self.members.contains(viewer))
    }
}

pub type SnapshotCache = TtlCache<(GameId, SnapshotKind), CachedSnapshot>;

/// One stored turn of a game, encoded for download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub id: i64,
    pub turns: i64,
    pub created_at: DateTime<Utc>,
    pub created_player: PlayerId,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub game_id: GameId,
    pub players: Vec<PlayerId>,
    pub turns: i64,
    pub whitelisted: bool,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StoredGame> for GameSummary {
    fn from(game: StoredGame) -> Self {
        Self {
            game_id: game.game_id,
            players: game.players,
            turns: game.turns,
            whitelisted: game.whitelisted,
            remark: game.remark,
            created_at: game.created_at,
            updated_at: game.updated_at,
        }
    }
}

/// Outcome of the transactional part of a write.
enum CommitError {
    Rejected(RelayError),
    Storage(StorageError),
}

impl From<StorageError> for CommitError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

pub struct SaveCoordinator {
    storage: Arc<dyn SaveStorage>,
    clock: Arc<dyn Clock>,
    limits: PayloadLimits,
    config: CoordinatorConfig,
    snapshots: Arc<SnapshotCache>,
}

impl SaveCoordinator {
    pub fn new(
        storage: Arc<dyn SaveStorage>,
        clock: Arc<dyn Clock>,
        limits: PayloadLimits,
        config: CoordinatorConfig,
    ) -> Self {
        let snapshots = Arc::new(TtlCache::new(config.snapshot_cache_ttl));
        Self {
            storage,
            clock,
            limits,
            config,
            snapshots,
        }
    }

    /// Read cache shared with components that delete snapshots.
    pub fn snapshot_cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.snapshots)
    }

    pub fn limits(&self) -> &PayloadLimits {
        &self.limits
    }

    /// Latest snapshot of the stream as a client token.
    ///
    /// A save that is closed to spectators reads as absent for anyone who is
    /// not a recorded member of the game.
    pub async fn read(
        &self,
        game_id: &GameId,
        kind: SnapshotKind,
        viewer: Option<&PlayerId>,
    ) -> Result<String, RelayError> {
        let key = (game_id.clone(), kind);
        let cached = match self.snapshots.get(&key) {
            Some(cached) => cached,
            None => {
                let started = Instant::now();
                let loaded = self
                    .load_latest(key)
                    .await
                    .map_err(|err| internal(viewer, game_id, started, err))?;
                let Some(loaded) = loaded else {
                    return Err(not_found(game_id, kind));
                };
                loaded
            }
        };

        if !cached.visible_to(viewer) {
            debug!(target: LOG_TARGET, %game_id, %kind, "private save hidden from non-member");
            return Err(not_found(game_id, kind));
        }
        Ok(cached.token.to_string())
    }

    /// Accepts a new snapshot from `player_id` for `game_id`.
    pub async fn write(
        &self,
        player_id: &PlayerId,
        game_id: &GameId,
        token: &str,
        kind: SnapshotKind,
        source_ip: &str,
    ) -> Result<GameId, RelayError> {
        let started = Instant::now();
        let save = match codec::decode_with_limit(token, self.limits.max_decoded_bytes) {
            Ok(Some(save)) => save,
            Ok(None) => return Err(rejected(player_id, game_id, "empty payload")),
            Err(err) => return Err(rejected(player_id, game_id, &err.to_string())),
        };

        match save.game_id() {
            Some(embedded) if embedded == game_id.as_str() => {}
            embedded => {
                let reason = format!(
                    "payload game id {} does not match path game id",
                    embedded.unwrap_or("<missing>")
                );
                return Err(rejected(player_id, game_id, &reason));
            }
        }

        let members = extract_human_player_ids(save.value());
        if members.is_empty() {
            return Err(rejected(player_id, game_id, "payload lists no human players"));
        }
        if !members.contains(player_id) {
            return Err(rejected(
                player_id,
                game_id,
                "caller is not a human player of this save",
            ));
        }

        let turns = save.turns();
        let payload = save.into_json();
        let attempts = self.config.write_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self
                .commit_write(player_id, game_id, kind, &members, turns, &payload, source_ip)
                .await;
            match outcome {
                Ok(snapshot_id) => {
                    // membership is shared by both streams of the game
                    for cached_kind in SnapshotKind::ALL {
                        self.snapshots.invalidate(&(game_id.clone(), cached_kind));
                    }
                    info!(
                        target: LOG_TARGET,
                        %player_id,
                        %game_id,
                        %kind,
                        turns,
                        snapshot_id,
                        members = members.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "snapshot stored"
                    );
                    return Ok(game_id.clone());
                }
                Err(CommitError::Rejected(err)) => return Err(err),
                Err(CommitError::Storage(err)) if err.is_conflict() && attempt < attempts => {
                    warn!(
                        target: LOG_TARGET,
                        %player_id,
                        %game_id,
                        attempt,
                        error = %err,
                        "write conflicted with a concurrent writer; retrying"
                    );
                    attempt += 1;
                }
                Err(CommitError::Storage(err)) => {
                    return Err(internal(Some(player_id), game_id, started, err));
                }
            }
        }
    }

    /// Every stored content turn of a game, oldest first. Members only.
    pub async fn history(
        &self,
        game_id: &GameId,
        viewer: &PlayerId,
    ) -> Result<Vec<TurnRecord>, RelayError> {
        let started = Instant::now();
        let stored = async {
            let mut txn = self.storage.begin().await?;
            let game = txn.load_game(game_id).await?;
            let history = match &game {
                Some(game) if game.has_member(viewer) => {
                    Some(txn.snapshot_history(game_id, SnapshotKind::Content).await?)
                }
                _ => None,
            };
            txn.rollback().await;
            Ok::<_, StorageError>(history)
        }
        .await
        .map_err(|err| internal(Some(viewer), game_id, started, err))?;

        let Some(stored) = stored else {
            return Err(not_found(game_id, SnapshotKind::Content));
        };
        stored
            .into_iter()
            .map(|snapshot| -> Result<TurnRecord, RelayError> {
                let payload = codec::encode(snapshot.payload.as_bytes()).map_err(|err| {
                    internal(Some(viewer), game_id, started, StorageError::corrupt(err.to_string()))
                })?;
                Ok(TurnRecord {
                    id: snapshot.id,
                    turns: snapshot.turns,
                    created_at: snapshot.created_at,
                    created_player: snapshot.created_player,
                    payload,
                })
            })
            .collect()
    }

    /// Games whose recorded membership includes `player_id`, most recently updated first.
    pub async fn games_for_player(
        &self,
        player_id: &PlayerId,
    ) -> Result<Vec<GameSummary>, RelayError> {
        let started = Instant::now();
        let mut txn = self
            .storage
            .begin()
            .await
            .map_err(|err| internal_unscoped(started, err))?;
        let games = txn
            .games_for_player(player_id)
            .await
            .map_err(|err| internal_unscoped(started, err))?;
        txn.rollback().await;
        Ok(games.into_iter().map(GameSummary::from).collect())
    }

    pub async fn stats(&self) -> Result<StorageStats, RelayError> {
        let started = Instant::now();
        let stats = async {
            let mut txn = self.storage.begin().await?;
            let stats = txn.stats().await?;
            txn.rollback().await;
            Ok::<_, StorageError>(stats)
        }
        .await
        .map_err(|err| internal_unscoped(started, err))?;
        Ok(stats)
    }

    /// Marks a game as exempt from (or subject to) retention sweeping.
    pub async fn set_game_retention(
        &self,
        game_id: &GameId,
        whitelisted: bool,
        remark: Option<String>,
    ) -> Result<(), RelayError> {
        let started = Instant::now();
        let flags = RetentionFlags {
            whitelisted,
            remark,
            at: self.clock.now(),
        };
        let updated = async {
            let mut txn = self.storage.begin().await?;
            let updated = txn.set_game_retention(game_id, flags).await?;
            txn.commit().await?;
            Ok::<_, StorageError>(updated)
        }
        .await
        .map_err(|err| internal(None, game_id, started, err))?;

        if !updated {
            return Err(RelayError::not_found(format!("game {game_id} not found")));
        }
        info!(target: LOG_TARGET, %game_id, whitelisted, "game retention updated");
        Ok(())
    }

    pub async fn set_player_retention(
        &self,
        player_id: &PlayerId,
        whitelisted: bool,
        remark: Option<String>,
    ) -> Result<(), RelayError> {
        let started = Instant::now();
        let flags = RetentionFlags {
            whitelisted,
            remark,
            at: self.clock.now(),
        };
        let updated = async {
            let mut txn = self.storage.begin().await?;
            let updated = txn.set_player_retention(player_id, flags).await?;
            txn.commit().await?;
            Ok::<_, StorageError>(updated)
        }
        .await
        .map_err(|err| internal_unscoped(started, err))?;

        if !updated {
            return Err(RelayError::not_found(format!("player {player_id} not found")));
        }
        info!(target: LOG_TARGET, %player_id, whitelisted, "player retention updated");
        Ok(())
    }

    /// Removes a game and all of its snapshots. With `requester` set, only a
    /// recorded member may delete; non-members see the game as absent.
    pub async fn delete_game(
        &self,
        game_id: &GameId,
        requester: Option<&PlayerId>,
    ) -> Result<(), RelayError> {
        let started = Instant::now();
        let deleted = async {
            let mut txn = self.storage.begin().await?;
            let allowed = match (txn.lock_game(game_id).await?, requester) {
                (None, _) => false,
                (Some(game), Some(requester)) => game.has_member(requester),
                (Some(_), None) => true,
            };
            if !allowed {
                txn.rollback().await;
                return Ok::<_, StorageError>(false);
            }
            let deleted = txn.delete_games(std::slice::from_ref(game_id)).await?;
            txn.commit().await?;
            Ok(deleted > 0)
        }
        .await
        .map_err(|err| internal(requester, game_id, started, err))?;

        if !deleted {
            return Err(RelayError::not_found(format!("game {game_id} not found")));
        }
        for kind in SnapshotKind::ALL {
            self.snapshots.invalidate(&(game_id.clone(), kind));
        }
        info!(target: LOG_TARGET, %game_id, "game deleted");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_write(
        &self,
        player_id: &PlayerId,
        game_id: &GameId,
        kind: SnapshotKind,
        members: &[PlayerId],
        turns: i64,
        payload: &str,
        source_ip: &str,
    ) -> Result<i64, CommitError> {
        let now = self.clock.now();
        let mut txn = self.storage.begin().await?;

        if let Some(recorded) = txn.lock_game(game_id).await? {
            if recorded.players.len() > 1 && !recorded.has_member(player_id) {
                txn.rollback().await;
                return Err(CommitError::Rejected(rejected(
                    player_id,
                    game_id,
                    "caller is not a recorded member of this game",
                )));
            }
        }

        txn.upsert_game(GameUpsert {
            game_id: game_id.clone(),
            players: members.to_vec(),
            turns: (kind == SnapshotKind::Content).then_some(turns),
            writer: player_id.clone(),
            at: now,
        })
        .await?;
        let snapshot_id = txn
            .insert_snapshot(NewSnapshot {
                game_id: game_id.clone(),
                kind,
                turns,
                payload: payload.to_owned(),
                created_player: player_id.clone(),
                created_ip: Some(source_ip.to_owned()),
                created_at: now,
            })
            .await?;
        txn.commit().await?;
        Ok(snapshot_id)
    }

    async fn load_latest(
        &self,
        key: (GameId, SnapshotKind),
    ) -> Result<Option<CachedSnapshot>, StorageError> {
        let (game_id, kind) = &key;
        let ticket = self.snapshots.ticket();
        let mut txn = self.storage.begin().await?;
        let Some(snapshot) = txn.latest_snapshot(game_id, *kind).await? else {
            txn.rollback().await;
            return Ok(None);
        };
        let members = txn
            .load_game(game_id)
            .await?
            .map(|game| game.players)
            .unwrap_or_default();

        let save = DecodedSave::from_json(snapshot.payload)
            .map_err(|err| StorageError::corrupt(format!("snapshot {}: {err}", snapshot.id)))?;
        let token = codec::encode(save.json().as_bytes())
            .map_err(|err| StorageError::corrupt(err.to_string()))?;
        let cached = CachedSnapshot {
            token: Arc::from(token),
            members: Arc::from(members),
            spectatable: save.is_spectatable(),
        };
        txn.rollback().await;
        // refused when a write committed and invalidated since the ticket was taken
        if !self.snapshots.insert_if_fresh(key.clone(), cached.clone(), ticket) {
            debug!(target: LOG_TARGET, %game_id, %kind, "superseded load not cached");
        }
        Ok(Some(cached))
    }
}

fn rejected(player_id: &PlayerId, game_id: &GameId, reason: &str) -> RelayError {
    warn!(target: LOG_TARGET, %player_id, %game_id, reason, "save rejected");
    RelayError::validation(reason.to_owned())
}

fn not_found(game_id: &GameId, kind: SnapshotKind) -> RelayError {
    RelayError::not_found(format!("no {kind} snapshot for game {game_id}"))
}

fn internal(
    caller: Option<&PlayerId>,
    game_id: &GameId,
    started: Instant,
    err: StorageError,
) -> RelayError {
    error!(
        target: LOG_TARGET,
        player_id = caller.map(PlayerId::as_str).unwrap_or("-"),
        %game_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err,
        "storage failure"
    );
    RelayError::internal("storage failure")
}

fn internal_unscoped(started: Instant, err: StorageError) -> RelayError {
    error!(
        target: LOG_TARGET,
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err,
        "storage failure"
    );
    RelayError::internal("storage failure")
}
