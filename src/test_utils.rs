//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::codec;
use crate::config::RelayConfig;
use crate::error::StorageError;
use crate::ids::{GameId, PlayerId, SnapshotKind};
use crate::relay::SaveRelay;
use crate::storage::{
    GameUpsert, InMemorySaveStorage, NewSnapshot, PlayerSecretUpdate, RetentionFlags,
    SaveStorage, SaveStorageTxn, SnapshotKey, StorageStats, StoredGame, StoredPlayer,
    StoredSnapshot,
};

pub const ALICE: &str = "11111111-1111-1111-1111-111111111111";
pub const BOB: &str = "22222222-2222-2222-2222-222222222222";
pub const CAROL: &str = "33333333-3333-3333-3333-333333333333";
pub const GAME: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
pub const OTHER_GAME: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";
pub const IP: &str = "203.0.113.7";

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .expect("valid fixed timestamp")
}

/// A minimal save listing `humans` as human players plus one AI civ.
pub fn save_json(game_id: &str, turns: i64, humans: &[&str]) -> JsonValue {
    let mut players: Vec<JsonValue> = humans
        .iter()
        .map(|id| json!({ "playerType": "Human", "playerId": id, "chosenCiv": "Rome" }))
        .collect();
    players.push(json!({ "playerType": "AI", "playerId": "", "chosenCiv": "Babylon" }));
    json!({
        "gameId": game_id,
        "turns": turns,
        "gameParameters": { "players": players, "anyoneCanSpectate": true },
        "civilizations": []
    })
}

pub fn private_save_json(game_id: &str, turns: i64, humans: &[&str]) -> JsonValue {
    let mut save = save_json(game_id, turns, humans);
    save["gameParameters"]["anyoneCanSpectate"] = JsonValue::Bool(false);
    save
}

pub fn token_for(save: &JsonValue) -> String {
    codec::encode(save.to_string().as_bytes()).expect("encode save")
}

pub fn decode_token(token: &str) -> JsonValue {
    let decoded = codec::decode(token)
        .expect("decodable token")
        .expect("non-empty token");
    decoded.value().clone()
}

pub struct TestRelay {
    pub relay: SaveRelay,
    pub clock: Arc<ManualClock>,
}

pub fn relay() -> TestRelay {
    relay_with(RelayConfig::default())
}

pub fn relay_with(config: RelayConfig) -> TestRelay {
    let clock = Arc::new(ManualClock::new(epoch()));
    let relay = SaveRelay::new(
        Arc::new(InMemorySaveStorage::new()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        config,
    );
    TestRelay { relay, clock }
}

pub fn scripted_relay(script: Arc<StorageScript>) -> TestRelay {
    let clock = Arc::new(ManualClock::new(epoch()));
    let relay = SaveRelay::new(
        Arc::new(AutocommitStorage::new(script)),
        Arc::clone(&clock) as Arc<dyn Clock>,
        RelayConfig::default(),
    );
    TestRelay { relay, clock }
}

/// Failures and pauses injected into [`AutocommitStorage`].
#[derive(Default)]
pub struct StorageScript {
    /// How many upcoming `upsert_game` calls fail with a conflict.
    pub upsert_conflicts: AtomicUsize,
    /// Committed by a competing writer right before the next scripted conflict.
    pub racing_game: Mutex<Option<GameUpsert>>,
    pub lock_game_calls: AtomicUsize,
    read_gate: Mutex<Option<ReadGate>>,
}

/// Pairs of signals around a paused `latest_snapshot` call.
#[derive(Clone)]
pub struct ReadGate {
    /// Notified once the read has fetched its row and is waiting.
    pub parked: Arc<Notify>,
    /// Lets the paused read return.
    pub resume: Arc<Notify>,
}

impl StorageScript {
    /// Pauses the next `latest_snapshot` after it has read its row.
    pub fn pause_next_read(&self) -> ReadGate {
        let gate = ReadGate {
            parked: Arc::new(Notify::new()),
            resume: Arc::new(Notify::new()),
        };
        *self.read_gate.lock() = Some(gate.clone());
        gate
    }

    fn take_conflict(&self) -> bool {
        self.upsert_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Storage whose transactions commit every statement on its own, so
/// interleavings a serializing engine rules out can happen.
pub struct AutocommitStorage {
    inner: InMemorySaveStorage,
    script: Arc<StorageScript>,
}

impl AutocommitStorage {
    pub fn new(script: Arc<StorageScript>) -> Self {
        Self {
            inner: InMemorySaveStorage::new(),
            script,
        }
    }
}

#[async_trait]
impl SaveStorage for AutocommitStorage {
    async fn begin(&self) -> Result<Box<dyn SaveStorageTxn>, StorageError> {
        Ok(Box::new(AutocommitTxn {
            inner: self.inner.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

struct AutocommitTxn {
    inner: InMemorySaveStorage,
    script: Arc<StorageScript>,
}

macro_rules! autocommit {
    ($self:ident, $txn:ident => $op:expr) => {{
        let mut $txn = $self.inner.begin().await?;
        let result = $op;
        $txn.commit().await?;
        Ok::<_, StorageError>(result)
    }};
}

#[async_trait]
impl SaveStorageTxn for AutocommitTxn {
    async fn load_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Option<StoredPlayer>, StorageError> {
        autocommit!(self, txn => txn.load_player(player_id).await?)
    }

    async fn upsert_player_secret(
        &mut self,
        update: PlayerSecretUpdate,
    ) -> Result<(), StorageError> {
        autocommit!(self, txn => txn.upsert_player_secret(update).await?)
    }

    async fn touch_player(
        &mut self,
        player_id: &PlayerId,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        autocommit!(self, txn => txn.touch_player(player_id, ip, at).await?)
    }

    async fn set_player_retention(
        &mut self,
        player_id: &PlayerId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        autocommit!(self, txn => txn.set_player_retention(player_id, retention).await?)
    }

    async fn load_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        autocommit!(self, txn => txn.load_game(game_id).await?)
    }

    async fn lock_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        self.script.lock_game_calls.fetch_add(1, Ordering::SeqCst);
        autocommit!(self, txn => txn.lock_game(game_id).await?)
    }

    async fn upsert_game(&mut self, upsert: GameUpsert) -> Result<(), StorageError> {
        if self.script.take_conflict() {
            let racing = self.script.racing_game.lock().take();
            if let Some(racing) = racing {
                autocommit!(self, txn => txn.upsert_game(racing).await?)?;
            }
            return Err(StorageError::Conflict("scripted conflict".to_owned()));
        }
        autocommit!(self, txn => txn.upsert_game(upsert).await?)
    }

    async fn set_game_retention(
        &mut self,
        game_id: &GameId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        autocommit!(self, txn => txn.set_game_retention(game_id, retention).await?)
    }

    async fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<i64, StorageError> {
        autocommit!(self, txn => txn.insert_snapshot(snapshot).await?)
    }

    async fn latest_snapshot(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Option<StoredSnapshot>, StorageError> {
        let latest = autocommit!(self, txn => txn.latest_snapshot(game_id, kind).await?);
        let gate = self.script.read_gate.lock().take();
        if let Some(gate) = gate {
            gate.parked.notify_one();
            gate.resume.notified().await;
        }
        latest
    }

    async fn snapshot_history(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Vec<StoredSnapshot>, StorageError> {
        autocommit!(self, txn => txn.snapshot_history(game_id, kind).await?)
    }

    async fn list_games(&mut self) -> Result<Vec<StoredGame>, StorageError> {
        autocommit!(self, txn => txn.list_games().await?)
    }

    async fn games_for_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Vec<StoredGame>, StorageError> {
        autocommit!(self, txn => txn.games_for_player(player_id).await?)
    }

    async fn list_players(&mut self) -> Result<Vec<StoredPlayer>, StorageError> {
        autocommit!(self, txn => txn.list_players().await?)
    }

    async fn list_snapshot_keys(&mut self) -> Result<Vec<SnapshotKey>, StorageError> {
        autocommit!(self, txn => txn.list_snapshot_keys().await?)
    }

    async fn delete_games(&mut self, game_ids: &[GameId]) -> Result<u64, StorageError> {
        autocommit!(self, txn => txn.delete_games(game_ids).await?)
    }

    async fn delete_players(&mut self, player_ids: &[PlayerId]) -> Result<u64, StorageError> {
        autocommit!(self, txn => txn.delete_players(player_ids).await?)
    }

    async fn delete_snapshots(&mut self, snapshot_ids: &[i64]) -> Result<u64, StorageError> {
        autocommit!(self, txn => txn.delete_snapshots(snapshot_ids).await?)
    }

    async fn stats(&mut self) -> Result<StorageStats, StorageError> {
        autocommit!(self, txn => txn.stats().await?)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
