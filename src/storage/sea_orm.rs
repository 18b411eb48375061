use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::db::entity::{games, players, snapshots};
use crate::error::StorageError;
use crate::ids::{GameId, PlayerId, SnapshotKind};

use super::{
    GameUpsert, NewSnapshot, PlayerSecretUpdate, RetentionFlags, SaveStorage, SaveStorageTxn,
    SnapshotKey, StorageStats, StoredGame, StoredPlayer, StoredSnapshot,
};

const LOG_TARGET: &str = "save_relay::storage::sea_orm";

/// Relational storage engine backed by a SeaORM connection pool.
pub struct SeaOrmSaveStorage {
    connection: DatabaseConnection,
}

impl SeaOrmSaveStorage {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

pub struct SeaOrmSaveTxn {
    txn: DatabaseTransaction,
}

#[async_trait]
impl SaveStorage for SeaOrmSaveStorage {
    async fn begin(&self) -> Result<Box<dyn SaveStorageTxn>, StorageError> {
        let txn = self.connection.begin().await?;
        Ok(Box::new(SeaOrmSaveTxn { txn }))
    }
}

#[async_trait]
impl SaveStorageTxn for SeaOrmSaveTxn {
    async fn load_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Option<StoredPlayer>, StorageError> {
        let record = players::Entity::find_by_id(player_id.as_str().to_owned())
            .one(&self.txn)
            .await?;
        Ok(record.map(player_from_model))
    }

    async fn upsert_player_secret(
        &mut self,
        update: PlayerSecretUpdate,
    ) -> Result<(), StorageError> {
        let existing = players::Entity::find_by_id(update.player_id.as_str().to_owned())
            .lock_exclusive()
            .one(&self.txn)
            .await?;
        match existing {
            Some(model) => {
                let mut active: players::ActiveModel = model.into();
                active.password = Set(update.password);
                active.updated_at = Set(update.at);
                active.update_ip = Set(Some(update.ip));
                active.update(&self.txn).await?;
            }
            None => {
                let active = players::ActiveModel {
                    player_id: Set(update.player_id.as_str().to_owned()),
                    password: Set(update.password),
                    whitelisted: Set(false),
                    remark: Set(None),
                    created_at: Set(update.at),
                    updated_at: Set(update.at),
                    create_ip: Set(Some(update.ip.clone())),
                    update_ip: Set(Some(update.ip)),
                };
                active.insert(&self.txn).await?;
            }
        }
        Ok(())
    }

    async fn touch_player(
        &mut self,
        player_id: &PlayerId,
        ip: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = players::Entity::update_many()
            .col_expr(players::Column::UpdatedAt, at.into())
            .col_expr(players::Column::UpdateIp, Some(ip.to_owned()).into())
            .filter(players::Column::PlayerId.eq(player_id.as_str()))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn set_player_retention(
        &mut self,
        player_id: &PlayerId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        let result = players::Entity::update_many()
            .col_expr(players::Column::Whitelisted, retention.whitelisted.into())
            .col_expr(players::Column::Remark, retention.remark.into())
            .col_expr(players::Column::UpdatedAt, retention.at.into())
            .filter(players::Column::PlayerId.eq(player_id.as_str()))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn load_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        let record = games::Entity::find_by_id(game_id.as_str().to_owned())
            .one(&self.txn)
            .await?;
        record.map(game_from_model).transpose()
    }

    async fn lock_game(&mut self, game_id: &GameId) -> Result<Option<StoredGame>, StorageError> {
        let record = games::Entity::find_by_id(game_id.as_str().to_owned())
            .lock_exclusive()
            .one(&self.txn)
            .await?;
        record.map(game_from_model).transpose()
    }

    async fn upsert_game(&mut self, upsert: GameUpsert) -> Result<(), StorageError> {
        let players_json = players_to_json(&upsert.players);
        let existing = games::Entity::find_by_id(upsert.game_id.as_str().to_owned())
            .one(&self.txn)
            .await?;
        match existing {
            Some(model) => {
                let mut active: games::ActiveModel = model.into();
                active.players = Set(players_json);
                active.updated_at = Set(upsert.at);
                if let Some(turns) = upsert.turns {
                    active.turns = Set(turns);
                }
                active.update(&self.txn).await?;
            }
            None => {
                // a racing first writer surfaces as a unique violation, i.e. StorageError::Conflict
                let active = games::ActiveModel {
                    game_id: Set(upsert.game_id.as_str().to_owned()),
                    players: Set(players_json),
                    whitelisted: Set(false),
                    turns: Set(upsert.turns.unwrap_or(0)),
                    remark: Set(None),
                    created_at: Set(upsert.at),
                    updated_at: Set(upsert.at),
                    created_player: Set(Some(upsert.writer.as_str().to_owned())),
                };
                active.insert(&self.txn).await?;
            }
        }
        Ok(())
    }

    async fn set_game_retention(
        &mut self,
        game_id: &GameId,
        retention: RetentionFlags,
    ) -> Result<bool, StorageError> {
        let result = games::Entity::update_many()
            .col_expr(games::Column::Whitelisted, retention.whitelisted.into())
            .col_expr(games::Column::Remark, retention.remark.into())
            .col_expr(games::Column::UpdatedAt, retention.at.into())
            .filter(games::Column::GameId.eq(game_id.as_str()))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<i64, StorageError> {
        let active = snapshots::ActiveModel {
            game_id: Set(snapshot.game_id.as_str().to_owned()),
            kind: Set(snapshot.kind.as_str().to_owned()),
            turns: Set(snapshot.turns),
            payload: Set(snapshot.payload),
            created_player: Set(snapshot.created_player.as_str().to_owned()),
            created_ip: Set(snapshot.created_ip),
            created_at: Set(snapshot.created_at),
            ..Default::default()
        };
        let inserted = active.insert(&self.txn).await?;
        debug!(
            target: LOG_TARGET,
            game_id = %snapshot.game_id,
            kind = %snapshot.kind,
            snapshot_id = inserted.id,
            "snapshot row inserted"
        );
        Ok(inserted.id)
    }

    async fn latest_snapshot(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Option<StoredSnapshot>, StorageError> {
        let record = snapshots::Entity::find()
            .filter(snapshots::Column::GameId.eq(game_id.as_str()))
            .filter(snapshots::Column::Kind.eq(kind.as_str()))
            .order_by_desc(snapshots::Column::CreatedAt)
            .order_by_desc(snapshots::Column::Turns)
            .order_by_desc(snapshots::Column::Id)
            .one(&self.txn)
            .await?;
        record.map(snapshot_from_model).transpose()
    }

    async fn snapshot_history(
        &mut self,
        game_id: &GameId,
        kind: SnapshotKind,
    ) -> Result<Vec<StoredSnapshot>, StorageError> {
        snapshots::Entity::find()
            .filter(snapshots::Column::GameId.eq(game_id.as_str()))
            .filter(snapshots::Column::Kind.eq(kind.as_str()))
            .order_by_asc(snapshots::Column::Turns)
            .order_by_asc(snapshots::Column::CreatedAt)
            .order_by_asc(snapshots::Column::Id)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(snapshot_from_model)
            .collect()
    }

    async fn list_games(&mut self) -> Result<Vec<StoredGame>, StorageError> {
        games::Entity::find()
            .order_by_desc(games::Column::UpdatedAt)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(game_from_model)
            .collect()
    }

    async fn games_for_player(
        &mut self,
        player_id: &PlayerId,
    ) -> Result<Vec<StoredGame>, StorageError> {
        // jsonb containment keeps the membership filter in the database
        let member = players_to_json(std::slice::from_ref(player_id));
        games::Entity::find()
            .filter(Expr::cust_with_values("players @> ?", [member]))
            .order_by_desc(games::Column::UpdatedAt)
            .all(&self.txn)
            .await?
            .into_iter()
            .map(game_from_model)
            .collect()
    }

    async fn list_players(&mut self) -> Result<Vec<StoredPlayer>, StorageError> {
        let records = players::Entity::find()
            .order_by_desc(players::Column::CreatedAt)
            .all(&self.txn)
            .await?;
        Ok(records.into_iter().map(player_from_model).collect())
    }

    async fn list_snapshot_keys(&mut self) -> Result<Vec<SnapshotKey>, StorageError> {
        let rows: Vec<(i64, String, String, i64, DateTime<Utc>)> = snapshots::Entity::find()
            .select_only()
            .column(snapshots::Column::Id)
            .column(snapshots::Column::GameId)
            .column(snapshots::Column::Kind)
            .column(snapshots::Column::Turns)
            .column(snapshots::Column::CreatedAt)
            .into_tuple()
            .all(&self.txn)
            .await?;
        rows.into_iter()
            .map(|(id, game_id, kind, turns, created_at)| {
                Ok(SnapshotKey {
                    id,
                    game_id: GameId::from_stored(game_id),
                    kind: parse_kind(&kind)?,
                    turns,
                    created_at,
                })
            })
            .collect()
    }

    async fn delete_games(&mut self, game_ids: &[GameId]) -> Result<u64, StorageError> {
        if game_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = game_ids.iter().map(|id| id.as_str().to_owned()).collect();
        snapshots::Entity::delete_many()
            .filter(snapshots::Column::GameId.is_in(ids.clone()))
            .exec(&self.txn)
            .await?;
        let result = games::Entity::delete_many()
            .filter(games::Column::GameId.is_in(ids))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn delete_players(&mut self, player_ids: &[PlayerId]) -> Result<u64, StorageError> {
        if player_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = player_ids.iter().map(|id| id.as_str().to_owned()).collect();
        let result = players::Entity::delete_many()
            .filter(players::Column::PlayerId.is_in(ids))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn delete_snapshots(&mut self, snapshot_ids: &[i64]) -> Result<u64, StorageError> {
        if snapshot_ids.is_empty() {
            return Ok(0);
        }
        let result = snapshots::Entity::delete_many()
            .filter(snapshots::Column::Id.is_in(snapshot_ids.to_vec()))
            .exec(&self.txn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn stats(&mut self) -> Result<StorageStats, StorageError> {
        let players = players::Entity::find().count(&self.txn).await?;
        let whitelisted_players = players::Entity::find()
            .filter(players::Column::Whitelisted.eq(true))
            .count(&self.txn)
            .await?;
        let games = games::Entity::find().count(&self.txn).await?;
        let whitelisted_games = games::Entity::find()
            .filter(games::Column::Whitelisted.eq(true))
            .count(&self.txn)
            .await?;
        let content_snapshots = snapshots::Entity::find()
            .filter(snapshots::Column::Kind.eq(SnapshotKind::Content.as_str()))
            .count(&self.txn)
            .await?;
        let preview_snapshots = snapshots::Entity::find()
            .filter(snapshots::Column::Kind.eq(SnapshotKind::Preview.as_str()))
            .count(&self.txn)
            .await?;
        Ok(StorageStats {
            players,
            whitelisted_players,
            games,
            whitelisted_games,
            content_snapshots,
            preview_snapshots,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        let _ = self.txn.rollback().await;
    }
}

fn players_to_json(players: &[PlayerId]) -> JsonValue {
    JsonValue::Array(
        players
            .iter()
            .map(|id| JsonValue::String(id.as_str().to_owned()))
            .collect(),
    )
}

fn players_from_json(game_id: &str, value: &JsonValue) -> Result<Vec<PlayerId>, StorageError> {
    let entries = value.as_array().ok_or_else(|| {
        StorageError::corrupt(format!("game {game_id} players column is not an array"))
    })?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(PlayerId::from_stored)
                .ok_or_else(|| {
                    StorageError::corrupt(format!("game {game_id} has a non-string player id"))
                })
        })
        .collect()
}

fn parse_kind(raw: &str) -> Result<SnapshotKind, StorageError> {
    SnapshotKind::parse(raw)
        .ok_or_else(|| StorageError::corrupt(format!("unknown snapshot kind `{raw}`")))
}

fn player_from_model(model: players::Model) -> StoredPlayer {
    StoredPlayer {
        player_id: PlayerId::from_stored(model.player_id),
        password: model.password,
        whitelisted: model.whitelisted,
        remark: model.remark,
        created_at: model.created_at,
        updated_at: model.updated_at,
        create_ip: model.create_ip,
        update_ip: model.update_ip,
    }
}

fn game_from_model(model: games::Model) -> Result<StoredGame, StorageError> {
    let players = players_from_json(&model.game_id, &model.players)?;
    Ok(StoredGame {
        game_id: GameId::from_stored(model.game_id),
        players,
        whitelisted: model.whitelisted,
        turns: model.turns,
        remark: model.remark,
        created_at: model.created_at,
        updated_at: model.updated_at,
        created_player: model.created_player.map(PlayerId::from_stored),
    })
}

fn snapshot_from_model(model: snapshots::Model) -> Result<StoredSnapshot, StorageError> {
    Ok(StoredSnapshot {
        id: model.id,
        kind: parse_kind(&model.kind)?,
        game_id: GameId::from_stored(model.game_id),
        turns: model.turns,
        payload: model.payload,
        created_player: PlayerId::from_stored(model.created_player),
        created_ip: model.created_ip,
        created_at: model.created_at,
    })
}
