//! Reclaims expired games, orphaned players and superseded snapshot history.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cache::ExpiringCache;
use crate::clock::Clock;
use crate::config::RetentionPolicy;
use crate::coordinator::SnapshotCache;
use crate::error::{RelayError, StorageError};
use crate::ids::{GameId, PlayerId, SnapshotKind};
use crate::storage::{SaveStorage, SaveStorageTxn};

pub mod policy;
mod schedule;

const LOG_TARGET: &str = "save_relay::sweeper";

/// Rows removed by one sweep. Snapshots of deleted games are not counted in
/// `deleted_snapshots`; that field counts trimmed history only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted_games: u64,
    pub deleted_players: u64,
    pub deleted_snapshots: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.deleted_games == 0 && self.deleted_players == 0 && self.deleted_snapshots == 0
    }
}

pub struct RetentionSweeper {
    storage: Arc<dyn SaveStorage>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
    snapshots: Option<Arc<SnapshotCache>>,
    caches: Vec<Arc<dyn ExpiringCache>>,
}

impl RetentionSweeper {
    pub fn new(storage: Arc<dyn SaveStorage>, clock: Arc<dyn Clock>, policy: RetentionPolicy) -> Self {
        Self {
            storage,
            clock,
            policy,
            snapshots: None,
            caches: Vec::new(),
        }
    }

    /// Evicts deleted games from a coordinator's read cache after each sweep.
    pub fn with_snapshot_cache(mut self, cache: Arc<SnapshotCache>) -> Self {
        self.caches.push(Arc::clone(&cache) as Arc<dyn ExpiringCache>);
        self.snapshots = Some(cache);
        self
    }

    /// Registers a cache whose expired entries [`RetentionSweeper::purge_caches`] drops.
    pub fn with_expiring_cache(mut self, cache: Arc<dyn ExpiringCache>) -> Self {
        self.caches.push(cache);
        self
    }

    /// Drops expired entries from every registered cache and returns how many went.
    pub fn purge_caches(&self) -> usize {
        let purged: usize = self
            .caches
            .iter()
            .map(|cache| cache.purge_expired())
            .sum();
        debug!(target: LOG_TARGET, purged, "expired cache entries dropped");
        purged
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn sweep(&self) -> Result<SweepReport, RelayError> {
        self.sweep_at(self.clock.now()).await
    }

    /// Runs one sweep with `now` as the reference time. All deletions share a
    /// single transaction; nothing is removed if any step fails.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, RelayError> {
        let started = Instant::now();
        let (report, deleted_games) = self.run(now).await.map_err(|err| {
            error!(
                target: LOG_TARGET,
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "retention sweep failed"
            );
            RelayError::internal("retention sweep failed")
        })?;

        if let Some(cache) = &self.snapshots {
            for game_id in &deleted_games {
                for kind in SnapshotKind::ALL {
                    cache.invalidate(&(game_id.clone(), kind));
                }
            }
        }

        info!(
            target: LOG_TARGET,
            deleted_games = report.deleted_games,
            deleted_players = report.deleted_players,
            deleted_snapshots = report.deleted_snapshots,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<(SweepReport, Vec<GameId>), StorageError> {
        let mut txn = self.storage.begin().await?;
        let mut report = SweepReport::default();

        let games = txn.list_games().await?;
        let (expired, surviving): (Vec<_>, Vec<_>) = games
            .into_iter()
            .partition(|game| policy::is_game_expired(game, now, &self.policy));
        let expired: Vec<GameId> = expired.into_iter().map(|game| game.game_id).collect();
        for chunk in expired.chunks(self.batch_size()) {
            report.deleted_games += txn.delete_games(chunk).await?;
        }

        let referenced: HashSet<PlayerId> = surviving
            .into_iter()
            .flat_map(|game| game.players)
            .collect();
        let players: Vec<PlayerId> = txn
            .list_players()
            .await?
            .into_iter()
            .filter(|player| policy::is_player_expired(player, &referenced, now, &self.policy))
            .map(|player| player.player_id)
            .collect();
        for chunk in players.chunks(self.batch_size()) {
            report.deleted_players += txn.delete_players(chunk).await?;
        }

        report.deleted_snapshots = self.trim_history(txn.as_mut()).await?;
        txn.commit().await?;
        Ok((report, expired))
    }

    async fn trim_history(&self, txn: &mut dyn SaveStorageTxn) -> Result<u64, StorageError> {
        let keys = txn.list_snapshot_keys().await?;
        let superseded = policy::superseded_snapshots(&keys);
        debug!(
            target: LOG_TARGET,
            snapshots = keys.len(),
            superseded = superseded.len(),
            "snapshot history scanned"
        );
        let mut deleted = 0;
        for chunk in superseded.chunks(self.batch_size()) {
            deleted += txn.delete_snapshots(chunk).await?;
        }
        Ok(deleted)
    }

    fn batch_size(&self) -> usize {
        self.policy.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests;
