//! Pure retention predicates, evaluated against a fixed `now`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::RetentionPolicy;
use crate::ids::{GameId, PlayerId, SnapshotKind};
use crate::storage::{SnapshotKey, StoredGame, StoredPlayer};

/// Untouched for longer than the staleness window.
pub fn is_game_stale(game: &StoredGame, now: DateTime<Utc>, policy: &RetentionPolicy) -> bool {
    game.updated_at < now - policy.stale_after
}

/// Old enough to judge, yet never updated meaningfully after its first write.
pub fn is_game_abandoned(game: &StoredGame, now: DateTime<Utc>, policy: &RetentionPolicy) -> bool {
    game.created_at < now - policy.abandoned_after
        && game.updated_at - game.created_at <= policy.activity_threshold
}

pub fn is_game_expired(game: &StoredGame, now: DateTime<Utc>, policy: &RetentionPolicy) -> bool {
    !game.whitelisted
        && (is_game_stale(game, now, policy) || is_game_abandoned(game, now, policy))
}

/// `referenced` holds every member of the games that survive the sweep.
pub fn is_player_expired(
    player: &StoredPlayer,
    referenced: &HashSet<PlayerId>,
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
) -> bool {
    !player.whitelisted
        && !referenced.contains(&player.player_id)
        && player.updated_at < now - policy.stale_after
}

/// Ids of every snapshot that is not the latest of its `(game, kind)` stream.
pub fn superseded_snapshots(keys: &[SnapshotKey]) -> Vec<i64> {
    let mut latest: HashMap<(&GameId, SnapshotKind), &SnapshotKey> = HashMap::new();
    for key in keys {
        latest
            .entry((&key.game_id, key.kind))
            .and_modify(|current| {
                if key.recency() > current.recency() {
                    *current = key;
                }
            })
            .or_insert(key);
    }
    let mut superseded: Vec<i64> = keys
        .iter()
        .filter(|key| {
            latest
                .get(&(&key.game_id, key.kind))
                .is_some_and(|winner| winner.id != key.id)
        })
        .map(|key| key.id)
        .collect();
    superseded.sort_unstable();
    superseded
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::test_utils::{epoch, ALICE, GAME, OTHER_GAME};

    fn game(created_ago: TimeDelta, updated_ago: TimeDelta) -> StoredGame {
        StoredGame {
            game_id: GameId::from_stored(GAME),
            players: vec![PlayerId::from_stored(ALICE)],
            whitelisted: false,
            turns: 0,
            remark: None,
            created_at: epoch() - created_ago,
            updated_at: epoch() - updated_ago,
            created_player: None,
        }
    }

    fn key(id: i64, game: &str, kind: SnapshotKind, turns: i64, secs: i64) -> SnapshotKey {
        SnapshotKey {
            id,
            game_id: GameId::from_stored(game),
            kind,
            turns,
            created_at: epoch() + TimeDelta::seconds(secs),
        }
    }

    #[test]
    fn stale_games_expire_unless_whitelisted() {
        let policy = RetentionPolicy::default();
        let mut stale = game(TimeDelta::days(200), TimeDelta::days(91));
        assert!(is_game_expired(&stale, epoch(), &policy));

        stale.whitelisted = true;
        assert!(!is_game_expired(&stale, epoch(), &policy));

        let active = game(TimeDelta::days(200), TimeDelta::days(89));
        assert!(!is_game_expired(&active, epoch(), &policy));
    }

    #[test]
    fn abandoned_young_games_expire() {
        let policy = RetentionPolicy::default();
        let abandoned = game(TimeDelta::hours(30), TimeDelta::hours(30) - TimeDelta::minutes(5));
        assert!(is_game_abandoned(&abandoned, epoch(), &policy));

        let too_young = game(TimeDelta::hours(20), TimeDelta::hours(20));
        assert!(!is_game_abandoned(&too_young, epoch(), &policy));

        let continued = game(TimeDelta::hours(30), TimeDelta::hours(2));
        assert!(!is_game_abandoned(&continued, epoch(), &policy));
    }

    #[test]
    fn keeps_latest_snapshot_per_stream() {
        let keys = vec![
            key(1, GAME, SnapshotKind::Content, 1, 0),
            key(2, GAME, SnapshotKind::Content, 3, 10),
            key(3, GAME, SnapshotKind::Content, 2, 10),
            key(4, GAME, SnapshotKind::Preview, 0, 0),
            key(5, OTHER_GAME, SnapshotKind::Content, 9, 5),
            key(6, OTHER_GAME, SnapshotKind::Content, 9, 5),
        ];
        assert_eq!(superseded_snapshots(&keys), vec![1, 3, 5]);
    }
}
