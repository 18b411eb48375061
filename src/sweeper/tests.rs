use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::auth::basic_header;
use crate::config::RelayConfig;
use crate::ids::{GameId, PlayerId};
use crate::test_utils::{
    epoch, relay, relay_with, save_json, token_for, TestRelay, ALICE, BOB, CAROL, GAME, IP,
    OTHER_GAME,
};

const DAVE: &str = "44444444-4444-4444-4444-444444444444";

fn pid(raw: &str) -> PlayerId {
    PlayerId::parse(raw).unwrap()
}

fn gid(raw: &str) -> GameId {
    GameId::parse(raw).unwrap()
}

async fn register(ctx: &TestRelay, player: &str) {
    ctx.relay
        .auth()
        .register_or_update_secret(&pid(player), "hunter22", IP)
        .await
        .unwrap();
}

async fn write(ctx: &TestRelay, player: &str, game: &str, turns: i64, kind: SnapshotKind) {
    let token = token_for(&save_json(game, turns, &[player]));
    ctx.relay
        .coordinator()
        .write(&pid(player), &gid(game), &token, kind, IP)
        .await
        .unwrap();
}

#[tokio::test]
async fn removes_stale_games_and_orphaned_players() {
    let ctx = relay();
    for player in [ALICE, BOB, CAROL, DAVE] {
        register(&ctx, player).await;
    }
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;
    write(&ctx, BOB, OTHER_GAME, 0, SnapshotKind::Content).await;
    ctx.clock.advance(TimeDelta::hours(1));
    write(&ctx, ALICE, GAME, 1, SnapshotKind::Content).await;
    write(&ctx, BOB, OTHER_GAME, 1, SnapshotKind::Content).await;

    let coordinator = ctx.relay.coordinator();
    coordinator
        .set_game_retention(&gid(OTHER_GAME), true, Some("archived league".into()))
        .await
        .unwrap();
    coordinator
        .set_player_retention(&pid(CAROL), true, None)
        .await
        .unwrap();

    let report = ctx
        .relay
        .sweeper()
        .sweep_at(epoch() + TimeDelta::days(100))
        .await
        .unwrap();
    assert_eq!(
        report,
        SweepReport {
            deleted_games: 1,
            deleted_players: 2,
            deleted_snapshots: 1,
        }
    );

    let stats = coordinator.stats().await.unwrap();
    assert_eq!(stats.games, 1);
    // bob is still referenced by the whitelisted game, carol is whitelisted
    assert_eq!(stats.players, 2);
    assert_eq!(stats.content_snapshots, 1);
    assert!(coordinator.games_for_player(&pid(ALICE)).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_sweep_without_writes_deletes_nothing() {
    let ctx = relay();
    register(&ctx, ALICE).await;
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Preview).await;
    ctx.clock.advance(TimeDelta::hours(2));
    write(&ctx, ALICE, GAME, 1, SnapshotKind::Content).await;
    write(&ctx, BOB, OTHER_GAME, 0, SnapshotKind::Content).await;

    let sweeper = ctx.relay.sweeper();
    let now = epoch() + TimeDelta::days(3);
    let first = sweeper.sweep_at(now).await.unwrap();
    assert!(!first.is_empty());

    let second = sweeper.sweep_at(now).await.unwrap();
    assert_eq!(second, SweepReport::default());
}

#[tokio::test]
async fn abandoned_young_games_are_reclaimed() {
    let ctx = relay();
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;
    ctx.clock.advance(TimeDelta::minutes(5));
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Preview).await;

    write(&ctx, BOB, OTHER_GAME, 0, SnapshotKind::Content).await;
    ctx.clock.advance(TimeDelta::hours(1));
    write(&ctx, BOB, OTHER_GAME, 1, SnapshotKind::Content).await;

    let sweeper = ctx.relay.sweeper();
    let report = sweeper.sweep_at(epoch() + TimeDelta::hours(12)).await.unwrap();
    assert_eq!(report.deleted_games, 0);

    let report = sweeper.sweep_at(epoch() + TimeDelta::days(2)).await.unwrap();
    assert_eq!(report.deleted_games, 1);

    let coordinator = ctx.relay.coordinator();
    let err = coordinator
        .read(&gid(GAME), SnapshotKind::Content, None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    coordinator
        .read(&gid(OTHER_GAME), SnapshotKind::Content, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn trims_history_to_latest_per_stream() {
    let ctx = relay();
    for turns in 0..4 {
        write(&ctx, ALICE, GAME, turns, SnapshotKind::Content).await;
        write(&ctx, ALICE, GAME, turns, SnapshotKind::Preview).await;
        ctx.clock.advance(TimeDelta::minutes(20));
    }

    let report = ctx.relay.sweeper().sweep().await.unwrap();
    assert_eq!(report.deleted_games, 0);
    assert_eq!(report.deleted_snapshots, 6);

    let coordinator = ctx.relay.coordinator();
    let history = coordinator.history(&gid(GAME), &pid(ALICE)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].turns, 3);
    coordinator
        .read(&gid(GAME), SnapshotKind::Preview, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn swept_games_are_evicted_from_the_read_cache() {
    let ctx = relay();
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;
    let coordinator = ctx.relay.coordinator();
    coordinator
        .read(&gid(GAME), SnapshotKind::Content, None)
        .await
        .unwrap();

    ctx.relay
        .sweeper()
        .sweep_at(epoch() + TimeDelta::days(120))
        .await
        .unwrap();

    let err = coordinator
        .read(&gid(GAME), SnapshotKind::Content, None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn scheduled_sweeper_runs_until_cancelled() {
    let ctx = relay();
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;
    ctx.clock.advance(TimeDelta::hours(1));
    write(&ctx, ALICE, GAME, 1, SnapshotKind::Content).await;

    let cancel = CancellationToken::new();
    let handle = Arc::clone(ctx.relay.sweeper())
        .spawn(Some(Duration::from_millis(10)), cancel.clone());

    let coordinator = ctx.relay.coordinator();
    let mut trimmed = false;
    for _ in 0..100 {
        if coordinator.stats().await.unwrap().content_snapshots == 1 {
            trimmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(trimmed, "scheduled sweep never trimmed history");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweeper stops after cancellation")
        .unwrap();
}

#[tokio::test]
async fn purge_drops_expired_credentials_and_snapshots() {
    let mut config = RelayConfig::default();
    config.auth.credential_cache_ttl = Duration::from_millis(1);
    config.coordinator.snapshot_cache_ttl = Duration::from_millis(1);
    let ctx = relay_with(config);
    register(&ctx, ALICE).await;
    write(&ctx, ALICE, GAME, 0, SnapshotKind::Content).await;

    ctx.relay
        .auth()
        .require_valid(Some(&basic_header(ALICE, "hunter22")), IP)
        .await
        .unwrap();
    ctx.relay
        .coordinator()
        .read(&gid(GAME), SnapshotKind::Content, Some(&pid(ALICE)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = ctx.relay.sweeper();
    // the verified secret, the cached save and the preview invalidation marker
    assert_eq!(sweeper.purge_caches(), 3);
    assert_eq!(sweeper.purge_caches(), 0);
}
