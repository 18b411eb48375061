use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{RetentionSweeper, LOG_TARGET};

const TASK_NAME: &str = "retention_sweeper";

/// Upper bound on how long expired cache entries linger.
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

impl RetentionSweeper {
    /// Runs maintenance until `cancel` fires: a sweep every `sweep_every`
    /// (never when `None`), and a purge of registered caches at least every
    /// [`CACHE_PURGE_INTERVAL`]. The first sweep runs immediately. A failed
    /// sweep is logged and retried on the next tick.
    pub fn spawn(
        self: Arc<Self>,
        sweep_every: Option<Duration>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let purge_every = sweep_every
            .map_or(CACHE_PURGE_INTERVAL, |every| every.min(CACHE_PURGE_INTERVAL));
        spawn_named_task(TASK_NAME, async move {
            let mut sweeps = sweep_every.map(ticker);
            let mut purges = ticker(purge_every);
            info!(
                target: LOG_TARGET,
                sweep_every_secs = ?sweep_every.map(|every| every.as_secs()),
                purge_every_secs = purge_every.as_secs(),
                "retention sweeper started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(target: LOG_TARGET, "cancellation token triggered; stopping sweeper");
                        break;
                    }
                    _ = next_tick(sweeps.as_mut()) => {
                        if let Err(err) = self.sweep().await {
                            warn!(target: LOG_TARGET, error = %err, "sweep failed; retrying next tick");
                        }
                    }
                    _ = purges.tick() => {
                        self.purge_caches();
                    }
                }
            }
        })
    }
}

fn ticker(every: Duration) -> Interval {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Spawns the task inside a span carrying its name.
fn spawn_named_task<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = info_span!("task", task_name = %name);
    tokio::spawn(future.instrument(span))
}
