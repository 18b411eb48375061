use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::AuthGate;
use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::coordinator::SaveCoordinator;
use crate::error::StorageError;
use crate::storage::{InMemorySaveStorage, SaveStorage};
use crate::sweeper::RetentionSweeper;

/// The relay core wired over one storage engine: auth gate, save
/// coordinator and retention sweeper sharing storage, clock and caches.
/// The sweeper also purges the gate's and the coordinator's caches.
#[derive(Clone)]
pub struct SaveRelay {
    auth: Arc<AuthGate>,
    coordinator: Arc<SaveCoordinator>,
    sweeper: Arc<RetentionSweeper>,
    config: RelayConfig,
}

impl SaveRelay {
    pub fn new(storage: Arc<dyn SaveStorage>, clock: Arc<dyn Clock>, config: RelayConfig) -> Self {
        let auth = AuthGate::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            config.auth.clone(),
        );
        let coordinator = SaveCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            config.limits.clone(),
            config.coordinator.clone(),
        );
        let sweeper = RetentionSweeper::new(storage, clock, config.retention.clone())
            .with_snapshot_cache(coordinator.snapshot_cache())
            .with_expiring_cache(auth.credential_cache());
        Self {
            auth: Arc::new(auth),
            coordinator: Arc::new(coordinator),
            sweeper: Arc::new(sweeper),
            config,
        }
    }

    /// Volatile relay on the system clock.
    pub fn in_memory(config: RelayConfig) -> Self {
        Self::new(
            Arc::new(InMemorySaveStorage::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    /// Relay persisted to a single JSON file.
    pub fn file_backed(path: impl Into<PathBuf>, config: RelayConfig) -> Result<Self, StorageError> {
        let storage = InMemorySaveStorage::open(path)?;
        Ok(Self::new(Arc::new(storage), Arc::new(SystemClock), config))
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn coordinator(&self) -> &SaveCoordinator {
        &self.coordinator
    }

    pub fn sweeper(&self) -> &Arc<RetentionSweeper> {
        &self.sweeper
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
