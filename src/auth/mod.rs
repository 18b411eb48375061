//! Credential checks for relay clients.
//!
//! Players identify with `Basic base64(player_id:secret)`. A player without a
//! stored secret is reported as [`AuthStatus::Missing`] so the caller can
//! register the supplied secret on first contact.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{RelayError, StorageError};
use crate::ids::PlayerId;
use crate::storage::{PlayerSecretUpdate, SaveStorage};

pub mod credentials;

pub use credentials::{basic_header, parse_basic, BasicCredentials};

const LOG_TARGET: &str = "save_relay::auth";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    /// Stored secret matches.
    Valid,
    /// Malformed header or secret mismatch.
    Invalid,
    /// Well-formed header for a player that has no stored secret yet.
    Missing,
}

/// Result of [`AuthGate::authenticate`].
///
/// `player_id` and `supplied_secret` are populated for `Valid` and `Missing`
/// only; an `Invalid` outcome never echoes what was sent or stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthOutcome {
    pub player_id: Option<PlayerId>,
    pub supplied_secret: Option<String>,
    pub status: AuthStatus,
}

impl AuthOutcome {
    fn invalid() -> Self {
        Self {
            player_id: None,
            supplied_secret: None,
            status: AuthStatus::Invalid,
        }
    }

    fn with_status(credentials: BasicCredentials, status: AuthStatus) -> Self {
        Self {
            player_id: Some(credentials.player_id),
            supplied_secret: Some(credentials.secret),
            status,
        }
    }
}

pub struct AuthGate {
    storage: Arc<dyn SaveStorage>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    verified: Arc<CredentialCache>,
}

/// Secrets that recently matched storage, keyed by player.
pub type CredentialCache = TtlCache<PlayerId, String>;

impl AuthGate {
    pub fn new(storage: Arc<dyn SaveStorage>, clock: Arc<dyn Clock>, config: AuthConfig) -> Self {
        let verified = Arc::new(TtlCache::new(config.credential_cache_ttl));
        Self {
            storage,
            clock,
            config,
            verified,
        }
    }

    pub fn credential_cache(&self) -> Arc<CredentialCache> {
        Arc::clone(&self.verified)
    }

    /// Classifies the credential header and, for a valid one, refreshes the
    /// player's activity timestamp and address.
    pub async fn authenticate(
        &self,
        header: Option<&str>,
        source_ip: &str,
    ) -> Result<AuthOutcome, RelayError> {
        let Some(credentials) = header.and_then(parse_basic) else {
            return Ok(AuthOutcome::invalid());
        };
        let status = self
            .check(&credentials, source_ip)
            .await
            .map_err(|err| storage_failure(&credentials.player_id, err))?;
        if status == AuthStatus::Invalid {
            debug!(target: LOG_TARGET, player_id = %credentials.player_id, "secret mismatch");
            return Ok(AuthOutcome::invalid());
        }
        Ok(AuthOutcome::with_status(credentials, status))
    }

    /// Identity of the caller, or `RelayError::Auth` unless the header is `Valid`.
    pub async fn require_valid(
        &self,
        header: Option<&str>,
        source_ip: &str,
    ) -> Result<PlayerId, RelayError> {
        let outcome = self.authenticate(header, source_ip).await?;
        match (outcome.status, outcome.player_id) {
            (AuthStatus::Valid, Some(player_id)) => Ok(player_id),
            (AuthStatus::Missing, _) => Err(RelayError::auth("player is not registered")),
            _ => Err(RelayError::auth("invalid credentials")),
        }
    }

    /// Creates the player on first use or replaces its secret.
    pub async fn register_or_update_secret(
        &self,
        player_id: &PlayerId,
        new_secret: &str,
        source_ip: &str,
    ) -> Result<(), RelayError> {
        let len = new_secret.chars().count();
        if len < self.config.min_secret_len || len > self.config.max_secret_len {
            return Err(RelayError::validation(format!(
                "secret must be between {} and {} characters",
                self.config.min_secret_len, self.config.max_secret_len
            )));
        }

        let mut result = self.store_secret(player_id, new_secret, source_ip).await;
        if matches!(&result, Err(err) if err.is_conflict()) {
            // a concurrent first registration created the row; update it instead
            result = self.store_secret(player_id, new_secret, source_ip).await;
        }
        result.map_err(|err| storage_failure(player_id, err))?;

        self.verified.invalidate(player_id);
        info!(target: LOG_TARGET, %player_id, ip = source_ip, "player secret stored");
        Ok(())
    }

    /// `Valid` yields the identity, `Missing` registers the supplied secret first.
    pub async fn authenticate_or_register(
        &self,
        header: Option<&str>,
        source_ip: &str,
    ) -> Result<PlayerId, RelayError> {
        let outcome = self.authenticate(header, source_ip).await?;
        match outcome {
            AuthOutcome {
                status: AuthStatus::Valid,
                player_id: Some(player_id),
                ..
            } => Ok(player_id),
            AuthOutcome {
                status: AuthStatus::Missing,
                player_id: Some(player_id),
                supplied_secret: Some(secret),
            } => {
                self.register_or_update_secret(&player_id, &secret, source_ip)
                    .await?;
                Ok(player_id)
            }
            _ => Err(RelayError::auth("invalid credentials")),
        }
    }

    /// Replaces the caller's secret. The header must be `Valid`, or `Missing`
    /// in which case the player is created with `new_secret`.
    pub async fn change_secret(
        &self,
        header: Option<&str>,
        new_secret: &str,
        source_ip: &str,
    ) -> Result<PlayerId, RelayError> {
        let outcome = self.authenticate(header, source_ip).await?;
        let player_id = match (outcome.status, outcome.player_id) {
            (AuthStatus::Valid | AuthStatus::Missing, Some(player_id)) => player_id,
            _ => return Err(RelayError::auth("invalid credentials")),
        };
        self.register_or_update_secret(&player_id, new_secret, source_ip)
            .await?;
        Ok(player_id)
    }

    async fn check(
        &self,
        credentials: &BasicCredentials,
        source_ip: &str,
    ) -> Result<AuthStatus, StorageError> {
        let player_id = &credentials.player_id;
        let now = self.clock.now();
        let ticket = self.verified.ticket();
        let mut txn = self.storage.begin().await?;

        if self.verified.get(player_id).as_deref() == Some(credentials.secret.as_str()) {
            if txn.touch_player(player_id, source_ip, now).await? {
                txn.commit().await?;
                return Ok(AuthStatus::Valid);
            }
            // player vanished since it was cached
            self.verified.invalidate(player_id);
        }

        let status = match txn.load_player(player_id).await? {
            None => AuthStatus::Missing,
            Some(stored) if stored.password != credentials.secret => AuthStatus::Invalid,
            Some(_) => {
                txn.touch_player(player_id, source_ip, now).await?;
                AuthStatus::Valid
            }
        };

        if status == AuthStatus::Valid {
            txn.commit().await?;
            self.verified
                .insert_if_fresh(player_id.clone(), credentials.secret.clone(), ticket);
        } else {
            txn.rollback().await;
        }
        Ok(status)
    }

    async fn store_secret(
        &self,
        player_id: &PlayerId,
        new_secret: &str,
        source_ip: &str,
    ) -> Result<(), StorageError> {
        let mut txn = self.storage.begin().await?;
        txn.upsert_player_secret(PlayerSecretUpdate {
            player_id: player_id.clone(),
            password: new_secret.to_owned(),
            ip: source_ip.to_owned(),
            at: self.clock.now(),
        })
        .await?;
        txn.commit().await
    }
}

fn storage_failure(player_id: &PlayerId, err: StorageError) -> RelayError {
    error!(target: LOG_TARGET, %player_id, error = %err, "credential storage failure");
    RelayError::internal("credential storage unavailable")
}
