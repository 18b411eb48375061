use std::time::Duration;

use chrono::TimeDelta;

/// Runtime knobs of the relay core. Defaults mirror the production deployment.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub limits: PayloadLimits,
    pub auth: AuthConfig,
    pub retention: RetentionPolicy,
    pub coordinator: CoordinatorConfig,
}

#[derive(Clone, Debug)]
pub struct PayloadLimits {
    /// Largest accepted request body (the encoded token).
    pub max_body_bytes: usize,
    /// Largest accepted save after gzip expansion.
    pub max_decoded_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            max_decoded_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub min_secret_len: usize,
    pub max_secret_len: usize,
    pub credential_cache_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_secret_len: 6,
            max_secret_len: 128,
            credential_cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub snapshot_cache_ttl: Duration,
    /// Attempts for the transactional part of a write when storage reports contention.
    pub write_attempts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            snapshot_cache_ttl: Duration::from_secs(60),
            write_attempts: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    /// Non-whitelisted games and players untouched for this long are reclaimed.
    pub stale_after: TimeDelta,
    /// Age after which a game that never saw follow-up activity is reclaimed.
    pub abandoned_after: TimeDelta,
    /// A game whose last update lies within this span of its creation counts as inactive.
    pub activity_threshold: TimeDelta,
    /// Maximum ids per delete statement.
    pub batch_size: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            stale_after: TimeDelta::days(90),
            abandoned_after: TimeDelta::days(1),
            activity_threshold: TimeDelta::minutes(10),
            batch_size: 500,
        }
    }
}
