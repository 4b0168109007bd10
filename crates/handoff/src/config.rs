//! Tunables shared by every generation of a service.

use std::time::Duration;

/// Namespace prefix of the handoff environment variables.
pub const DEFAULT_ENV_PREFIX: &str = "__graceful__";

/// Default drain grace period in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default delay before respawning a child that exited unsuccessfully.
pub const DEFAULT_RESPAWN_BACKOFF_MS: u64 = 1000;

/// Handoff configuration.
///
/// Parent and child must agree on `env_prefix`; the other fields are local
/// to each generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Prefix of `<prefix><name>_idx` variables.
    pub env_prefix: String,
    /// How long a draining server may keep finishing in-flight work.
    pub grace_period: Duration,
    /// Pause before respawning after an unsuccessful child exit.
    pub respawn_backoff: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            grace_period: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            respawn_backoff: Duration::from_millis(DEFAULT_RESPAWN_BACKOFF_MS),
        }
    }
}

impl HandoffConfig {
    /// Load from the environment, falling back to defaults.
    ///
    /// - `HANDOFF_DRAIN_TIMEOUT_SECS`: drain grace period (default: 30)
    /// - `HANDOFF_RESPAWN_BACKOFF_MS`: crash respawn delay (default: 1000)
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let grace_secs: u64 = std::env::var("HANDOFF_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS);

        let backoff_ms: u64 = std::env::var("HANDOFF_RESPAWN_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RESPAWN_BACKOFF_MS);

        Self {
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            grace_period: Duration::from_secs(grace_secs),
            respawn_backoff: Duration::from_millis(backoff_ms),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_respawn_backoff(mut self, respawn_backoff: Duration) -> Self {
        self.respawn_backoff = respawn_backoff;
        self
    }

    pub fn with_env_prefix(mut self, env_prefix: impl Into<String>) -> Self {
        self.env_prefix = env_prefix.into();
        self
    }
}
