//! Modwarden configuration.
//!
//! All settings have reference defaults; a JSON document only needs to name
//! the values it overrides. Durations are whole seconds in JSON, except the
//! per-row retry backoff which is milliseconds.

use crate::limiter::RatePolicy;
use crate::ModwardenError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModwardenConfig {
    /// Admission gate settings.
    pub gate: GateConfig,

    /// Session token lifetimes.
    pub sessions: SessionLifetimes,

    /// Token signing settings.
    pub tokens: TokenConfig,

    /// Reconciliation worker settings.
    pub worker: WorkerConfig,
}

/// Admission gate configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Limiter applied per identity on guarded paths.
    pub identity_limit: RatePolicy,

    /// Looser limiter applied per source address on exempt paths.
    pub address_limit: RatePolicy,

    /// Idle time after which a rate window is forgotten.
    #[serde(with = "duration_secs")]
    pub window_ttl: Duration,

    /// Maximum number of requests validated concurrently per drained batch.
    pub batch_size: usize,

    /// High-water mark for queued requests; enqueues beyond it are rejected.
    pub queue_capacity: usize,

    /// Path prefixes that bypass identity limiting and session validation.
    pub exempt_prefixes: Vec<String>,

    /// Path prefix that additionally requires the admin role.
    pub admin_prefix: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            identity_limit: RatePolicy {
                max_requests: 10,
                window: Duration::from_secs(30),
                block_for: Duration::from_secs(60),
            },
            address_limit: RatePolicy {
                max_requests: 50,
                window: Duration::from_secs(60),
                block_for: Duration::from_secs(5 * 60),
            },
            window_ttl: Duration::from_secs(10 * 60),
            batch_size: 300,
            queue_capacity: 10_000,
            exempt_prefixes: [
                "/api/auth/login",
                "/api/check/",
                "/health",
                "/favicon",
                "/api/mods/public",
                "/api/token/valid",
                "/api/user/getMods",
                "/api/ip",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            admin_prefix: "/api/admin".to_string(),
        }
    }
}

/// How long an issued or refreshed session stays valid.
///
/// - `new_session`: no prior session, or the prior one has expired
/// - `returning_session`: the prior session is still valid; it is extended
/// - `subscriber`: the user holds an active, unexpired subscription
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionLifetimes {
    /// Lifetime of a freshly minted session.
    #[serde(with = "duration_secs")]
    pub new_session: Duration,

    /// Extension granted to a still-valid session on re-login.
    #[serde(with = "duration_secs")]
    pub returning_session: Duration,

    /// Lifetime for users with a known-good subscription.
    #[serde(with = "duration_secs")]
    pub subscriber: Duration,
}

impl Default for SessionLifetimes {
    fn default() -> Self {
        Self {
            new_session: Duration::from_secs(30 * 60),
            returning_session: Duration::from_secs(30 * 60),
            subscriber: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Session token signing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Prefix of the per-user signing seed (`<prefix>-<identity>-`).
    pub seed_prefix: String,

    /// Signing keys shorter than this are padded with random filler.
    pub min_key_length: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            seed_prefix: "MODWARDEN".to_string(),
            min_key_length: 32,
        }
    }
}

/// Reconciliation worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Time between sweeps.
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// How far an auto-renewed subscription is pushed forward.
    #[serde(with = "duration_secs")]
    pub renewal_period: Duration,

    /// Attempts per row before it is reported as failed.
    pub max_row_attempts: u32,

    /// Pause between attempts on a transient store failure.
    #[serde(rename = "retry_backoff_ms", with = "duration_millis")]
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            renewal_period: Duration::from_secs(30 * 24 * 60 * 60),
            max_row_attempts: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl ModwardenConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ModwardenError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ModwardenError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ModwardenError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            ModwardenError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), ModwardenError> {
        self.gate.identity_limit.validate("gate.identity_limit")?;
        self.gate.address_limit.validate("gate.address_limit")?;

        if self.gate.batch_size == 0 {
            return Err(ModwardenError::ConfigError(
                "gate.batch_size must be at least 1".to_string(),
            ));
        }
        if self.gate.queue_capacity < self.gate.batch_size {
            return Err(ModwardenError::ConfigError(format!(
                "gate.queue_capacity ({}) must be >= gate.batch_size ({})",
                self.gate.queue_capacity, self.gate.batch_size
            )));
        }
        let longest_window = self
            .gate
            .identity_limit
            .window
            .max(self.gate.address_limit.window);
        if self.gate.window_ttl < longest_window {
            return Err(ModwardenError::ConfigError(
                "gate.window_ttl must cover both the identity and the address window".to_string(),
            ));
        }
        if !self.gate.admin_prefix.starts_with('/') {
            return Err(ModwardenError::ConfigError(
                "gate.admin_prefix must start with '/'".to_string(),
            ));
        }
        if self.tokens.seed_prefix.is_empty() {
            return Err(ModwardenError::ConfigError(
                "tokens.seed_prefix cannot be empty".to_string(),
            ));
        }
        if self.tokens.min_key_length < 32 {
            return Err(ModwardenError::ConfigError(format!(
                "tokens.min_key_length must be >= 32, got {}",
                self.tokens.min_key_length
            )));
        }
        if self.sessions.new_session.is_zero() || self.sessions.returning_session.is_zero() {
            return Err(ModwardenError::ConfigError(
                "session lifetimes must be non-zero".to_string(),
            ));
        }
        if self.worker.interval.is_zero() || self.worker.renewal_period.is_zero() {
            return Err(ModwardenError::ConfigError(
                "worker.interval and worker.renewal_period must be non-zero".to_string(),
            ));
        }
        if self.worker.max_row_attempts == 0 {
            return Err(ModwardenError::ConfigError(
                "worker.max_row_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
