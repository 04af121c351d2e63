use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub queue: QueueSettings,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SLUICE_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SLUICE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            queue: QueueSettings::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Check cross-field invariants that env parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:    {}:{} (public {})", self.server.host, self.server.port, self.server.public_url);
        tracing::info!(
            "  postgres:  {}",
            if self.postgres.is_configured() { self.postgres.host.as_str() } else { "(not configured, in-memory store)" }
        );
        tracing::info!(
            "  queue:     id={}, time_limit={}s, lock_ttl={}s, health_check={}s, memory_limit={}",
            self.queue.identifier,
            self.queue.time_limit_secs,
            self.queue.lock_ttl_secs,
            self.queue.health_check_interval_secs,
            self.queue.memory_limit.as_deref().unwrap_or("(unset)"),
        );
        tracing::info!(
            "  trigger:   secret={}, fault_policy={}",
            if self.queue.trigger_secret.is_some() { "set" } else { "(generated per process)" },
            self.queue.fault_policy,
        );
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "postgres": { "configured": self.postgres.is_configured() },
            "queue": {
                "identifier": self.queue.identifier,
                "time_limit_secs": self.queue.time_limit_secs,
                "lock_ttl_secs": self.queue.lock_ttl_secs,
                "health_check_interval_secs": self.queue.health_check_interval_secs,
                "memory_limit": self.queue.memory_limit,
                "fault_policy": self.queue.fault_policy.to_string(),
            },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL dispatch requests are sent to (usually this server itself).
    pub public_url: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let port = profiled_env_parse(p, "PORT", 8787u16);
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port,
            public_url: profiled_env_or(p, "PUBLIC_URL", &format!("http://127.0.0.1:{port}")),
        }
    }
}

// ── Postgres ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "PG_URL"),
            host: profiled_env_or(p, "PG_HOST", ""),
            port: profiled_env_parse(p, "PG_PORT", 5432u16),
            database: profiled_env_or(p, "PG_DATABASE", "sluice"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            max_connections: profiled_env_parse(p, "PG_MAX_CONNECTIONS", 5u32),
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}",
            user, pass, self.host, self.port, self.database
        )
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() || !self.host.is_empty()
    }
}

// ── Queue ─────────────────────────────────────────────────────

/// Upper bound for every configured duration (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted queue identifier.
pub const MAX_IDENTIFIER_LEN: usize = 32;

/// Queue identifiers are ASCII letters, digits and `-`.
///
/// Every store key of a queue is `{identifier}_{suffix}`. Without `_` in the
/// identifier, the first `_` of a key always ends the identifier, so no queue
/// can see another queue's batches or lock.
pub fn check_identifier(identifier: &str) -> Result<(), ConfigError> {
    if identifier.trim().is_empty() {
        return Err(ConfigError::Missing("QUEUE_IDENTIFIER".into()));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(ConfigError::Invalid(format!(
            "queue identifier '{identifier}' is longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if let Some(c) = identifier.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(ConfigError::Invalid(format!(
            "queue identifier '{identifier}' contains '{c}'; use ASCII letters, digits and '-'"
        )));
    }
    Ok(())
}

fn check_duration(name: &str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::Invalid(format!(
            "{name} ({secs}s) exceeds the maximum of {MAX_DURATION_SECS}s"
        )));
    }
    Ok(())
}

/// What happens to an item whose handler reported a non-fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Keep the item in place; it is offered to the handler again next loop.
    #[default]
    Retry,
    /// Drop the item from its batch.
    Skip,
}

impl FromStr for FaultPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            other => Err(ConfigError::Invalid(format!(
                "unknown fault policy '{other}', expected 'retry' or 'skip'"
            ))),
        }
    }
}

impl fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Namespace for batch keys, the lock record and the health-check hook.
    pub identifier: String,
    /// Wall-clock budget of a single pass.
    pub time_limit_secs: u64,
    /// Lifetime of the process lock; must exceed `time_limit_secs`.
    pub lock_ttl_secs: u64,
    pub health_check_interval_secs: u64,
    /// Shorthand memory ceiling such as `256M`; unset means 32000 MiB.
    pub memory_limit: Option<String>,
    pub dispatch_timeout_ms: u64,
    pub trigger_secret: Option<String>,
    pub fault_policy: FaultPolicy,
    /// Shell command the server runs for each item.
    pub handler_command: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            identifier: "sluice".into(),
            time_limit_secs: 20,
            lock_ttl_secs: 60,
            health_check_interval_secs: 300,
            memory_limit: None,
            dispatch_timeout_ms: 500,
            trigger_secret: None,
            fault_policy: FaultPolicy::Retry,
            handler_command: None,
        }
    }
}

impl QueueSettings {
    fn from_env_profiled(p: &str) -> Self {
        let defaults = Self::default();
        let fault_policy = match profiled_env_opt(p, "QUEUE_FAULT_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("{e}, falling back to '{}'", defaults.fault_policy);
                defaults.fault_policy
            }),
            None => defaults.fault_policy,
        };
        Self {
            identifier: profiled_env_or(p, "QUEUE_IDENTIFIER", &defaults.identifier),
            time_limit_secs: profiled_env_parse(p, "QUEUE_TIME_LIMIT_SECS", defaults.time_limit_secs),
            lock_ttl_secs: profiled_env_parse(p, "QUEUE_LOCK_TTL_SECS", defaults.lock_ttl_secs),
            health_check_interval_secs: profiled_env_parse(
                p,
                "QUEUE_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            memory_limit: profiled_env_opt(p, "QUEUE_MEMORY_LIMIT"),
            dispatch_timeout_ms: profiled_env_parse(p, "QUEUE_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout_ms),
            trigger_secret: profiled_env_opt(p, "QUEUE_TRIGGER_SECRET"),
            fault_policy,
            handler_command: profiled_env_opt(p, "QUEUE_HANDLER_COMMAND"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_identifier(&self.identifier)?;
        check_duration("QUEUE_TIME_LIMIT_SECS", self.time_limit_secs)?;
        check_duration("QUEUE_LOCK_TTL_SECS", self.lock_ttl_secs)?;
        check_duration("QUEUE_HEALTH_CHECK_INTERVAL_SECS", self.health_check_interval_secs)?;
        if self.lock_ttl_secs <= self.time_limit_secs {
            return Err(ConfigError::Invalid(format!(
                "lock ttl ({}s) must exceed the pass time limit ({}s)",
                self.lock_ttl_secs, self.time_limit_secs
            )));
        }
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health check interval must be at least one second".into(),
            ));
        }
        Ok(())
    }
}
