//! Console configuration.
//!
//! # Purpose
//! Environment variables (`DBCONSOLE_*`) supply every value, with defaults;
//! a YAML file named by `DBCONSOLE_CONFIG` may override individual fields.
//! Durations are millisecond integers throughout.
use crate::auth::{CookieKey, CookiePolicy, SessionPolicy};
use crate::backend::postgres::PostgresSettings;
use crate::txn::TransactionPolicy;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SESSION_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_SESSION_ABSOLUTE_TIMEOUT_MS: u64 = 12 * 60 * 60 * 1000;
pub const DEFAULT_IDENTITY_ABSOLUTE_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_TRANSACTION_LEASE_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_TRANSACTION_GRACE_MS: u64 = 60 * 1000;
pub const DEFAULT_TRANSACTION_MAX_OPS: usize = 10_000;
pub const DEFAULT_PAGINATION_HARD_CAP: u64 = 1000;
pub const DEFAULT_POOL_PER_ROLE_MAX: usize = 4;
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub default_database: String,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub backend: BackendKind,
    pub postgres: PostgresConfig,
    /// YAML seed for the memory backend.
    pub memory_fixture: Option<PathBuf>,
    pub session_idle_timeout_ms: u64,
    pub session_absolute_timeout_ms: u64,
    pub identity_absolute_timeout_ms: u64,
    pub transaction_lease_ms: u64,
    pub transaction_grace_ms: u64,
    pub transaction_max_ops: usize,
    pub pagination_hard_cap: u64,
    pub pool_per_role_max: usize,
    /// `None` means a random key is generated at startup.
    pub cookie_key: Option<CookieKey>,
    pub cookie_secure: bool,
    pub reaper_interval_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: BackendKind::Memory,
            postgres: PostgresConfig {
                host: "127.0.0.1".to_string(),
                port: 5432,
                default_database: "postgres".to_string(),
                acquire_timeout_ms: 5_000,
                idle_timeout_ms: 10 * 60 * 1000,
            },
            memory_fixture: None,
            session_idle_timeout_ms: DEFAULT_SESSION_IDLE_TIMEOUT_MS,
            session_absolute_timeout_ms: DEFAULT_SESSION_ABSOLUTE_TIMEOUT_MS,
            identity_absolute_timeout_ms: DEFAULT_IDENTITY_ABSOLUTE_TIMEOUT_MS,
            transaction_lease_ms: DEFAULT_TRANSACTION_LEASE_MS,
            transaction_grace_ms: DEFAULT_TRANSACTION_GRACE_MS,
            transaction_max_ops: DEFAULT_TRANSACTION_MAX_OPS,
            pagination_hard_cap: DEFAULT_PAGINATION_HARD_CAP,
            pool_per_role_max: DEFAULT_POOL_PER_ROLE_MAX,
            cookie_key: None,
            cookie_secure: true,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PostgresOverride {
    host: Option<String>,
    port: Option<u16>,
    default_database: Option<String>,
    acquire_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsoleConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    backend: Option<BackendKind>,
    postgres: Option<PostgresOverride>,
    memory_fixture: Option<PathBuf>,
    session_idle_timeout_ms: Option<u64>,
    session_absolute_timeout_ms: Option<u64>,
    identity_absolute_timeout_ms: Option<u64>,
    transaction_lease_ms: Option<u64>,
    transaction_grace_ms: Option<u64>,
    transaction_max_ops: Option<usize>,
    pagination_hard_cap: Option<u64>,
    pool_per_role_max: Option<usize>,
    cookie_key: Option<String>,
    cookie_secure: Option<bool>,
    reaper_interval_ms: Option<u64>,
}

impl ConsoleConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: env_or("DBCONSOLE_BIND", defaults.bind_addr)?,
            metrics_bind: env_or("DBCONSOLE_METRICS_BIND", defaults.metrics_bind)?,
            backend: env_or("DBCONSOLE_BACKEND", defaults.backend)?,
            postgres: PostgresConfig {
                host: std::env::var("DBCONSOLE_PG_HOST").unwrap_or(defaults.postgres.host),
                port: env_or("DBCONSOLE_PG_PORT", defaults.postgres.port)?,
                default_database: std::env::var("DBCONSOLE_PG_DATABASE")
                    .unwrap_or(defaults.postgres.default_database),
                acquire_timeout_ms: env_or(
                    "DBCONSOLE_PG_ACQUIRE_TIMEOUT_MS",
                    defaults.postgres.acquire_timeout_ms,
                )?,
                idle_timeout_ms: env_or(
                    "DBCONSOLE_PG_IDLE_TIMEOUT_MS",
                    defaults.postgres.idle_timeout_ms,
                )?,
            },
            memory_fixture: std::env::var("DBCONSOLE_MEMORY_FIXTURE").ok().map(PathBuf::from),
            session_idle_timeout_ms: env_or(
                "DBCONSOLE_SESSION_IDLE_TIMEOUT_MS",
                defaults.session_idle_timeout_ms,
            )?,
            session_absolute_timeout_ms: env_or(
                "DBCONSOLE_SESSION_ABSOLUTE_TIMEOUT_MS",
                defaults.session_absolute_timeout_ms,
            )?,
            identity_absolute_timeout_ms: env_or(
                "DBCONSOLE_IDENTITY_ABSOLUTE_TIMEOUT_MS",
                defaults.identity_absolute_timeout_ms,
            )?,
            transaction_lease_ms: env_or(
                "DBCONSOLE_TRANSACTION_LEASE_MS",
                defaults.transaction_lease_ms,
            )?,
            transaction_grace_ms: env_or(
                "DBCONSOLE_TRANSACTION_GRACE_MS",
                defaults.transaction_grace_ms,
            )?,
            transaction_max_ops: env_or(
                "DBCONSOLE_TRANSACTION_MAX_OPS",
                defaults.transaction_max_ops,
            )?,
            pagination_hard_cap: env_or(
                "DBCONSOLE_PAGINATION_HARD_CAP",
                defaults.pagination_hard_cap,
            )?,
            pool_per_role_max: env_or("DBCONSOLE_POOL_PER_ROLE_MAX", defaults.pool_per_role_max)?,
            cookie_key: std::env::var("DBCONSOLE_COOKIE_KEY")
                .ok()
                .map(|hex| parse_cookie_key(&hex).context("parse DBCONSOLE_COOKIE_KEY"))
                .transpose()?,
            cookie_secure: env_or("DBCONSOLE_COOKIE_SECURE", defaults.cookie_secure)?,
            reaper_interval_ms: env_or("DBCONSOLE_REAPER_INTERVAL_MS", defaults.reaper_interval_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("DBCONSOLE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read DBCONSOLE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Overlay the fields present in a YAML document.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let overrides: ConsoleConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse console config yaml")?;
        if let Some(value) = overrides.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = overrides.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = overrides.backend {
            self.backend = value;
        }
        if let Some(pg) = overrides.postgres {
            if let Some(value) = pg.host {
                self.postgres.host = value;
            }
            if let Some(value) = pg.port {
                self.postgres.port = value;
            }
            if let Some(value) = pg.default_database {
                self.postgres.default_database = value;
            }
            if let Some(value) = pg.acquire_timeout_ms {
                self.postgres.acquire_timeout_ms = value;
            }
            if let Some(value) = pg.idle_timeout_ms {
                self.postgres.idle_timeout_ms = value;
            }
        }
        if let Some(value) = overrides.memory_fixture {
            self.memory_fixture = Some(value);
        }
        if let Some(value) = overrides.session_idle_timeout_ms {
            self.session_idle_timeout_ms = value;
        }
        if let Some(value) = overrides.session_absolute_timeout_ms {
            self.session_absolute_timeout_ms = value;
        }
        if let Some(value) = overrides.identity_absolute_timeout_ms {
            self.identity_absolute_timeout_ms = value;
        }
        if let Some(value) = overrides.transaction_lease_ms {
            self.transaction_lease_ms = value;
        }
        if let Some(value) = overrides.transaction_grace_ms {
            self.transaction_grace_ms = value;
        }
        if let Some(value) = overrides.transaction_max_ops {
            self.transaction_max_ops = value;
        }
        if let Some(value) = overrides.pagination_hard_cap {
            self.pagination_hard_cap = value;
        }
        if let Some(value) = overrides.pool_per_role_max {
            self.pool_per_role_max = value;
        }
        if let Some(value) = overrides.cookie_key {
            self.cookie_key = Some(parse_cookie_key(&value).context("parse cookie_key")?);
        }
        if let Some(value) = overrides.cookie_secure {
            self.cookie_secure = value;
        }
        if let Some(value) = overrides.reaper_interval_ms {
            self.reaper_interval_ms = value;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.pagination_hard_cap == 0 {
            bail!("pagination_hard_cap must be at least 1");
        }
        if self.pool_per_role_max == 0 {
            bail!("pool_per_role_max must be at least 1");
        }
        if self.transaction_lease_ms == 0 {
            bail!("transaction_lease_ms must be positive");
        }
        if self.transaction_max_ops == 0 {
            bail!("transaction_max_ops must be at least 1");
        }
        if self.session_idle_timeout_ms == 0 || self.session_absolute_timeout_ms == 0 {
            bail!("session timeouts must be positive");
        }
        if self.identity_absolute_timeout_ms < self.session_absolute_timeout_ms {
            bail!("identity_absolute_timeout_ms must not be shorter than the session absolute timeout");
        }
        if self.reaper_interval_ms == 0 {
            bail!("reaper_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            idle_timeout: Duration::from_millis(self.session_idle_timeout_ms),
            absolute_timeout: Duration::from_millis(self.session_absolute_timeout_ms),
            identity_timeout: Duration::from_millis(self.identity_absolute_timeout_ms),
        }
    }

    pub fn cookie_policy(&self) -> CookiePolicy {
        CookiePolicy {
            secure: self.cookie_secure,
            session_max_age: Duration::from_millis(self.session_absolute_timeout_ms),
            identity_max_age: Duration::from_millis(self.identity_absolute_timeout_ms),
        }
    }

    pub fn transaction_policy(&self) -> TransactionPolicy {
        TransactionPolicy {
            lease: Duration::from_millis(self.transaction_lease_ms),
            grace: Duration::from_millis(self.transaction_grace_ms),
            max_ops: self.transaction_max_ops,
        }
    }

    pub fn postgres_settings(&self) -> PostgresSettings {
        PostgresSettings {
            host: self.postgres.host.clone(),
            port: self.postgres.port,
            default_database: self.postgres.default_database.clone(),
            acquire_timeout: Duration::from_millis(self.postgres.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(self.postgres.idle_timeout_ms),
            per_role_max: u32::try_from(self.pool_per_role_max).unwrap_or(u32::MAX),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("parse {key}: {err}")),
        Err(_) => Ok(default),
    }
}

fn parse_cookie_key(hex: &str) -> Result<CookieKey> {
    CookieKey::from_hex(hex.trim()).map_err(|err| anyhow::anyhow!(err))
}
