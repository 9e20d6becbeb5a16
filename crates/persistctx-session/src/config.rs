//! Persistence unit configuration.

use crate::PersistenceContext;
use persistctx_core::{ConfigError, Error, Result, StorageBackend};
use std::str::FromStr;

/// Environment variable selecting the flush mode (`auto` or `commit`).
pub const ENV_FLUSH_MODE: &str = "PERSISTCTX_FLUSH_MODE";
/// Environment variable toggling lazy transaction begin.
pub const ENV_AUTO_BEGIN: &str = "PERSISTCTX_AUTO_BEGIN";
/// Environment variable toggling identity map clearing on commit.
pub const ENV_CLEAR_ON_COMMIT: &str = "PERSISTCTX_CLEAR_ON_COMMIT";

/// When pending writes are sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush before any read that pending writes could affect, and on commit.
    #[default]
    Auto,
    /// Flush only on explicit `flush()` and on commit.
    Commit,
}

impl FlushMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushMode::Auto => "auto",
            FlushMode::Commit => "commit",
        }
    }
}

impl FromStr for FlushMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FlushMode::Auto),
            "commit" => Ok(FlushMode::Commit),
            other => Err(ConfigError {
                message: format!("unknown flush mode '{other}' (expected auto or commit)"),
            }
            .into()),
        }
    }
}

/// Configuration for persistence context behavior.
#[derive(Debug, Clone)]
pub struct PersistenceUnitConfig {
    /// When queued writes are flushed.
    pub flush_mode: FlushMode,
    /// Whether to begin a backend transaction on the first read or flush.
    pub auto_begin: bool,
    /// Whether commit ends the unit of work by detaching every managed entity.
    pub clear_on_commit: bool,
}

impl Default for PersistenceUnitConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            auto_begin: true,
            clear_on_commit: true,
        }
    }
}

impl PersistenceUnitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flush mode.
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Enable or disable lazy transaction begin.
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    /// Enable or disable clearing the identity map on commit.
    pub fn clear_on_commit(mut self, value: bool) -> Self {
        self.clear_on_commit = value;
        self
    }

    /// Defaults overridden by the `PERSISTCTX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(mode) = lookup(ENV_FLUSH_MODE) {
            config.flush_mode = mode.parse()?;
        }
        if let Some(value) = lookup(ENV_AUTO_BEGIN) {
            config.auto_begin = parse_flag(ENV_AUTO_BEGIN, &value)?;
        }
        if let Some(value) = lookup(ENV_CLEAR_ON_COMMIT) {
            config.clear_on_commit = parse_flag(ENV_CLEAR_ON_COMMIT, &value)?;
        }
        tracing::debug!(
            flush_mode = config.flush_mode.as_str(),
            auto_begin = config.auto_begin,
            clear_on_commit = config.clear_on_commit,
            "Loaded persistence unit configuration"
        );
        Ok(config)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError {
            message: format!("{name}: expected a boolean, found '{other}'"),
        }
        .into()),
    }
}

/// Long-lived factory for persistence contexts.
///
/// Created once per application and shared by reference; every context it
/// creates runs with the same configuration.
#[derive(Debug, Clone, Default)]
pub struct PersistenceUnit {
    config: PersistenceUnitConfig,
}

impl PersistenceUnit {
    pub fn new(config: PersistenceUnitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PersistenceUnitConfig {
        &self.config
    }

    /// Open a new unit of work over `backend`.
    pub fn context<B: StorageBackend>(&self, backend: B) -> PersistenceContext<B> {
        PersistenceContext::with_config(backend, self.config.clone())
    }
}
