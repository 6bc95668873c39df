//! Store configuration.
//!
//! Everything the storage core treats as policy rather than behavior lives
//! here: snapshot retention and cadence, cursor page size, and how projections
//! react to new events. Values come from builder methods or from the
//! environment (`StoreConfig::from_env`).

use std::num::{NonZeroU64, NonZeroUsize};

use thiserror::Error;

pub const ENV_SNAPSHOT_RETAIN: &str = "EVENTVAULT_SNAPSHOT_RETAIN";
pub const ENV_SNAPSHOT_EVERY: &str = "EVENTVAULT_SNAPSHOT_EVERY";
pub const ENV_PAGE_SIZE: &str = "EVENTVAULT_PAGE_SIZE";
pub const ENV_INCREMENTAL_PROJECTIONS: &str = "EVENTVAULT_INCREMENTAL_PROJECTIONS";
pub const ENV_REBUILD_ON_GAP: &str = "EVENTVAULT_REBUILD_ON_GAP";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

const DEFAULT_SNAPSHOT_RETAIN: usize = 3;
const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Snapshot retention and cadence.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    retain: NonZeroUsize,
    every: Option<NonZeroU64>,
}

impl SnapshotPolicy {
    /// Keep the `retain` most recent snapshots per aggregate.
    ///
    /// `0` is rejected: the newest snapshot must always survive a prune.
    pub fn new(retain: usize) -> Result<Self, ConfigError> {
        let retain = NonZeroUsize::new(retain).ok_or_else(|| {
            ConfigError::invalid(ENV_SNAPSHOT_RETAIN, "at least one snapshot must be retained")
        })?;
        Ok(Self {
            retain,
            every: None,
        })
    }

    /// Take a snapshot automatically once `every` events were appended since
    /// the latest one.
    pub fn with_interval(mut self, every: u64) -> Result<Self, ConfigError> {
        let every = NonZeroU64::new(every)
            .ok_or_else(|| ConfigError::invalid(ENV_SNAPSHOT_EVERY, "interval must be positive"))?;
        self.every = Some(every);
        Ok(self)
    }

    pub fn retain(&self) -> usize {
        self.retain.get()
    }

    pub fn every(&self) -> Option<u64> {
        self.every.map(NonZeroU64::get)
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            retain: NonZeroUsize::new(DEFAULT_SNAPSHOT_RETAIN).unwrap_or(NonZeroUsize::MIN),
            every: None,
        }
    }
}

/// How the projection engine reacts to new events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionConfig {
    /// Apply events one by one onto published state. When off, every new
    /// event marks affected projections stale instead.
    pub incremental_updates: bool,
    /// Rebuild immediately when an incremental update detects a version gap
    /// (otherwise the projection is only marked stale).
    pub rebuild_on_gap: bool,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            incremental_updates: true,
            rebuild_on_gap: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub snapshots: SnapshotPolicy,
    pub projections: ProjectionConfig,
    page_size: NonZeroUsize,
    pub database_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshots: SnapshotPolicy::default(),
            projections: ProjectionConfig::default(),
            page_size: NonZeroUsize::new(DEFAULT_PAGE_SIZE).unwrap_or(NonZeroUsize::MIN),
            database_url: None,
        }
    }
}

impl StoreConfig {
    pub fn with_snapshots(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = policy;
        self
    }

    pub fn with_projections(mut self, projections: ProjectionConfig) -> Self {
        self.projections = projections;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Result<Self, ConfigError> {
        self.page_size = NonZeroUsize::new(page_size)
            .ok_or_else(|| ConfigError::invalid(ENV_PAGE_SIZE, "page size must be positive"))?;
        Ok(self)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Number of events fetched per cursor page.
    pub fn page_size(&self) -> usize {
        self.page_size.get()
    }

    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (env, file, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = StoreConfig::default();

        if let Some(raw) = lookup(ENV_SNAPSHOT_RETAIN) {
            let retain = parse_number::<usize>(ENV_SNAPSHOT_RETAIN, &raw)?;
            config.snapshots = SnapshotPolicy::new(retain)?;
        }
        if let Some(raw) = lookup(ENV_SNAPSHOT_EVERY) {
            let every = parse_number::<u64>(ENV_SNAPSHOT_EVERY, &raw)?;
            config.snapshots = config.snapshots.with_interval(every)?;
        }
        if let Some(raw) = lookup(ENV_PAGE_SIZE) {
            let page_size = parse_number::<usize>(ENV_PAGE_SIZE, &raw)?;
            config = config.with_page_size(page_size)?;
        }
        if let Some(raw) = lookup(ENV_INCREMENTAL_PROJECTIONS) {
            config.projections.incremental_updates = parse_flag(ENV_INCREMENTAL_PROJECTIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_REBUILD_ON_GAP) {
            config.projections.rebuild_on_gap = parse_flag(ENV_REBUILD_ON_GAP, &raw)?;
        }
        config.database_url = lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty());

        Ok(config)
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("'{other}' is not a boolean"))),
    }
}
