//! Configuration loading and storage location resolution.
//!
//! Resolution order, highest priority first:
//! 1. Environment variables (`CARDCACHE_DB_PATH`, `CARDCACHE_ARTIFACT_ROOT`,
//!    `CARDCACHE_DISPLAY_ROOT`)
//! 2. TOML config file
//! 3. Platform default under the local data directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{CacheError, CacheResult};
use crate::store::database::{resolve_path, DEFAULT_BUSY_TIMEOUT};

pub const ENV_CONFIG: &str = "CARDCACHE_CONFIG";
pub const ENV_DB_PATH: &str = "CARDCACHE_DB_PATH";
pub const ENV_ARTIFACT_ROOT: &str = "CARDCACHE_ARTIFACT_ROOT";
pub const ENV_DISPLAY_ROOT: &str = "CARDCACHE_DISPLAY_ROOT";

/// Where the cache keeps its database, its durable artifacts and its
/// disposable display copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub db_path: PathBuf,
    /// Durable artifact tree. Must survive restarts.
    pub artifact_root: PathBuf,
    /// Session display projection. May be wiped at any time.
    pub display_root: PathBuf,
    /// Permit an artifact root inside the OS temp directory (tests only).
    pub allow_ephemeral_root: bool,
    pub busy_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut config = Self::under(default_data_dir());
        config.display_root = std::env::temp_dir().join("cardcache-display");
        config
    }
}

impl CacheConfig {
    /// Everything under one base directory.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            db_path: base.join("cache.db"),
            artifact_root: base.join("artifacts"),
            display_root: base.join("display"),
            allow_ephemeral_root: false,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }

    /// Load the config file (explicit path, then `CARDCACHE_CONFIG`, then
    /// the platform config dir if it exists), apply environment overrides
    /// and validate.
    pub fn load(path: Option<&Path>) -> CacheResult<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os(ENV_CONFIG)
                .map(PathBuf::from)
                .or_else(default_config_file),
        };
        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)?;
        debug!(path = %path.display(), "loaded cache config");
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_DB_PATH) {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_ARTIFACT_ROOT) {
            self.artifact_root = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_DISPLAY_ROOT) {
            self.display_root = PathBuf::from(v);
        }
    }

    /// Reject configurations that would lose cached artifacts.
    pub fn validate(&self) -> CacheResult<()> {
        for (name, path) in [
            ("db_path", &self.db_path),
            ("artifact_root", &self.artifact_root),
            ("display_root", &self.display_root),
        ] {
            if path.as_os_str().is_empty() {
                return Err(CacheError::Config(format!("{name} must not be empty")));
            }
        }
        if !self.allow_ephemeral_root && is_ephemeral(&resolve_path(&self.artifact_root)?) {
            return Err(CacheError::Config(format!(
                "artifact_root {} is inside the temp directory and would not survive a restart",
                self.artifact_root.display()
            )));
        }
        let artifacts = resolve_path(&self.artifact_root)?;
        let display = resolve_path(&self.display_root)?;
        if display.starts_with(&artifacts) || artifacts.starts_with(&display) {
            return Err(CacheError::Config(
                "display_root and artifact_root must not contain each other".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn is_ephemeral(path: &Path) -> bool {
    let tmp = std::env::temp_dir();
    if path.starts_with(&tmp) {
        return true;
    }
    tmp.canonicalize()
        .map(|canonical| path.starts_with(canonical))
        .unwrap_or(false)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("cardcache"))
        .unwrap_or_else(|| PathBuf::from("./cardcache_data"))
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("cardcache").join("config.toml"))
        .filter(|p| p.exists())
}
