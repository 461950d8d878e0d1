use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::SlbConfig;

/// Loads and reloads the SLB configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<SlbConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > SLB_CONFIG env > ~/.slb/slb.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("SLB_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".slb")
            .join("slb.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> slb_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            SlbConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: SlbConfig) -> slb_core::Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> SlbConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<SlbConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept if the new
    /// file fails to parse or validate.
    pub fn reload(&self) -> slb_core::Result<()> {
        if !self.config_path.exists() {
            return Err(slb_core::SlbError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn read_file(path: &Path) -> slb_core::Result<SlbConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<SlbConfig>(&raw).map_err(|e| {
            slb_core::SlbError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate config. Logs warnings, fails on errors.
    fn check(config: &SlbConfig) -> slb_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(slb_core::SlbError::Config(e)),
        }
    }

    /// Apply env var overrides (SLB_DB_PATH, SLB_LOG_LEVEL, etc.)
    fn apply_env_overrides(mut config: SlbConfig) -> SlbConfig {
        if let Ok(v) = std::env::var("SLB_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SLB_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("SLB_REQUEST_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => config.general.request_timeout_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric SLB_REQUEST_TIMEOUT_SECS"),
            }
        }
        if let Ok(v) = std::env::var("SLB_MAX_REQUESTS_PER_MINUTE") {
            match v.parse::<usize>() {
                Ok(n) => config.general.max_requests_per_minute = n,
                Err(_) => warn!(value = %v, "ignoring non-numeric SLB_MAX_REQUESTS_PER_MINUTE"),
            }
        }
        if let Ok(v) = std::env::var("SLB_STALE_THRESHOLD_SECS") {
            match v.parse::<u64>() {
                Ok(secs) => config.sessions.stale_threshold_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric SLB_STALE_THRESHOLD_SECS"),
            }
        }
        config
    }
}
