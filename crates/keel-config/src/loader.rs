use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::{KeelConfig, WarningSeverity};

/// Loads the Keel configuration and keeps a shared snapshot of it.
pub struct ConfigLoader {
    config: Arc<RwLock<KeelConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > KEEL_CONFIG env > <config dir>/keel/keel.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("KEEL_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
            .join("keel.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> keel_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            KeelConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Wrap an already-built config (no file backing).
    pub fn from_config(config: KeelConfig) -> keel_core::Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Parse a config file without env overrides or validation.
    pub fn read(path: &Path) -> keel_core::Result<KeelConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<KeelConfig>(&raw).map_err(|e| {
            keel_core::KeelError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> KeelConfig {
        self.config.read().clone()
    }

    pub fn shared(&self) -> Arc<RwLock<KeelConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply a change to the in-memory snapshot (CLI flag overrides).
    pub fn update(&self, f: impl FnOnce(&mut KeelConfig)) {
        f(&mut self.config.write());
    }

    /// Apply env var overrides (KEEL_PLUGINS_DIR, KEEL_HEADLESS, ...).
    pub fn apply_env_overrides(config: KeelConfig) -> KeelConfig {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(
        mut config: KeelConfig,
        var: impl Fn(&str) -> Option<String>,
    ) -> KeelConfig {
        if let Some(v) = var("KEEL_PLUGINS_DIR") {
            config.plugins.dir = PathBuf::from(v);
        }
        if let Some(v) = var("KEEL_HEADLESS") {
            config.runtime.headless =
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = var("KEEL_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = var("KEEL_CAPABILITY_POLICY") {
            match v.parse() {
                Ok(policy) => config.plugins.policy = policy,
                Err(e) => warn!(error = %e, "ignoring KEEL_CAPABILITY_POLICY"),
            }
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> keel_core::Result<()> {
        if !self.config_path.exists() {
            return Err(keel_core::KeelError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn check(config: &KeelConfig) -> keel_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    match w.severity {
                        WarningSeverity::Info => info!("{}", w),
                        _ => warn!("{}", w),
                    }
                }
                Ok(())
            }
            Err(e) => Err(keel_core::KeelError::Config(e)),
        }
    }
}
