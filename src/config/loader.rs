//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/wiretap/config.toml`
//! 2. User config: `~/.config/wiretap/config.toml`
//! 3. Additional config file (via `--config` flag)
//!
//! Policy entries are **merged** (appended).
//! Scalars (log_level, capture settings) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/wiretap/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "wiretap";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    system_path: PathBuf,
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Path of the system-wide file.
    pub fn system_path(&self) -> &Path {
        &self.system_path
    }

    /// Path of the per-user file.
    pub fn user_path(&self) -> &Path {
        &self.user_path
    }

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `explicit` file
    /// is an error, and invalid TOML always is.
    pub fn load(&self, explicit: Option<&Path>) -> ConfigResult<Config> {
        let mut config = Config::default();

        for (label, path) in [("system", &self.system_path), ("user", &self.user_path)] {
            match Self::load_file(path)? {
                Some(layer) => {
                    config.merge(layer);
                    debug!("Loaded {} config from {:?}", label, path);
                }
                None => debug!("No {} config found at {:?}", label, path),
            }
        }

        if let Some(path) = explicit {
            match Self::load_file(path)? {
                Some(layer) => {
                    config.merge(layer);
                    debug!("Loaded additional config from {:?}", path);
                }
                None => {
                    // Unlike system/user config, a missing explicit config is an error
                    return Err(ConfigError::ReadError {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.validate()?;
        debug!(
            "Configuration has {} policy entries",
            config.policy.entries.len()
        );
        Ok(config)
    }

    /// Load a single file without merging or validation.
    pub fn load_file(path: &Path) -> ConfigResult<Option<Config>> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
