//! Configuration for wiretap.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/wiretap/config.toml`
//! 2. User config: `~/.config/wiretap/config.toml`
//! 3. Additional config file (via `--config` flag)
//!
//! No file is required; an empty configuration leaves every default in
//! place and an empty policy table (everything open).
//!
//! # Merge Behavior
//!
//! - **Policy entries** are **merged** (appended); a later entry for the
//!   same key replaces an earlier one when applied
//! - **Scalars** (log_level, capture settings) are **overridden**

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH, USER_CONFIG_DIR, USER_CONFIG_FILE};
pub use schema::{CaptureConfig, Config, GeneralConfig, PolicyConfig, PolicyEntryConfig};
