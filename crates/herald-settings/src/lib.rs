//! # herald-settings
//!
//! Layered relay configuration. Priority, lowest first:
//! 1. **Compiled defaults** ([`HeraldSettings::default()`])
//! 2. **Settings file** (`~/.herald/settings.json`, deep-merged over defaults)
//! 3. **Environment variables** (`HERALD_*`)
//!
//! The binary applies command-line flags last and validates the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_with, deep_merge, load_settings_from_path, settings_path,
};
pub use types::{DeliverySettings, HeraldSettings, LoggingSettings, QueueSettings, ServerSettings};
