//! # parley-settings
//!
//! Layered configuration for the relay server:
//! 1. **Compiled defaults** from [`Settings::default()`]
//! 2. **Settings file** at `~/.parley/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables** `PARLEY_*` (highest priority)
//!
//! The loaded [`Settings`] value is passed explicitly to whatever needs it;
//! there is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, parley_home, settings_path};
pub use types::*;
