//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::Settings;

/// `~/.parley`, falling back to `/tmp/.parley` when `HOME` is unset.
pub fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `lookup`.
///
/// Unparseable or out-of-range values are ignored with a warning and the
/// file/default value is kept.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16_in("PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize_in("PARLEY_MAX_TURNS_IN_FLIGHT", 1, 1024) {
        settings.server.max_turns_in_flight = v;
    }
    if let Some(v) = env.string("PARLEY_DB_PATH") {
        settings.database.path = PathBuf::from(v);
    }
    if let Some(v) = env.string("PARLEY_BACKEND_URL") {
        settings.backend.url = v;
    }
    if let Some(v) = env.string("PARLEY_BACKEND_API_KEY") {
        settings.backend.api_key = Some(v);
    }
    if let Some(v) = env.string("PARLEY_MODEL") {
        settings.backend.model = v;
    }
    if let Some(v) = env.u64_in("PARLEY_BACKEND_TIMEOUT_SECS", 1, 3600) {
        settings.backend.timeout_secs = v;
    }
    if let Some(v) = env.string("PARLEY_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PARLEY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16_in(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.ranged(name, min, max)
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.ranged(name, min, max)
    }

    fn usize_in(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.ranged(name, min, max)
    }

    fn ranged<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = (self.lookup)(name)?;
        let result = parse_in_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
