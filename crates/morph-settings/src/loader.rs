//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{morph_home, AccessMode, MorphSettings};

pub fn settings_path() -> PathBuf {
    morph_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<MorphSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<MorphSettings> {
    let defaults = serde_json::to_value(MorphSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: MorphSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `MORPH_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (file/default value stays).
pub fn apply_overrides(settings: &mut MorphSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("MORPH_MODE") {
        match parse_mode(&v) {
            Some(mode) => settings.model.mode = mode,
            None => warn!(key = "MORPH_MODE", value = %v, "invalid access mode, ignoring"),
        }
    }
    if let Some(v) = read("MORPH_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("MORPH_MAX_TOKENS") {
        match parse_u32_range(&v, 1, 200_000) {
            Some(n) => settings.model.max_tokens = n,
            None => warn!(key = "MORPH_MAX_TOKENS", value = %v, "invalid u32 env var, ignoring"),
        }
    }
    if let Some(v) = read("MORPH_API_KEY").or_else(|| read("ANTHROPIC_API_KEY")) {
        settings.model.api_key = Some(v);
    }
    if let Some(v) = read("MORPH_DIRECT_URL") {
        settings.model.direct_url = v;
    }
    if let Some(v) = read("MORPH_RELAY_URL") {
        settings.model.relay_url = Some(v);
    }
    if let Some(v) = read("MORPH_RELAY_TOKEN") {
        settings.model.relay_token = Some(v);
    }
    if let Some(v) = read("MORPH_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = read("MORPH_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("MORPH_MAX_TURNS") {
        match parse_u32_range(&v, 1, 50) {
            Some(n) => settings.runtime.max_turns = n,
            None => warn!(key = "MORPH_MAX_TURNS", value = %v, "invalid u32 env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

pub fn parse_mode(val: &str) -> Option<AccessMode> {
    match val.to_lowercase().as_str() {
        "unconfigured" | "none" | "off" => Some(AccessMode::Unconfigured),
        "direct" => Some(AccessMode::Direct),
        "relay" | "gateway" => Some(AccessMode::Relay),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
