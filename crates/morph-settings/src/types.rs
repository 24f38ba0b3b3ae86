//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every struct is `#[serde(default)]`, so a
//! partial file only overrides what it names.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MorphSettings {
    pub version: String,
    pub model: ModelAccessSettings,
    pub runtime: RuntimeSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl Default for MorphSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            model: ModelAccessSettings::default(),
            runtime: RuntimeSettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl MorphSettings {
    /// Reject combinations that cannot work (relay mode without a relay URL, ...).
    pub fn validate(&self) -> Result<()> {
        match self.model.mode {
            AccessMode::Relay if self.model.relay_url.as_deref().unwrap_or("").is_empty() => Err(
                SettingsError::InvalidValue("relay mode requires model.relayUrl".into()),
            ),
            AccessMode::Direct if self.model.api_key.as_deref().unwrap_or("").is_empty() => Err(
                SettingsError::InvalidValue("direct mode requires model.apiKey".into()),
            ),
            _ if self.model.max_tokens == 0 => Err(SettingsError::InvalidValue(
                "model.maxTokens must be positive".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// How the runtime reaches a model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Unconfigured,
    /// Straight to the provider with a client-held API key.
    Direct,
    /// Through a gateway holding server-side credentials.
    Relay,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelAccessSettings {
    pub mode: AccessMode,
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub direct_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ModelAccessSettings {
    fn default() -> Self {
        Self {
            mode: AccessMode::Unconfigured,
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
            api_key: None,
            direct_url: "https://api.anthropic.com/v1/messages".to_string(),
            relay_url: None,
            relay_token: None,
            timeout_ms: 120_000,
        }
    }
}

impl ModelAccessSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    /// Default turn budget for a reasoning run.
    pub max_turns: u32,
    pub immediate_delay_ms: u64,
    pub normal_delay_ms: u64,
    pub background_delay_ms: u64,
    /// Serialized dependency values longer than this are truncated in prompts.
    pub value_ceiling_bytes: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_turns: 5,
            immediate_delay_ms: 0,
            normal_delay_ms: 300,
            background_delay_ms: 1500,
            value_ceiling_bytes: 4000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: morph_home().join("morph.db").display().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `~/.morph`, falling back to `/tmp/.morph` without a home directory.
pub fn morph_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".morph")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = MorphSettings::default();
        assert_eq!(settings.model.mode, AccessMode::Unconfigured);
        assert_eq!(settings.model.max_tokens, 8192);
        assert_eq!(settings.runtime.max_turns, 5);
        assert_eq!(settings.runtime.normal_delay_ms, 300);
        assert!(settings.storage.db_path.ends_with("morph.db"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn camel_case_on_disk() {
        let json = serde_json::to_value(MorphSettings::default()).unwrap();
        assert!(json["model"].get("maxTokens").is_some());
        assert!(json["runtime"].get("valueCeilingBytes").is_some());
        assert!(json["model"].get("apiKey").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let parsed: MorphSettings =
            serde_json::from_str(r#"{"model": {"mode": "relay", "relayUrl": "http://gw/api"}}"#)
                .unwrap();
        assert_eq!(parsed.model.mode, AccessMode::Relay);
        assert_eq!(parsed.model.max_tokens, 8192);
        assert_eq!(parsed.runtime.max_turns, 5);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn relay_without_url_is_invalid() {
        let mut settings = MorphSettings::default();
        settings.model.mode = AccessMode::Relay;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn direct_without_key_is_invalid() {
        let mut settings = MorphSettings::default();
        settings.model.mode = AccessMode::Direct;
        assert!(settings.validate().is_err());
        settings.model.api_key = Some("sk-test".into());
        assert!(settings.validate().is_ok());
    }
}
