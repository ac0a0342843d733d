//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ShipyardSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `SHIPYARD_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ShipyardSettings;

/// Resolve the default settings path (`~/.shipyard/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".shipyard").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ShipyardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ShipyardSettings> {
    let defaults = serde_json::to_value(ShipyardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ShipyardSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives in `source` replace
/// `target`; nulls in `source` are skipped.
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SHIPYARD_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (file/default value wins).
pub fn apply_env_overrides<F>(settings: &mut ShipyardSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = string("SHIPYARD_SANDBOX_URL") {
        settings.sandbox.base_url = v;
    }
    if let Some(v) = string("SHIPYARD_SANDBOX_API_KEY") {
        settings.sandbox.api_key = Some(v);
    }
    if let Some(v) = string("SHIPYARD_SANDBOX_TIMEOUT_MS") {
        match parse_u64_range(&v, 1_000, 600_000) {
            Some(ms) => settings.sandbox.request_timeout_ms = ms,
            None => tracing::warn!(key = "SHIPYARD_SANDBOX_TIMEOUT_MS", value = %v, "invalid value, ignoring"),
        }
    }
    if let Some(v) = string("SHIPYARD_TEMPLATE") {
        settings.template.name = v;
    }
    if let Some(v) = string("SHIPYARD_PROJECT_NAME") {
        settings.template.project_name = v;
    }
    if let Some(v) = string("SHIPYARD_REQUIRES_AI_PROXY") {
        match parse_bool(&v) {
            Some(b) => settings.template.requires_ai_proxy = b,
            None => tracing::warn!(key = "SHIPYARD_REQUIRES_AI_PROXY", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = string("SHIPYARD_AI_PROXY_URL") {
        settings.template.ai_proxy_url = Some(v);
    }
    if let Some(v) = string("SHIPYARD_PROXY_SECRET") {
        settings.template.proxy_secret = Some(v);
    }
    if let Some(v) = string("SHIPYARD_LOG_LEVEL") {
        settings.telemetry.level = v;
    }
    if let Some(v) = string("SHIPYARD_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.telemetry.json = b,
            None => tracing::warn!(key = "SHIPYARD_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = string("SHIPYARD_DB_PATH") {
        settings.store.db_path = Some(v);
    }
}

/// Reject settings the orchestrator cannot run with.
pub fn validate(settings: &ShipyardSettings) -> Result<()> {
    if settings.sandbox.base_url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("sandbox.baseUrl is empty".into()));
    }
    if settings.template.requires_ai_proxy {
        if settings.template.ai_proxy_url.is_none() {
            return Err(SettingsError::InvalidValue(
                "template.aiProxyUrl is required when requiresAiProxy is set".into(),
            ));
        }
        if settings.template.proxy_secret.is_none() {
            return Err(SettingsError::InvalidValue(
                "template.proxySecret is required when requiresAiProxy is set".into(),
            ));
        }
    }
    Ok(())
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("shipyard-settings-{}", uuid::Uuid::now_v7()))
            .join(name)
    }

    #[test]
    fn deep_merge_nested() {
        let target = serde_json::json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        let source = serde_json::json!({"a": {"c": 3}, "d": [9], "e": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"]["b"], 1);
        assert_eq!(merged["a"]["c"], 3);
        assert_eq!(merged["d"], serde_json::json!([9]));
        assert!(merged.get("e").is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings_from_path(&temp_path("absent.json")).unwrap();
        assert_eq!(settings.template.name, ShipyardSettings::default().template.name);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_path("settings.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"sandbox": {"baseUrl": "https://sandbox.example"}, "template": {"readOnlyPrefixes": ["worker/"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sandbox.base_url, "https://sandbox.example");
        assert_eq!(settings.sandbox.request_timeout_ms, 45_000);
        assert_eq!(settings.template.read_only_prefixes, vec!["worker/".to_string()]);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_path("broken.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::Json(_))));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn env_overrides_apply_and_ignore_invalid() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SHIPYARD_SANDBOX_URL", "https://override"),
            ("SHIPYARD_SANDBOX_TIMEOUT_MS", "5"),
            ("SHIPYARD_LOG_JSON", "yes"),
            ("SHIPYARD_REQUIRES_AI_PROXY", "maybe"),
            ("SHIPYARD_PROJECT_NAME", ""),
        ]);
        let mut settings = ShipyardSettings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.sandbox.base_url, "https://override");
        assert_eq!(settings.sandbox.request_timeout_ms, 45_000);
        assert!(settings.telemetry.json);
        assert!(!settings.template.requires_ai_proxy);
        assert_eq!(settings.template.project_name, "preview");
    }

    #[test]
    fn proxy_requirement_needs_url_and_secret() {
        let mut settings = ShipyardSettings::default();
        settings.template.requires_ai_proxy = true;
        assert!(matches!(validate(&settings), Err(SettingsError::InvalidValue(_))));

        settings.template.ai_proxy_url = Some("https://proxy".into());
        settings.template.proxy_secret = Some("s3cret".into());
        assert!(validate(&settings).is_ok());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("1000", 1000, 2000), Some(1000));
        assert_eq!(parse_u64_range("999", 1000, 2000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
    }
}
