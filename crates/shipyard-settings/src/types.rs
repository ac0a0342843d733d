use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root settings document (`~/.shipyard/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShipyardSettings {
    pub sandbox: SandboxSettings,
    pub template: TemplateSettings,
    pub telemetry: TelemetrySettings,
    pub store: StoreSettings,
}

/// Sandbox control-plane connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            request_timeout_ms: 45_000,
        }
    }
}

/// What gets provisioned and which paths are off-limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateSettings {
    pub name: String,
    pub project_name: String,
    pub init_command: Option<String>,
    pub read_only_prefixes: Vec<String>,
    pub requires_ai_proxy: bool,
    pub ai_proxy_url: Option<String>,
    pub proxy_secret: Option<String>,
    pub proxy_token_ttl_secs: u64,
    pub env_vars: HashMap<String, String>,
    /// Commands run once after the first successful deployment (e.g. `bun install`).
    pub setup_commands: Vec<String>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            name: "vite-react".to_string(),
            project_name: "preview".to_string(),
            init_command: None,
            read_only_prefixes: vec!["api-worker/".to_string()],
            requires_ai_proxy: false,
            ai_proxy_url: None,
            proxy_secret: None,
            proxy_token_ttl_secs: 24 * 60 * 60,
            env_vars: HashMap::new(),
            setup_commands: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub level: String,
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `None` disables persistence.
    pub db_path: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            db_path: Some(format!("{home}/.shipyard/database/shipyard.db")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = ShipyardSettings::default();
        assert_eq!(s.sandbox.request_timeout_ms, 45_000);
        assert_eq!(s.template.read_only_prefixes, vec!["api-worker/".to_string()]);
        assert!(!s.template.requires_ai_proxy);
        assert_eq!(s.telemetry.level, "info");
        assert!(s.store.db_path.as_deref().unwrap().ends_with("shipyard.db"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ShipyardSettings =
            serde_json::from_str(r#"{"template":{"name":"next-app"}}"#).unwrap();
        assert_eq!(s.template.name, "next-app");
        assert_eq!(s.template.project_name, "preview");
        assert_eq!(s.sandbox, SandboxSettings::default());
    }
}
