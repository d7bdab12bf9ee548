use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::openai::GatewayConfig;
use crate::platform::Session;

const CONFIG_FILE: &str = "whatsmind.toml";
const DEFAULT_GATEWAY_URL: &str = "https://ai.gateway.lovable.dev/v1/chat/completions";
const DEFAULT_GATEWAY_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_HEARTBEAT_SECS: u64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendSection,
    pub session: Option<SessionSection>,
    pub gateway: GatewaySection,
    pub realtime: RealtimeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BackendSection {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySection {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_GATEWAY_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeSection {
    pub heartbeat_secs: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl AppConfig {
    pub fn path() -> Option<PathBuf> {
        let proj = ProjectDirs::from("app", "whatsmind", "WhatsMind")?;
        Some(proj.config_dir().join(CONFIG_FILE))
    }

    /// Reads the config file (defaults when absent) and applies environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "loaded config");
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| Error::Config("No config dir".to_string()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("WHATSMIND_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(key) = lookup("WHATSMIND_ANON_KEY") {
            self.backend.anon_key = key;
        }
        if let Some(key) = lookup("WHATSMIND_GATEWAY_KEY") {
            self.gateway.api_key = key;
        }
        if let (Some(user_id), Some(access_token)) =
            (lookup("WHATSMIND_USER_ID"), lookup("WHATSMIND_ACCESS_TOKEN"))
        {
            self.session = Some(SessionSection {
                user_id,
                access_token,
            });
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(Error::Config("backend.url is not set".to_string()));
        }
        if self.backend.anon_key.trim().is_empty() {
            return Err(Error::Config("backend.anon_key is not set".to_string()));
        }
        Ok(())
    }

    pub fn session(&self) -> Option<Session> {
        self.session.as_ref().map(|s| Session {
            user_id: s.user_id.clone(),
            access_token: s.access_token.clone(),
        })
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            api_key: self.gateway.api_key.clone(),
            url: self.gateway.url.clone(),
            model: self.gateway.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = AppConfig::parse(
            r#"
            [backend]
            url = "https://demo.supabase.co"
            anon_key = "anon"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.url, "https://demo.supabase.co");
        assert_eq!(config.realtime.heartbeat_secs, 25);
        assert_eq!(config.gateway.model, DEFAULT_GATEWAY_MODEL);
        assert!(config.session.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::parse("[backend\nurl=").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WHATSMIND_BACKEND_URL", "https://env.supabase.co"),
            ("WHATSMIND_USER_ID", "u1"),
            ("WHATSMIND_ACCESS_TOKEN", "tok"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.backend.url, "https://env.supabase.co");
        assert_eq!(config.session().unwrap().user_id, "u1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("whatsmind-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        let mut config = AppConfig::default();
        config.backend.url = "https://x.supabase.co".into();
        config.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_save_reports_unusable_config_dir() {
        let blocker = std::env::temp_dir().join(format!("whatsmind-file-{}", uuid::Uuid::new_v4()));
        fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("nested").join(CONFIG_FILE);

        let err = AppConfig::default().save_to(&path).unwrap_err();
        match err {
            Error::Config(message) => assert!(message.starts_with("cannot create")),
            other => panic!("unexpected error: {:?}", other),
        }
        let _ = fs::remove_file(blocker);
    }
}
