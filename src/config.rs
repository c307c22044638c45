use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{ExemptUserSet, StoreFailurePolicy, TopUpPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "config-yaml")]
    #[error("invalid yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditsConfig {
    /// Generation calls allowed to run at once. Must be at least 1.
    pub max_concurrent: usize,
    pub daily_credit_increment: u64,
    pub max_credits_per_user: u64,
    /// Accounts that never receive the daily top-up.
    pub exempt_users: Vec<String>,
    pub store_failure_policy: StoreFailurePolicy,
    /// Deadline for one generation once it holds a queue slot. `None` or `0`
    /// disables it.
    pub generation_timeout_secs: Option<u64>,
    pub store: StoreConfig,
    pub provider: ProviderConfig,
    pub server: ServerConfig,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        let top_up = TopUpPolicy::default();
        Self {
            max_concurrent: 2,
            daily_credit_increment: top_up.increment,
            max_credits_per_user: top_up.cap,
            exempt_users: Vec::new(),
            store_failure_policy: StoreFailurePolicy::default(),
            generation_timeout_secs: None,
            store: StoreConfig::default(),
            provider: ProviderConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-style images API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Environment variable holding the API key. Used when `api_key` is unset.
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
            return Some(key.to_string());
        }
        let env = self.api_key_env.as_deref()?.trim();
        if env.is_empty() {
            return None;
        }
        std::env::var(env)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Admin endpoints are disabled unless a token is configured.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            admin_token: None,
        }
    }
}

impl CreditsConfig {
    /// Reads a config file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        Self::parse(&raw, &ext)
    }

    pub fn parse(raw: &str, format: &str) -> Result<Self, ConfigError> {
        let config: Self = match format {
            "toml" => toml::from_str(raw)?,
            "json" => serde_json::from_str(raw)?,
            #[cfg(feature = "config-yaml")]
            "yaml" | "yml" => serde_yaml::from_str(raw)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".into(),
            ));
        }
        match &self.store {
            StoreConfig::Memory => {}
            StoreConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("store.path must not be empty".into()));
                }
            }
            StoreConfig::Redis { url, .. } => {
                if url.trim().is_empty() {
                    return Err(ConfigError::Invalid("store.url must not be empty".into()));
                }
            }
        }
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.listen must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn top_up_policy(&self) -> TopUpPolicy {
        TopUpPolicy {
            increment: self.daily_credit_increment,
            cap: self.max_credits_per_user,
        }
    }

    pub fn exemption(&self) -> ExemptUserSet {
        ExemptUserSet::new(self.exempt_users.iter().map(String::as_str))
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = CreditsConfig::parse("", "toml").expect("parse");
        assert_eq!(config, CreditsConfig::default());
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(
            config.top_up_policy(),
            TopUpPolicy {
                increment: 5,
                cap: 10
            }
        );
        assert_eq!(config.store_failure_policy, StoreFailurePolicy::FailOpen);
        assert_eq!(config.generation_timeout(), None);
    }

    #[test]
    fn parses_full_toml() {
        let raw = r#"
max_concurrent = 4
daily_credit_increment = 3
max_credits_per_user = 20
exempt_users = ["admin", " "]
store_failure_policy = "fail_closed"
generation_timeout_secs = 90

[store]
kind = "sqlite"
path = "credits.sqlite"

[provider]
base_url = "https://images.example.com/v1"
model = "gpt-image-1"
api_key_env = "IMAGES_API_KEY"

[server]
listen = "0.0.0.0:9000"
admin_token = "secret"
"#;
        let config = CreditsConfig::parse(raw, "toml").expect("parse");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.top_up_policy().cap, 20);
        assert_eq!(config.exemption().len(), 1);
        assert_eq!(config.store_failure_policy, StoreFailurePolicy::FailClosed);
        assert_eq!(config.generation_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("credits.sqlite")
            }
        );
        assert_eq!(config.provider.model.as_deref(), Some("gpt-image-1"));
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_empty_redis_url() {
        let raw = r#"
[store]
kind = "redis"
url = " "
"#;
        let err = CreditsConfig::parse(raw, "toml").expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_max_concurrent() {
        let err = CreditsConfig::parse("max_concurrent = 0", "toml").expect_err("invalid");
        match err {
            ConfigError::Invalid(message) => assert!(message.contains("max_concurrent")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_format() {
        let err = CreditsConfig::parse("{}", "ini").expect_err("format");
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn load_reads_json_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credits.json");
        std::fs::write(&path, r#"{"max_concurrent": 1, "exempt_users": ["ops"]}"#)
            .expect("write");

        let config = CreditsConfig::load(&path).expect("load");
        assert_eq!(config.max_concurrent, 1);
        assert!(config.exemption().len() == 1);
    }

    #[cfg(feature = "config-yaml")]
    #[test]
    fn parses_yaml() {
        let raw = "max_concurrent: 3\nstore:\n  kind: redis\n  url: redis://127.0.0.1/\n";
        let config = CreditsConfig::parse(raw, "yaml").expect("parse");
        assert_eq!(config.max_concurrent, 3);
        assert!(matches!(config.store, StoreConfig::Redis { .. }));
    }
}
