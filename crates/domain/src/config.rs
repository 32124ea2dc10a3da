//! Runtime configuration, loaded from a TOML file with environment
//! overrides for deployment-sensitive values.

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub approvals: ApprovalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8765".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// HS256 secret for JWT validation on the chat socket.
    /// Overridable via `CQ_JWT_SECRET`.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Default LM backend URL. Users may override per account.
    pub base_url: String,
    /// Model the Administrator routes with.
    pub router_model: String,
    /// Fallback model for background summarization.
    pub summary_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".into(),
            router_model: "gemma3:4b".into(),
            summary_model: "gemma3:4b".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// sqlx connection URL. Overridable via `CQ_DATABASE_URL`.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://colloquy.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalConfig {
    /// Seconds to wait for a tool approval before auto-denying.
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl Config {
    /// Parse a config from TOML text and apply environment overrides.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        config.apply_env();
        Ok(config)
    }

    /// Load from a file path, falling back to defaults when absent.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("cannot read {}: {e}", p.display())))?;
                Self::from_toml(&text)
            }
            None => {
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("CQ_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(url) = std::env::var("CQ_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("CQ_LLM_URL") {
            self.llm.base_url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.approvals.timeout_secs, 300);
        assert!(config.database.url.starts_with("sqlite://"));
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [llm]
            router_model = "llama3.2:3b"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.llm.router_model, "llama3.2:3b");
        // Untouched sections keep defaults.
        assert_eq!(config.approvals.timeout_secs, 300);
    }

    #[test]
    fn rejects_unknown_keys() {
        let result = Config::from_toml("[server]\nbnid = \"oops\"\n");
        assert!(result.is_err());
    }
}
