//! Configuration loading, validation, and management for revloop.
//!
//! Loads configuration from `~/.revloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use revloop_core::LoopConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.revloop/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Anthropic API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL override (proxies, gateways)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model id
    #[serde(default = "default_model")]
    pub model: String,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stream responses (false uses the single-response path)
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Replaces the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Where conversations are saved (default `~/.revloop/conversations`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversations_dir: Option<String>,

    /// Prompt caching
    #[serde(default)]
    pub caching: CachingConfig,

    /// Extended thinking
    #[serde(default)]
    pub thinking: ThinkingSettings,

    /// Agent loop limits
    #[serde(default)]
    pub agent: LoopConfig,

    /// Tool call approval
    #[serde(default)]
    pub approval: ApprovalConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_true() -> bool {
    true
}

/// Smallest thinking budget the API accepts.
pub const MIN_THINKING_BUDGET: u32 = 1024;

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("streaming", &self.streaming)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("conversations_dir", &self.conversations_dir)
            .field("caching", &self.caching)
            .field("thinking", &self.thinking)
            .field("agent", &self.agent)
            .field("approval", &self.approval)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Tokens the model may spend reasoning (min 1024)
    #[serde(default = "default_thinking_budget")]
    pub budget_tokens: u32,

    /// Allow reasoning between tool calls
    #[serde(default = "default_true")]
    pub interleaved: bool,
}

fn default_thinking_budget() -> u32 {
    10_000
}

impl Default for ThinkingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            budget_tokens: default_thinking_budget(),
            interleaved: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Ask before every tool call
    #[serde(default)]
    pub required: bool,

    /// How long to wait for an answer before denying
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

fn default_approval_timeout() -> u64 {
    120
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            required: false,
            timeout_secs: default_approval_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.revloop/config.toml).
    ///
    /// Also checks environment variables:
    /// - `ANTHROPIC_API_KEY`, then `REVLOOP_API_KEY` (when the file sets no key)
    /// - `REVLOOP_MODEL` (overrides the model)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .or_else(|| std::env::var("REVLOOP_API_KEY").ok())
                .filter(|k| !k.is_empty());
        }

        if let Ok(model) = std::env::var("REVLOOP_MODEL") {
            config.model = model;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("Failed to render config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".revloop")
    }

    /// Directory conversations are saved to.
    pub fn conversations_path(&self) -> PathBuf {
        self.conversations_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("conversations"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError("max_tokens must be > 0".into()));
        }

        if self.thinking.enabled {
            if self.thinking.budget_tokens < MIN_THINKING_BUDGET {
                return Err(ConfigError::ValidationError(format!(
                    "thinking.budget_tokens must be at least {MIN_THINKING_BUDGET}"
                )));
            }
            if self.thinking.budget_tokens >= self.max_tokens {
                return Err(ConfigError::ValidationError(
                    "thinking.budget_tokens must be less than max_tokens".into(),
                ));
            }
        }

        self.agent.validate().map_err(ConfigError::ValidationError)?;

        if self.approval.required && self.approval.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "approval.timeout_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            streaming: true,
            system_prompt: None,
            conversations_dir: None,
            caching: CachingConfig::default(),
            thinking: ThinkingSettings::default(),
            agent: LoopConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.model, "claude-sonnet-4-20250514");
        assert_eq!(config.max_tokens, 8192);
        assert!(config.streaming);
        assert!(config.caching.enabled);
        assert!(!config.thinking.enabled);
        assert_eq!(config.agent.max_iterations, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.agent, config.agent);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
model = "claude-opus-4-20250514"

[thinking]
enabled = true
budget_tokens = 4096

[agent]
doom_loop_threshold = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model, "claude-opus-4-20250514");
        assert!(config.thinking.enabled);
        assert!(config.thinking.interleaved);
        assert_eq!(config.agent.doom_loop_threshold, 2);
        assert_eq!(config.agent.max_consecutive_errors, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn small_thinking_budget_rejected() {
        let config = AppConfig {
            thinking: ThinkingSettings {
                enabled: true,
                budget_tokens: 512,
                interleaved: true,
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn thinking_budget_must_fit_max_tokens() {
        let config = AppConfig {
            max_tokens: 4096,
            thinking: ThinkingSettings {
                enabled: true,
                budget_tokens: 4096,
                interleaved: false,
            },
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_loop_limit_rejected() {
        let config = AppConfig {
            agent: LoopConfig {
                max_consecutive_errors: 0,
                ..LoopConfig::default()
            },
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_consecutive_errors"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.max_tokens, 8192);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = AppConfig {
            model: "claude-haiku".into(),
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.model, "claude-haiku");
    }

    #[test]
    fn invalid_toml_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-ant-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn conversations_dir_override() {
        let config = AppConfig {
            conversations_dir: Some("/tmp/convs".into()),
            ..AppConfig::default()
        };
        assert_eq!(config.conversations_path(), PathBuf::from("/tmp/convs"));
        assert!(AppConfig::default().conversations_path().ends_with("conversations"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("claude-sonnet-4-20250514"));
        assert!(toml_str.contains("doom_loop_threshold"));
    }
}
