//! Configuration loading, validation, and management for LocalAPI.
//!
//! Loads configuration from `~/.localapi/config.toml` (or an explicit path)
//! with `LOCALAPI_*` environment variable overrides. Validates all settings
//! at startup. The resulting [`AppConfig`] is immutable for the process
//! lifetime and handed to each component by value or `Arc`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "LOCALAPI_";

/// The root configuration structure.
///
/// Maps directly to `~/.localapi/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bearer token for the inference endpoint, if it needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Inference backend settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Context budget and history folding
    #[serde(default)]
    pub context: ContextConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// SQLite storage
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

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
            .field("llm", &self.llm)
            .field("context", &self.context)
            .field("gateway", &self.gateway)
            .field("database", &self.database)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API, including `/v1`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat model identifier
    #[serde(default = "default_model")]
    pub model: String,

    /// Vision model identifier
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Whole-request timeout for backend calls, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://192.168.0.111:1234/v1".into()
}
fn default_model() -> String {
    "qwen/qwen3-14b".into()
}
fn default_vision_model() -> String {
    "qwen2.5-vl-7b-instruct@q8_0".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    512
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            vision_model: default_vision_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Token budget knobs for context assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context window in tokens
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,

    /// Share of the window the prompt may use
    #[serde(default = "default_prompt_budget_ratio")]
    pub prompt_budget_ratio: f64,

    /// Tolerance above the budget before folding kicks in
    #[serde(default = "default_hysteresis_tokens")]
    pub hysteresis_tokens: usize,

    /// Most recent messages considered for each prompt
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,

    /// Advisory history size that is logged as due for folding
    #[serde(default = "default_summarize_after_messages")]
    pub summarize_after_messages: usize,

    /// Newest messages kept verbatim when a fold retires older ones
    #[serde(default = "default_fold_retain_messages")]
    pub fold_retain_messages: usize,
}

fn default_window_tokens() -> usize {
    8192
}
fn default_prompt_budget_ratio() -> f64 {
    0.6
}
fn default_hysteresis_tokens() -> usize {
    256
}
fn default_max_context_messages() -> usize {
    20
}
fn default_summarize_after_messages() -> usize {
    100
}
fn default_fold_retain_messages() -> usize {
    2
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window_tokens(),
            prompt_budget_ratio: default_prompt_budget_ratio(),
            hysteresis_tokens: default_hysteresis_tokens(),
            max_context_messages: default_max_context_messages(),
            summarize_after_messages: default_summarize_after_messages(),
            fold_retain_messages: default_fold_retain_messages(),
        }
    }
}

impl ContextConfig {
    /// Nominal prompt budget: `floor(window_tokens * prompt_budget_ratio)`.
    pub fn budget(&self) -> usize {
        (self.window_tokens as f64 * self.prompt_budget_ratio).floor() as usize
    }

    /// Highest prompt size accepted without folding.
    pub fn ceiling(&self) -> usize {
        self.budget() + self.hysteresis_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `sqlite::memory:` for a throwaway database
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "data/local_api.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.localapi/config.toml),
    /// then apply `LOCALAPI_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply overrides from the process environment.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
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

    /// Apply `LOCALAPI_*` overrides read through `lookup`.
    ///
    /// `lookup` receives the full variable name; tests pass a map instead of
    /// touching the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = get("API_HOST") {
            self.gateway.host = v;
        }
        if let Some(v) = get("API_PORT") {
            self.gateway.port = parse_env("API_PORT", &v)?;
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("VISION_MODEL") {
            self.llm.vision_model = v;
        }
        if let Some(v) = get("TEMPERATURE") {
            self.llm.temperature = parse_env("TEMPERATURE", &v)?;
        }
        if let Some(v) = get("MAX_TOKENS") {
            self.llm.max_tokens = parse_env("MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            let secs: f64 = parse_env("REQUEST_TIMEOUT", &v)?;
            self.llm.request_timeout_secs = secs.ceil() as u64;
        }
        if let Some(v) = get("MAX_CONTEXT_MESSAGES") {
            self.context.max_context_messages = parse_env("MAX_CONTEXT_MESSAGES", &v)?;
        }
        if let Some(v) = get("SUMMARIZE_AFTER_MESSAGES") {
            self.context.summarize_after_messages = parse_env("SUMMARIZE_AFTER_MESSAGES", &v)?;
        }
        if let Some(v) = get("WINDOW_TOKENS") {
            self.context.window_tokens = parse_env("WINDOW_TOKENS", &v)?;
        }
        if let Some(v) = get("PROMPT_BUDGET_RATIO") {
            self.context.prompt_budget_ratio = parse_env("PROMPT_BUDGET_RATIO", &v)?;
        }
        if let Some(v) = get("HYSTERESIS_TOKENS") {
            self.context.hysteresis_tokens = parse_env("HYSTERESIS_TOKENS", &v)?;
        }
        if let Some(v) = get("FOLD_RETAIN_MESSAGES") {
            self.context.fold_retain_messages = parse_env("FOLD_RETAIN_MESSAGES", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v.to_lowercase();
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".localapi")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.temperature < 0.0 || self.llm.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.llm.max_tokens == 0 {
            return Err(ConfigError::ValidationError("llm.max_tokens must be >= 1".into()));
        }

        if self.llm.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "llm.request_timeout_secs must be >= 1".into(),
            ));
        }

        let ctx = &self.context;
        if !(ctx.prompt_budget_ratio > 0.0 && ctx.prompt_budget_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "context.prompt_budget_ratio must be in (0.0, 1.0]".into(),
            ));
        }

        if ctx.window_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.window_tokens must be >= 1".into(),
            ));
        }

        if ctx.max_context_messages == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_context_messages must be >= 1".into(),
            ));
        }

        if ctx.summarize_after_messages < 2 {
            return Err(ConfigError::ValidationError(
                "context.summarize_after_messages must be >= 2".into(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// The configuration with secrets removed, safe to expose over HTTP.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: None,
            ..self.clone()
        }
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            llm: LlmConfig::default(),
            context: ContextConfig::default(),
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::EnvError {
        var: format!("{ENV_PREFIX}{name}"),
        reason: e.to_string(),
    })
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

    #[error("Invalid value for {var}: {reason}")]
    EnvError { var: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
