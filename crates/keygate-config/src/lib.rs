use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TOKEN_ENV: &str = "KEYGATE_TELEGRAM_TOKEN";
pub const ADMIN_ID_ENV: &str = "KEYGATE_ADMIN_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: Telegram,
    pub pool: Pool,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub server: Option<Server>,
    #[serde(default)]
    pub audit: Option<Audit>,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telegram {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub admin_id: Option<i64>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout_s")]
    pub poll_timeout_s: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub bot_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub available_dir: String,
    pub issued_dir: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for Telegram {
    fn default() -> Self {
        Self {
            token: None,
            admin_id: None,
            api_base: default_api_base(),
            poll_timeout_s: default_poll_timeout_s(),
            request_timeout_ms: default_request_timeout_ms(),
            bot_handle: None,
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

impl Config {
    /// Bot token; only meaningful after `load_and_validate` has succeeded.
    pub fn token(&self) -> &str {
        self.telegram.token.as_deref().unwrap_or_default()
    }

    /// Administrator chat id; only meaningful after `load_and_validate` has succeeded.
    pub fn admin_id(&self) -> i64 {
        self.telegram.admin_id.unwrap_or_default()
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_s() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_extension() -> String {
    "conf".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Secrets may live outside the file; non-empty variables replace file values.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup(TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
        cfg.telegram.token = Some(token.trim().to_string());
    }
    if let Some(raw) = lookup(ADMIN_ID_ENV).filter(|v| !v.trim().is_empty()) {
        let admin_id = raw.trim().parse::<i64>().map_err(|_| {
            ConfigError::UnsupportedConfig(format!("{ADMIN_ID_ENV}={raw} is not an integer"))
        })?;
        cfg.telegram.admin_id = Some(admin_id);
    }
    Ok(())
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg
        .telegram
        .token
        .as_ref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "telegram.token is required (set it in the file or via {TOKEN_ENV})"
        )));
    }
    if cfg.telegram.admin_id.unwrap_or(0) == 0 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "telegram.admin_id is required (set it in the file or via {ADMIN_ID_ENV})"
        )));
    }
    if cfg.telegram.poll_timeout_s == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "telegram.poll_timeout_s must be >= 1".to_string(),
        ));
    }
    if cfg.telegram.request_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "telegram.request_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.pool.available_dir.trim().is_empty() || cfg.pool.issued_dir.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "pool.available_dir and pool.issued_dir must not be empty".to_string(),
        ));
    }
    if std::path::Path::new(&cfg.pool.available_dir) == std::path::Path::new(&cfg.pool.issued_dir)
    {
        return Err(ConfigError::UnsupportedConfig(
            "pool.available_dir and pool.issued_dir must differ".to_string(),
        ));
    }
    if cfg.pool.extension.is_empty() || cfg.pool.extension.contains('.') {
        return Err(ConfigError::UnsupportedConfig(format!(
            "pool.extension={} must be a bare extension such as conf",
            cfg.pool.extension
        )));
    }
    if cfg.gate.probe_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate.probe_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.gate.delivery_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate.delivery_timeout_ms must be >= 1".to_string(),
        ));
    }
    if let Some(server) = &cfg.server {
        if server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "server.listen_addr={} is not a socket address",
                server.listen_addr
            )));
        }
    }
    Ok(())
}
