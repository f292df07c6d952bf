//! Layered runtime configuration.
//!
//! Sources, highest priority first:
//! 1. Environment variables (`DATABASE_URL`, `AI_PROVIDER`, ...), optionally
//!    seeded from a `.env` file.
//! 2. `planflow.toml` in the working directory, or the file named by
//!    `PLANFLOW_CONFIG`.
//! 3. Built-in defaults.

use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::agents::ProviderKind;

/// Environment variables read verbatim into [`Settings`] fields.
const ENV_KEYS: &[&str] = &[
    "APP_NAME",
    "ENVIRONMENT",
    "DATABASE_URL",
    "QUEUE_URL",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "AI_PROVIDER",
    "AI_MODEL",
    "OPENAI_BASE_URL",
    "ANTHROPIC_BASE_URL",
    "AI_TIMEOUT_SECS",
    "BACKEND_CORS_ORIGINS",
    "PROMPTS_DIR",
    "BIND_ADDR",
    "WORKER_POLL_MS",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub app_name: String,
    pub environment: String,
    pub database_url: String,
    /// Redis URL for the job transport. `None` keeps jobs in the database.
    pub queue_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ai_provider: String,
    pub ai_model: Option<String>,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub ai_timeout_secs: u64,
    #[serde(deserialize_with = "comma_list")]
    pub backend_cors_origins: Vec<String>,
    pub prompts_dir: PathBuf,
    pub bind_addr: String,
    pub worker_poll_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "AI-Driven Project Flow API".to_string(),
            environment: "development".to_string(),
            database_url: "sqlite://planflow.db".to_string(),
            queue_url: None,
            openai_api_key: None,
            anthropic_api_key: None,
            ai_provider: "openai".to_string(),
            ai_model: None,
            openai_base_url: "https://api.openai.com".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            ai_timeout_secs: 45,
            backend_cors_origins: vec![
                "http://localhost:8080".to_string(),
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
            prompts_dir: PathBuf::from("prompts"),
            bind_addr: "0.0.0.0:8000".to_string(),
            worker_poll_ms: 1000,
        }
    }
}

impl Settings {
    /// Load settings from defaults, the optional TOML file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let settings: Settings = Self::figment().extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Same as [`Settings::load`] but reads `.env` first when present.
    pub fn load_with_dotenv() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::load()
    }

    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let file = std::env::var("PLANFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("planflow.toml"));
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }

        // REDIS_URL is accepted as a legacy spelling of QUEUE_URL.
        figment
            .merge(
                Env::raw()
                    .only(&["REDIS_URL"])
                    .map(|_| "queue_url".into()),
            )
            .merge(Env::raw().only(ENV_KEYS))
    }

    /// Provider selected by `AI_PROVIDER`.
    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        ProviderKind::parse(&self.ai_provider).ok_or_else(|| ConfigError::InvalidValue {
            field: "ai_provider".to_string(),
            reason: format!("unsupported AI provider '{}'", self.ai_provider),
        })
    }

    /// API key for the given provider, ignoring blank values.
    pub fn api_key_for(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::OpenAi => self.openai_api_key.as_deref(),
            ProviderKind::Anthropic => self.anthropic_api_key.as_deref(),
        };
        key.map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn base_url_for(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.openai_base_url,
            ProviderKind::Anthropic => &self.anthropic_base_url,
        }
    }

    /// Queue URL, ignoring blank values.
    pub fn queue_url(&self) -> Option<&str> {
        self.queue_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.provider_kind()?;
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "database_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.worker_poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_poll_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Accept either a list or a comma separated string.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let values = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(raw) => raw.split(',').map(str::to_string).collect(),
        OneOrMany::Many(list) => list,
    };
    Ok(values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}
