use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub trendwire: TrendwireConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub trends: TrendsConfig,
}

#[derive(Debug, Deserialize)]
pub struct TrendwireConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// API token for the trigger/observability endpoints. Auto-generated and
    /// stored in settings when absent.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "trendwire.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to the TRENDWIRE_GENERATION_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Fixed delay between consecutive topics in a batch.
    #[serde(default = "default_topic_delay")]
    pub topic_delay: String,
    /// When true, batch-generated articles are published immediately;
    /// otherwise they land as drafts pending review.
    #[serde(default)]
    pub auto_publish: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_generation_base_url(),
            model: default_model(),
            api_key: None,
            timeout: default_timeout(),
            topic_delay: default_topic_delay(),
            auto_publish: false,
        }
    }
}

fn default_generation_base_url() -> String {
    "https://api.x.ai/v1".to_string()
}
fn default_model() -> String {
    "grok-2-1212".to_string()
}
fn default_timeout() -> String {
    "2m".to_string()
}
fn default_topic_delay() -> String {
    "2s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_images_base_url")]
    pub base_url: String,
    /// Falls back to the TRENDWIRE_IMAGES_API_KEY environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            base_url: default_images_base_url(),
            api_key: None,
        }
    }
}

fn default_images_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TrendsConfig {
    #[serde(default = "default_trends_base_url")]
    pub base_url: String,
    /// Falls back to the TRENDWIRE_TRENDS_BEARER_TOKEN environment variable.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            base_url: default_trends_base_url(),
            bearer_token: None,
        }
    }
}

fn default_trends_base_url() -> String {
    "https://api.twitter.com".to_string()
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.trendwire.data_dir.join(db_path)
        }
    }
}

/// Resolve a credential: config value wins, environment variable second.
/// A missing credential is not an error; adapters treat it as a failed
/// call and route to their local fallback.
pub fn resolve_credential(config_value: &Option<String>, env_var: &str) -> Option<String> {
    config_value
        .clone()
        .or_else(|| std::env::var(env_var).ok())
        .filter(|v| !v.is_empty())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate timezone
    config
        .trendwire
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.trendwire.timezone)))?;

    // Validate listen address
    config
        .trendwire
        .listen
        .parse::<std::net::SocketAddr>()
        .map_err(|e| ConfigError::Validation(format!("invalid listen address '{}': {e}", config.trendwire.listen)))?;

    // Validate durations
    humantime::parse_duration(&config.generation.timeout)
        .map_err(|e| ConfigError::Validation(format!("generation timeout '{}': {e}", config.generation.timeout)))?;
    humantime::parse_duration(&config.generation.topic_delay).map_err(|e| {
        ConfigError::Validation(format!("generation topic_delay '{}': {e}", config.generation.topic_delay))
    })?;

    if config.generation.model.is_empty() {
        return Err(ConfigError::Validation("generation model must not be empty".to_string()).into());
    }

    for (name, url) in [
        ("generation base_url", &config.generation.base_url),
        ("images base_url", &config.images.base_url),
        ("trends base_url", &config.trends.base_url),
    ] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(format!("{name} '{url}' must be an http(s) URL")).into());
        }
    }

    Ok(())
}
