use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub gmail: GmailConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GmailConfig {
    /// Pub/Sub topic handed to users.watch, e.g. projects/<id>/topics/mail.
    pub topic: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

/// Tuning knobs for the sync pipeline. Defaults match the values the pipeline
/// was validated with; override per deployment in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    #[serde(default = "default_first_run_lookback_mins")]
    pub first_run_lookback_mins: i64,
    #[serde(default = "default_cutoff_buffer_mins")]
    pub cutoff_buffer_mins: i64,
    #[serde(default = "default_max_window_mins")]
    pub max_window_mins: i64,
    /// Gmail search expression used by the recency fallback tier.
    #[serde(default = "default_recency_query")]
    pub recency_query: String,
    #[serde(default = "default_fallback_max_results")]
    pub fallback_max_results: u32,
    #[serde(default = "default_notifications_per_minute")]
    pub notifications_per_minute: u32,
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
}

fn default_first_run_lookback_mins() -> i64 {
    30
}

fn default_cutoff_buffer_mins() -> i64 {
    5
}

fn default_max_window_mins() -> i64 {
    120
}

fn default_recency_query() -> String {
    "newer_than:1h".to_string()
}

fn default_fallback_max_results() -> u32 {
    20
}

fn default_notifications_per_minute() -> u32 {
    10
}

fn default_job_deadline_secs() -> u64 {
    240
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            first_run_lookback_mins: default_first_run_lookback_mins(),
            cutoff_buffer_mins: default_cutoff_buffer_mins(),
            max_window_mins: default_max_window_mins(),
            recency_query: default_recency_query(),
            fallback_max_results: default_fallback_max_results(),
            notifications_per_minute: default_notifications_per_minute(),
            job_deadline_secs: default_job_deadline_secs(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides,
    /// and resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.app.port = port;
        }

        if let Ok(topic) = env::var("GMAIL_TOPIC") {
            self.gmail.topic = topic;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.gmail.topic)?;
        if let Some(api_base) = &mut self.gmail.api_base {
            apply_env_marker(api_base)?;
        }
        if let Some(endpoint) = &mut self.gmail.token_endpoint {
            apply_env_marker(endpoint)?;
        }
        apply_env_marker_path(&mut self.paths.database)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
