use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize structured logging (RUST_LOG driven). JSON output is used for
/// production; pretty output on stderr for dev. Calling this more than once is
/// a no-op so tests can initialize freely.
pub fn init_telemetry(app: &AppConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let json_format = !app.env.eq_ignore_ascii_case("dev");
    let already_set = if json_format {
        let subscriber = Registry::default()
            .with(fmt::layer().json().flatten_event(true))
            .with(env_filter);
        tracing::subscriber::set_global_default(subscriber).is_err()
    } else {
        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .with_target(true)
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .with(env_filter);
        tracing::subscriber::set_global_default(subscriber).is_err()
    };

    if already_set {
        tracing::debug!("tracing subscriber already installed; keeping existing one");
    }

    Ok(())
}

/// Basic logging initializer for binaries/tests that do not wire full config.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailsift".to_string(),
        port: 0,
        env: env.to_string(),
    };
    init_telemetry(&app)
}
