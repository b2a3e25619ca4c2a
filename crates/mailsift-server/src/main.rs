mod webhook;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailsift_core::accounts::AccountRepository;
use mailsift_core::gmail::oauth::TOKEN_ENDPOINT;
use mailsift_core::gmail::{GmailClient, NoopTokenStore};
use mailsift_core::lifecycle::WatchLifecycle;
use mailsift_core::throttle::{InMemoryThrottle, NotificationThrottle};
use mailsift_core::watches::WatchRepository;
use mailsift_core::{
    Config, Database, JobDispatcher, JobQueue, KeywordClassifier, WorkerConfig, init_telemetry,
    migrations, run_worker,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
const RENEWAL_LEAD_HOURS: i64 = 24;
// Request bound for every outbound provider call. The webhook handler runs on
// this client, so a stalled connection cannot hold the Pub/Sub ack open.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    db: Database,
    queue: JobQueue,
    http: reqwest::Client,
    throttle: Arc<dyn NotificationThrottle>,
    gmail_api_base: Option<String>,
    gmail_token_endpoint: Option<String>,
}

impl AppState {
    fn token_endpoint(&self) -> &str {
        self.gmail_token_endpoint
            .as_deref()
            .unwrap_or(TOKEN_ENDPOINT)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    init_telemetry(&config.app)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let queue = JobQueue::new(db.clone());

    let mut dispatcher = JobDispatcher::new(
        db.clone(),
        http.clone(),
        Arc::new(KeywordClassifier),
        config.sync.clone(),
    );
    if let Some(api_base) = &config.gmail.api_base {
        dispatcher = dispatcher.with_api_base(api_base);
    }
    if let Some(endpoint) = &config.gmail.token_endpoint {
        dispatcher = dispatcher.with_token_endpoint(endpoint);
    }

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(run_worker(
        queue.clone(),
        dispatcher,
        WorkerConfig::default(),
        shutdown.child_token(),
    ));

    let state = AppState {
        db: db.clone(),
        queue,
        http,
        throttle: Arc::new(InMemoryThrottle::new(config.sync.notifications_per_minute)),
        gmail_api_base: config.gmail.api_base.clone(),
        gmail_token_endpoint: config.gmail.token_endpoint.clone(),
    };

    let maintenance_handle = tokio::spawn(maintenance_loop(state.clone(), shutdown.child_token()));

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mailsift listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = maintenance_handle.await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .merge(webhook::router())
        .with_state(state)
}

/// Hourly watch upkeep: mark expired registrations inactive, and renew the
/// ones expiring within the lead window.
async fn maintenance_loop(state: AppState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let lifecycle = WatchLifecycle::new(
            WatchRepository::new(state.db.clone()),
            AccountRepository::new(state.db.clone()),
        );
        let now = Utc::now();

        match lifecycle.sweep_expired(now).await {
            Ok(swept) if !swept.is_empty() => {
                info!(count = swept.len(), "expired watches swept");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "watch sweep failed"),
        }

        let due = match lifecycle
            .list_due_for_renewal(now, chrono::Duration::hours(RENEWAL_LEAD_HOURS))
            .await
        {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "renewal listing failed");
                continue;
            }
        };

        for watch in due {
            if let Err(err) = renew_watch(&state, &lifecycle, &watch).await {
                warn!(
                    account = %watch.account_email,
                    error = %err,
                    "watch renewal failed"
                );
            }
        }
    }
}

async fn renew_watch(
    state: &AppState,
    lifecycle: &WatchLifecycle,
    watch: &mailsift_core::Watch,
) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = AccountRepository::new(state.db.clone());
    let account = accounts.get_by_email(&watch.account_email).await?;
    let tokens = accounts
        .valid_tokens_with_endpoint(&account.id, &state.http, state.token_endpoint())
        .await?;

    let mut client = GmailClient::new(
        state.http.clone(),
        "me",
        &account.config.client_id,
        &account.config.client_secret,
        tokens,
        Arc::new(NoopTokenStore),
    );
    if let Some(api_base) = &state.gmail_api_base {
        client = client.with_api_base(api_base);
    }

    lifecycle.renew(&client, watch).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.db.health_check().await {
        Ok(_) => "ok",
        Err(_) => "unhealthy",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_status == "ok" {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}
