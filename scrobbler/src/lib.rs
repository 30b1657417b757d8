use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use sqlx::postgres::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod db;
pub mod error;
pub mod lastfm;
pub mod models;
pub mod normalize;
pub mod scheduler;
pub mod submitter;
pub mod sync;
pub mod watermark;
pub mod ytmusic;

#[cfg(test)]
mod testing;

use config::Config;
use db::{PgUserStore, UserStore};
use error::SyncError;
use lastfm::LastFmClient;
use models::{UserPage, UserQuery, UserSummary};
use scheduler::{OperatorError, Scheduler};
use sync::{Pipeline, RunReport};
use ytmusic::YtMusicClient;

pub const DEFAULT_LOG_FILTER: &str = "ytmusic_scrobbler=info,tower_http=info";

#[derive(Clone)]
pub struct AppState {
    scheduler: Scheduler,
    store: Arc<dyn UserStore>,
    operator_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler, operator_token: Option<String>) -> Self {
        Self {
            store: scheduler.pipeline().store().clone(),
            scheduler,
            operator_token: operator_token.map(Arc::from),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActiveToggle {
    is_active: bool,
}

fn operator_status(e: &OperatorError) -> StatusCode {
    match e {
        OperatorError::NotFound(_) => StatusCode::NOT_FOUND,
        OperatorError::NotEligible(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OperatorError::Busy(_) => StatusCode::CONFLICT,
        OperatorError::Run(SyncError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        OperatorError::Run(SyncError::WatermarkConflict(_)) => StatusCode::CONFLICT,
        OperatorError::Run(SyncError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
        OperatorError::Run(SyncError::Store(_) | SyncError::TaskFailed(_))
        | OperatorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        OperatorError::Run(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = state.operator_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(request).await)
}

async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserPage>, StatusCode> {
    let (users, count) = state.store.list_users(&query).await.map_err(|e| {
        tracing::error!("failed to list users: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(UserPage {
        users: users.iter().map(UserSummary::from).collect(),
        count,
        page: query.page(),
        per_page: query.per_page(),
    }))
}

async fn set_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActiveToggle>,
) -> Result<Json<UserSummary>, StatusCode> {
    let user = state
        .scheduler
        .set_active(&id, body.is_active)
        .await
        .map_err(|e| {
            tracing::warn!("failed to set active={} for user {}: {}", body.is_active, id, e);
            operator_status(&e)
        })?;

    Ok(Json(UserSummary::from(&user)))
}

async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunReport>, StatusCode> {
    tracing::info!("operator requested run for user {}", id);
    let report = state.scheduler.run_now(&id).await.map_err(|e| {
        tracing::warn!("run for user {} not completed: {}", id, e);
        operator_status(&e)
    })?;

    Ok(Json(report))
}

async fn health_check() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    let operator = Router::new()
        .route("/api/users", get(list_users))
        .route("/api/users/:id/active", put(set_active))
        .route("/api/users/:id/run", post(run_now))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wires the Postgres store and both remote clients into a scheduler.
pub fn build_scheduler(config: &Config, pool: PgPool) -> Result<Scheduler> {
    let store = Arc::new(PgUserStore::new(pool));
    let history = Arc::new(YtMusicClient::new().context("failed to build YouTube Music client")?);
    let scrobbler = Arc::new(
        LastFmClient::new(
            config.lastfm_api_key.clone(),
            config.lastfm_api_secret.clone(),
            config.lastfm_calls_per_sec,
        )
        .context("failed to build Last.fm client")?,
    );

    let pipeline = Pipeline::new(store, history, scrobbler, config.sync.clone());
    Ok(Scheduler::new(pipeline))
}

pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_LOG_FILTER);

    let config = Config::from_env().context("invalid configuration")?;

    let pool = db::init_db(&config.database_url)
        .await
        .context("failed to initialize database")?;
    tracing::info!("database initialized");

    let scheduler = build_scheduler(&config, pool)?;
    if config.operator_token.is_none() {
        tracing::warn!("OPERATOR_TOKEN not set, operator endpoints are unauthenticated");
    }
    let state = AppState::new(scheduler.clone(), config.operator_token.clone());

    let shutdown = CancellationToken::new();
    let ticker = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run_forever(shutdown).await })
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", config.bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    ticker.await.context("scheduler task failed")?;
    scheduler.drain().await;
    tracing::info!("shut down cleanly");

    Ok(())
}
