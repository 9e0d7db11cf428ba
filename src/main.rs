mod cache;
mod config;
mod consumers;
mod coordinator;
mod datasource;
mod engine;
mod error;
mod network;
mod scheduler;
mod sensors;
mod settings;
mod snapshot;
mod vbus;
mod widget;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_scalar::{Scalar, Servable};

use crate::cache::{CacheEntry, CachedValue, Outcome};
use crate::config::AppConfig;
use crate::coordinator::{RefreshEvent, RefreshReason, RefreshStatus, StaleReason};
use crate::engine::Engine;
use crate::error::AppError;
use crate::scheduler::{Precision, SchedulerState};
use crate::sensors::ColorBand;
use crate::settings::{Settings, SettingsUpdate};
use crate::widget::{DashboardView, LayoutVariant, SizeCategory, Tile, WidgetView};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Measured widget size in dp
#[derive(Debug, Deserialize, ToSchema)]
struct WidgetSize {
    min_width: u32,
    min_height: u32,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Solar Widget API",
        description = "Cached solar and pool controller readings for home screen widgets",
        version = "0.1.0"
    ),
    tags(
        (name = "Sensors", description = "Cached readings and refresh"),
        (name = "Widgets", description = "Attached widgets and their views"),
        (name = "Settings", description = "Refresh preferences")
    ),
    paths(
        health,
        get_sensors,
        get_sensor,
        get_dashboard,
        post_refresh,
        get_settings,
        put_settings,
        attach_widget,
        get_widget,
        resize_widget,
        detach_widget,
        get_scheduler
    ),
    components(schemas(
        CacheEntry,
        CachedValue,
        Outcome,
        RefreshEvent,
        RefreshReason,
        RefreshStatus,
        StaleReason,
        Settings,
        SettingsUpdate,
        WidgetSize,
        WidgetView,
        DashboardView,
        Tile,
        ColorBand,
        LayoutVariant,
        SizeCategory,
        SchedulerState,
        Precision
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();

    let engine = match Engine::from_config(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to start refresh engine: {}", e);
            std::process::exit(1);
        }
    };
    engine.boot().await;

    let state = AppState { engine };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/sensors", get(get_sensors))
        .route("/sensors/{key}", get(get_sensor))
        .route("/dashboard", get(get_dashboard))
        .route("/refresh", post(post_refresh))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/widgets", post(attach_widget))
        .route(
            "/widgets/{id}",
            get(get_widget).put(resize_widget).delete(detach_widget),
        )
        .route("/scheduler", get(get_scheduler))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .route("/openapi.json", get(openapi_json))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
async fn health() -> &'static str {
    "ok"
}

/// Get OpenAPI JSON specification
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Get cached sensor values
///
/// Returns the last known-good values with the outcome of the last attempt.
/// The `x-cache-policy` header holds the refresh interval in seconds.
#[utoipa::path(
    get,
    path = "/sensors",
    tag = "Sensors",
    responses(
        (status = 200, description = "Cached sensor values", body = CacheEntry)
    )
)]
async fn get_sensors(State(state): State<AppState>) -> impl IntoResponse {
    let entry = state.engine.entry().await;
    (
        [(
            header::HeaderName::from_static("x-cache-policy"),
            state.engine.cache_policy().to_string(),
        )],
        Json(entry),
    )
}

/// Get one cached sensor value
#[utoipa::path(
    get,
    path = "/sensors/{key}",
    tag = "Sensors",
    params(
        ("key" = String, Path, description = "Sensor cache key (e.g., ecs-temperature)")
    ),
    responses(
        (status = 200, description = "Cached value", body = CachedValue),
        (status = 404, description = "Nothing cached for this key")
    )
)]
async fn get_sensor(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CachedValue>, AppError> {
    Ok(Json(state.engine.sensor(&key).await?))
}

/// Get the dashboard view
#[utoipa::path(
    get,
    path = "/dashboard",
    tag = "Sensors",
    responses(
        (status = 200, description = "Sensors split into two columns", body = DashboardView)
    )
)]
async fn get_dashboard(State(state): State<AppState>) -> Json<DashboardView> {
    Json(state.engine.dashboard().await)
}

/// Refresh now
///
/// Joins the refresh in flight if there is one. Always answers with the
/// resulting event; failures are reported as stale data, not errors.
#[utoipa::path(
    post,
    path = "/refresh",
    tag = "Sensors",
    responses(
        (status = 200, description = "Refresh result", body = RefreshEvent)
    )
)]
async fn post_refresh(State(state): State<AppState>) -> Json<RefreshEvent> {
    Json(state.engine.refresh().await)
}

/// Get refresh preferences
#[utoipa::path(
    get,
    path = "/settings",
    tag = "Settings",
    responses(
        (status = 200, description = "Current preferences", body = Settings)
    )
)]
async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.engine.settings())
}

/// Update refresh preferences
///
/// Changing the interval or the WiFi-only flag reschedules and refreshes.
#[utoipa::path(
    put,
    path = "/settings",
    tag = "Settings",
    request_body = SettingsUpdate,
    responses(
        (status = 200, description = "Updated preferences", body = Settings),
        (status = 400, description = "Invalid refresh rate")
    )
)]
async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Settings>, AppError> {
    Ok(Json(state.engine.update_settings(update).await?))
}

/// Attach a widget
///
/// Returns the initial view rendered from the cache and starts a refresh.
#[utoipa::path(
    post,
    path = "/widgets",
    tag = "Widgets",
    request_body = WidgetSize,
    responses(
        (status = 201, description = "Widget attached", body = WidgetView)
    )
)]
async fn attach_widget(
    State(state): State<AppState>,
    Json(size): Json<WidgetSize>,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .engine
        .attach_widget(size.min_width, size.min_height)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Get a widget's current view
#[utoipa::path(
    get,
    path = "/widgets/{id}",
    tag = "Widgets",
    params(
        ("id" = u64, Path, description = "Widget id")
    ),
    responses(
        (status = 200, description = "Widget view", body = WidgetView),
        (status = 404, description = "Unknown widget")
    )
)]
async fn get_widget(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<WidgetView>, AppError> {
    Ok(Json(state.engine.widget(id).await?))
}

/// Report new widget dimensions
#[utoipa::path(
    put,
    path = "/widgets/{id}",
    tag = "Widgets",
    params(
        ("id" = u64, Path, description = "Widget id")
    ),
    request_body = WidgetSize,
    responses(
        (status = 200, description = "Re-rendered view", body = WidgetView),
        (status = 404, description = "Unknown widget")
    )
)]
async fn resize_widget(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(size): Json<WidgetSize>,
) -> Result<Json<WidgetView>, AppError> {
    let view = state
        .engine
        .resize_widget(id, size.min_width, size.min_height)
        .await?;
    Ok(Json(view))
}

/// Detach a widget
///
/// Detaching the last widget stops scheduled refreshes.
#[utoipa::path(
    delete,
    path = "/widgets/{id}",
    tag = "Widgets",
    params(
        ("id" = u64, Path, description = "Widget id")
    ),
    responses(
        (status = 204, description = "Widget detached"),
        (status = 404, description = "Unknown widget")
    )
)]
async fn detach_widget(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, AppError> {
    state.engine.detach_widget(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get the refresh scheduler state
#[utoipa::path(
    get,
    path = "/scheduler",
    tag = "Sensors",
    responses(
        (status = 200, description = "Scheduler state", body = SchedulerState)
    )
)]
async fn get_scheduler(State(state): State<AppState>) -> Json<SchedulerState> {
    Json(state.engine.scheduler_state())
}
