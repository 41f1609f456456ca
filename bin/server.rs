// Firm Map - API Server
// JSON API over one shared map session

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use firm_map::{
    logging, Config, FirmStore, LastUpdated, LayerControl, LayerTree, MapSession, Notice,
    PasswordGate, PlacedMarker, RawRow, RefreshOutcome, RowSource, SessionSettings, SyncEngine,
    SyncTasks,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

struct LiveSession {
    engine: SyncEngine<LayerTree>,
    tasks: SyncTasks,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: FirmStore,
    gate: PasswordGate,
    settings: SessionSettings,
    refresh_every: Duration,
    live: Arc<Mutex<Option<LiveSession>>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse {
        success: false,
        data: (),
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    firms: usize,
}

#[derive(Deserialize)]
struct LayerRequest {
    visible: bool,
}

#[derive(Serialize)]
struct LastUpdatedResponse {
    badge: LastUpdated,
    text: String,
}

#[derive(Serialize)]
struct StoredRow {
    id: String,
    row: RawRow,
}

// ============================================================================
// Session access
// ============================================================================

/// Engine of the logged-in session, or 401
async fn engine(state: &AppState) -> Result<SyncEngine<LayerTree>, Response> {
    state
        .live
        .lock()
        .await
        .as_ref()
        .map(|live| live.engine.clone())
        .ok_or_else(|| failure(StatusCode::UNAUTHORIZED, "Not logged in"))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    success("OK")
}

/// POST /api/login - Check the password and open the session
async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Response {
    if !state.gate.check(&request.password) {
        warn!("rejected login attempt");
        return failure(StatusCode::UNAUTHORIZED, PasswordGate::REJECTED);
    }

    let mut live = state.live.lock().await;
    if live.is_none() {
        let session = MapSession::open(state.settings.clone(), LayerTree::new());
        let source: Arc<dyn RowSource> = Arc::new(state.store.clone());
        let engine = SyncEngine::new(source, session);
        let tasks = engine.start(state.refresh_every).await;
        *live = Some(LiveSession { engine, tasks });
        info!("map session started");
    }

    let firms = live
        .as_ref()
        .map_or(0, |live| live.engine.session().snapshot().len());
    success(LoginResponse { firms })
}

/// POST /api/logout - Stop syncing and release every marker
async fn logout(State(state): State<AppState>) -> Response {
    match state.live.lock().await.take() {
        Some(live) => {
            live.engine.close(live.tasks);
            info!("map session closed");
            success("logged out")
        }
        None => failure(StatusCode::UNAUTHORIZED, "Not logged in"),
    }
}

/// GET /api/markers - Markers on currently visible layers
async fn get_markers(State(state): State<AppState>) -> Response {
    let engine = match engine(&state).await {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    let markers: Vec<PlacedMarker> = engine
        .session()
        .surface()
        .visible_markers()
        .into_iter()
        .cloned()
        .collect();
    success(markers)
}

/// GET /api/layers - Layer checkboxes with counts
async fn get_layers(State(state): State<AppState>) -> Response {
    match engine(&state).await {
        Ok(engine) => {
            let controls: Vec<LayerControl> = engine.session().layer_controls();
            success(controls)
        }
        Err(response) => response,
    }
}

/// POST /api/layers/:category - Show or hide one category
async fn set_layer(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(request): Json<LayerRequest>,
) -> Response {
    let engine = match engine(&state).await {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    // Decode names such as "Strategy%26"
    let category = urlencoding::decode(&category)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(category);

    let mut session = engine.session();
    if !session.toggle_layer(&category, request.visible) {
        return failure(StatusCode::NOT_FOUND, format!("Unknown category: {}", category));
    }
    success(session.layer_controls())
}

/// POST /api/layers/select-all
async fn select_all_layers(State(state): State<AppState>) -> Response {
    match engine(&state).await {
        Ok(engine) => {
            let mut session = engine.session();
            session.select_all_layers();
            success(session.layer_controls())
        }
        Err(response) => response,
    }
}

/// POST /api/layers/clear-all
async fn clear_all_layers(State(state): State<AppState>) -> Response {
    match engine(&state).await {
        Ok(engine) => {
            let mut session = engine.session();
            session.clear_all_layers();
            success(session.layer_controls())
        }
        Err(response) => response,
    }
}

/// POST /api/refresh - Manual refresh; 409 while one is already running
async fn refresh(State(state): State<AppState>) -> Response {
    let engine = match engine(&state).await {
        Ok(engine) => engine,
        Err(response) => return response,
    };

    match engine.refresh_now().await {
        RefreshOutcome::Busy => failure(StatusCode::CONFLICT, "Refresh already in progress"),
        outcome => success(outcome),
    }
}

/// GET /api/last-updated
async fn get_last_updated(State(state): State<AppState>) -> Response {
    match engine(&state).await {
        Ok(engine) => {
            let badge = engine.session().last_updated();
            success(LastUpdatedResponse {
                badge,
                text: badge.to_string(),
            })
        }
        Err(response) => response,
    }
}

/// GET /api/notices - Notices still on screen
async fn get_notices(State(state): State<AppState>) -> Response {
    match engine(&state).await {
        Ok(engine) => {
            let notices: Vec<Notice> = engine.session().active_notices();
            success(notices)
        }
        Err(response) => response,
    }
}

/// GET /api/rows - Stored rows with their ids
async fn list_rows(State(state): State<AppState>) -> Response {
    if let Err(response) = engine(&state).await {
        return response;
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.rows_with_ids()).await {
        Ok(Ok(rows)) => {
            let rows: Vec<StoredRow> = rows.into_iter().map(|(id, row)| StoredRow { id, row }).collect();
            success(rows)
        }
        Ok(Err(e)) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /api/rows - Store a raw row; the change feed refreshes the map
async fn create_row(State(state): State<AppState>, Json(row): Json<RawRow>) -> Response {
    if let Err(response) = engine(&state).await {
        return response;
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.insert_row(&row)).await {
        Ok(Ok(id)) => (StatusCode::CREATED, Json(ApiResponse::ok(id))).into_response(),
        Ok(Err(e)) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// DELETE /api/rows/:id
async fn delete_row(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(response) = engine(&state).await {
        return response;
    }

    let store = state.store.clone();
    let lookup = id.clone();
    match tokio::task::spawn_blocking(move || store.delete_row(&lookup)).await {
        Ok(Ok(true)) => success(id),
        Ok(Ok(false)) => failure(StatusCode::NOT_FOUND, format!("No row with id {}", id)),
        Ok(Err(e)) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/markers", get(get_markers))
        .route("/layers", get(get_layers))
        .route("/layers/select-all", post(select_all_layers))
        .route("/layers/clear-all", post(clear_all_layers))
        .route("/layers/:category", post(set_layer))
        .route("/refresh", post(refresh))
        .route("/last-updated", get(get_last_updated))
        .route("/notices", get(get_notices))
        .route("/rows", get(list_rows).post(create_row))
        .route("/rows/:id", delete(delete_row))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_stderr()?;
    let config = Config::load();

    println!("🌐 Firm Map - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = FirmStore::open(&config.db_path)?;
    println!("✓ Database opened: {:?}", config.db_path);
    let watcher = store.spawn_change_watcher(config.watch_every);

    let state = AppState {
        store,
        gate: PasswordGate::new(config.password.clone()),
        settings: config.session_settings(),
        refresh_every: config.refresh_every,
        live: Arc::new(Mutex::new(None)),
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server_addr))?;

    println!("\n🚀 Server running on http://{}", config.server_addr);
    println!("   API: http://{}/api/markers", config.server_addr);
    println!("\n   Press Ctrl+C to stop\n");

    let served = axum::serve(listener, app).await.context("Server stopped");
    watcher.abort();
    served
}

// ============================================================================
// Tests
// ============================================================================
