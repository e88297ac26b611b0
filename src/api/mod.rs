//! REST query surface and the WebSocket endpoint.
//!
//! A thin layer: reads go straight to storage, writes are bus publishes.
//! Status codes: 200/202 success, 404 unknown id, 422 validation, 500
//! internal.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::events::service::{
    ItemDataChangedEvent, SessionControlAction, SessionControlEvent, StatsControlAction,
    StatsControlEvent,
};
use crate::events::{EventBus, ServiceEvent};
use crate::services::broadcaster::BroadcastService;
use crate::storage::Database;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub broadcaster: Arc<BroadcastService>,
    pub shutdown: watch::Sender<bool>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        warn!("API error: {e:#}");
        Self(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("{what} not found"))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    session_id: Option<i64>,
    player: Option<String>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/players", get(list_players))
        .route("/sessions", get(list_sessions).post(next_session))
        .route("/sessions/:id", get(get_session))
        .route("/maps", get(list_maps))
        .route("/maps/:id", get(get_map))
        .route("/inventory", get(list_inventory))
        .route("/items", get(list_items))
        .route("/items/:item_id", patch(update_item))
        .route("/market/transactions", get(list_market_transactions))
        .route("/stats/reset", post(reset_stats))
        .route("/system/restart", post(restart_system))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_players(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_players()?))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_sessions(page.limit(), page.offset())?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.get_session(id)? {
        Some(session) => Ok(Json(session)),
        None => Err(not_found("session")),
    }
}

/// Close the current session and start the next one.
async fn next_session(State(state): State<AppState>) -> impl IntoResponse {
    state
        .bus
        .publish(ServiceEvent::SessionControl(SessionControlEvent {
            timestamp: crate::events::now(),
            action: SessionControlAction::Next,
            player_name: None,
        }))
        .await;
    StatusCode::ACCEPTED
}

async fn list_maps(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_map_completions(
        page.limit(),
        page.offset(),
        page.session_id,
    )?))
}

async fn get_map(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(completion) = state.db.get_map_completion(id)? else {
        return Err(not_found("map completion"));
    };
    let items = state.db.map_completion_items(id)?;
    let affixes = state.db.map_completion_affixes(id)?;
    Ok(Json(json!({
        "map": completion,
        "items": items,
        "affixes": affixes,
    })))
}

async fn list_inventory(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_inventory(page.player.as_deref())?))
}

async fn list_items(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_items(page.limit(), page.offset())?))
}

#[derive(Debug, Deserialize)]
struct ItemPatch {
    name: Option<String>,
    category: Option<String>,
    rarity: Option<String>,
    price: Option<f64>,
}

/// Administrative item edit. The price book patches its cache from the
/// resulting ITEM_DATA_CHANGED event.
async fn update_item(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
    Json(patch): Json<ItemPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(price) = patch.price {
        if !price.is_finite() || price < 0.0 {
            return Err(ApiError(
                StatusCode::UNPROCESSABLE_ENTITY,
                "price must be a non-negative number".to_string(),
            ));
        }
    }

    let found = state.db.update_item(
        item_id,
        patch.name.as_deref(),
        patch.category.as_deref(),
        patch.rarity.as_deref(),
        patch.price,
    )?;
    if !found {
        return Err(not_found("item"));
    }

    let updated = state.db.get_item(item_id)?.ok_or_else(|| not_found("item"))?;
    state
        .bus
        .publish(ServiceEvent::ItemDataChanged(ItemDataChangedEvent {
            timestamp: crate::events::now(),
            item_id,
            name: updated.name.clone(),
            category: updated.category.clone(),
            price: Some(updated.price),
        }))
        .await;
    Ok(Json(updated))
}

async fn list_market_transactions(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.list_market_transactions(
        page.limit(),
        page.offset(),
        page.session_id,
    )?))
}

async fn reset_stats(State(state): State<AppState>) -> impl IntoResponse {
    state
        .bus
        .publish(ServiceEvent::StatsControl(StatsControlEvent {
            timestamp: crate::events::now(),
            action: StatsControlAction::Restart,
        }))
        .await;
    StatusCode::ACCEPTED
}

async fn restart_system(State(state): State<AppState>) -> impl IntoResponse {
    info!("System restart requested");
    let _ = state.shutdown.send(true);
    StatusCode::ACCEPTED
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump broadcast frames out; inbound text frames are keepalive only and
/// are read and discarded.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (id, mut outbound) = state.broadcaster.register_client();

    loop {
        tokio::select! {
            event = outbound.recv() => {
                match event {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Broadcaster shut down; close cleanly.
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.remove_client(id);
}
