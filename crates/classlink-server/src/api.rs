use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use classlink_shared::protocol::{WireCall, WireMessage};
use classlink_store::Database;

use crate::attachments::AttachmentStore;
use crate::auth::{bearer_from_headers, Authenticator, Identity};
use crate::calls::{to_wire_call, CallSignaling};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::pipeline::{to_wire, MessagePipeline};
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::roster::RosterService;

/// The durable store handle.  Every mutation under the lock is a single
/// SQL statement or explicit transaction, which is what makes the
/// compare-and-set and set-add/set-remove primitives atomic.
pub type SharedStore = Arc<Mutex<Database>>;

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub pipeline: Arc<MessagePipeline>,
    pub calls: Arc<CallSignaling>,
    pub roster: RosterService,
    pub attachments: Arc<AttachmentStore>,
    pub authenticator: Authenticator,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(crate::ws::ws_handler))
        .route("/api/messages", get(list_messages))
        .route("/api/calls", get(list_calls))
        .route("/attachments/{id}", get(download_attachment))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<WireMessage>,
}

#[derive(Serialize)]
struct CallsResponse {
    calls: Vec<WireCall>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Resolve the request's bearer credential or refuse it.
async fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Identity, ApiError> {
    let token = bearer_from_headers(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
    Ok(state.authenticator.authenticate(&token).await?)
}

/// Read-only history: every message the current user sent or received.
async fn list_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let identity = authenticate(&headers, &state).await?;

    let messages = state
        .store
        .lock()
        .await
        .messages_for_user(identity.user_id)?;

    Ok(Json(MessagesResponse {
        messages: messages.iter().map(to_wire).collect(),
    }))
}

/// Read-only history: every call the current user took part in.
async fn list_calls(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<CallsResponse>, ApiError> {
    let identity = authenticate(&headers, &state).await?;

    let calls = state.store.lock().await.calls_for_user(identity.user_id)?;

    Ok(Json(CallsResponse {
        calls: calls.iter().map(to_wire_call).collect(),
    }))
}

/// Serve an attachment blob back.  Ids are unguessable UUIDs handed out
/// by the pipeline.
async fn download_attachment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ApiError> {
    let data = state.attachments.get_blob(id).await?;
    Ok(data)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
