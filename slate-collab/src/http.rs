//! HTTP side of the relay contract, for pollers.
//!
//! - `GET  /sessions/:key/snapshot` → current `DocumentSnapshot` as JSON
//! - `POST /sessions/:key/events`   → apply a `RelayedEvent`, `202 Accepted`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use slate_core::DocumentSnapshot;

use crate::protocol::{ProtocolError, RelayedEvent};
use crate::relay::RelayHub;

pub enum ApiError {
    Rejected(String),
    Internal(String),
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Rejected(msg) => ApiError::Rejected(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Rejected(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/sessions/:key/snapshot", get(get_snapshot))
        .route("/sessions/:key/events", post(post_event))
        .with_state(hub)
}

async fn get_snapshot(
    State(hub): State<Arc<RelayHub>>,
    Path(key): Path<String>,
) -> Result<Json<DocumentSnapshot>, ApiError> {
    if key.is_empty() {
        return Err(ApiError::Rejected("empty session key".to_string()));
    }
    Ok(Json(hub.snapshot(&key).await))
}

async fn post_event(
    State(hub): State<Arc<RelayHub>>,
    Path(key): Path<String>,
    Json(event): Json<RelayedEvent>,
) -> Result<StatusCode, ApiError> {
    match hub.apply(&key, &event).await {
        Ok(_) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            log::warn!("Rejected {} for {key} over HTTP: {e}", event.event.name());
            Err(e.into())
        }
    }
}
