//! Operator endpoints for the outbox: counts, inspection and requeue.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use relaybox_events::OutboxId;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/outbox/stats", get(outbox_stats))
        .route("/outbox/:id", get(get_outbox_entry))
        .route("/outbox/:id/requeue", post(requeue_outbox_entry))
}

fn parse_id(raw: &str) -> Result<OutboxId, axum::response::Response> {
    raw.parse::<i64>()
        .map(OutboxId::new)
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid outbox id"))
}

pub async fn outbox_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.admin().counts().await {
        Ok(counts) => Json(json!({
            "outbox": counts,
            "total": counts.total(),
            "dispatcher": services.dispatcher_stats(),
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_outbox_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.admin().get(id).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("outbox entry {id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Move a `failed` entry back to `pending`; anything else is a conflict.
pub async fn requeue_outbox_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.admin().requeue_failed(id).await {
        Ok(entry) => {
            tracing::info!(outbox_id = %id, "failed outbox entry requeued");
            Json(entry).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
