use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use relaybox_infra::store::StoreError;
use relaybox_infra::write_path::WriteError;

pub fn write_error_to_response(err: WriteError) -> axum::response::Response {
    match err {
        WriteError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        WriteError::IdGeneration(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "id_generation_error", e.to_string())
        }
        WriteError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
        err @ WriteError::Store { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", err.to_string())
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("outbox entry {id} not found"),
        ),
        e @ StoreError::IllegalTransition { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        e => json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
