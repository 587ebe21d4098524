use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use relaybox_products::CreateProduct;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/", post(create_product))
}

/// Create a product and its `product_created` outbox entry atomically.
pub async fn create_product(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<CreateProduct>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    match services.writer().create_product(request).await {
        Ok(product) => (StatusCode::CREATED, Json(product)).into_response(),
        Err(e) => {
            if !e.is_client_error() {
                tracing::error!(error = %e, "product creation failed");
            }
            errors::write_error_to_response(e)
        }
    }
}
