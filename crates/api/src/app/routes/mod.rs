use axum::Router;

pub mod admin;
pub mod products;
pub mod system;

/// Router for all API endpoints except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/products", products::router())
        .nest("/admin", admin::router())
}
