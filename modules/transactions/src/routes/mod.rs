//! HTTP API

pub mod problem;
pub mod transactions;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use crate::health::{health, ready};
use crate::middleware::trace_id::trace_id_middleware;

/// Shared state for every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub pool: PgPool,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route("/api/transactions", post(transactions::create_transaction))
        .route("/api/transactions/{id}", get(transactions::get_transaction))
        .with_state(state)
        .layer(middleware::from_fn(trace_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}
