use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// Liveness: the process is up and serving HTTP
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "transactions-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness: the database answers a trivial query
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "database": "up" })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "database": "down" })),
            )
        }
    }
}
