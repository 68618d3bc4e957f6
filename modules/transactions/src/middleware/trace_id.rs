//! Correlation id for every HTTP request
//!
//! Taken from the incoming `x-trace-id` header when present, generated
//! otherwise. Echoed on the response and embedded in problem bodies.

use axum::{
    body::Body,
    http::{Extensions, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Request extension holding the correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

pub async fn trace_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let trace_id = req
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let span = tracing::info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        trace_id = %trace_id
    );

    let mut res = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        res.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    res
}

pub fn trace_id_from_extensions(ext: &Extensions) -> String {
    ext.get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "missing-trace-id".to_string())
}
