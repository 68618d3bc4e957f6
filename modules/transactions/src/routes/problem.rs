//! Problem details (`application/problem+json`) error bodies
//!
//! Internal error text never reaches the client: server errors carry a fixed
//! detail plus the trace id to correlate with logs.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const PROBLEM_JSON: &str = "application/problem+json";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    pub status: u16,
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub detail: String,
    pub instance: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ProblemDetails {
    pub fn new(
        status: StatusCode,
        problem_type: &str,
        title: &str,
        detail: impl Into<String>,
        instance: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            status: status.as_u16(),
            problem_type: problem_type.to_string(),
            title: title.to_string(),
            detail: detail.into(),
            instance: instance.into(),
            trace_id: trace_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn internal(instance: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "An error occurred",
            "An unexpected error occurred while processing your request.",
            instance,
            trace_id,
        )
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut res = (status, Json(self)).into_response();
        res.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        res
    }
}
