//! Transaction API Routes
//!
//! - `POST /api/transactions`: record a transfer and enqueue its message
//! - `GET /api/transactions/{id}`: read a transfer and its status

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{Extensions, StatusCode, Uri},
    Json,
};
use uuid::Uuid;

use super::problem::ProblemDetails;
use super::AppState;
use crate::contracts::CreateTransactionRequest;
use crate::middleware::trace_id::trace_id_from_extensions;
use crate::models::Transaction;
use crate::services::transaction_service::{self, TransactionError};

/// Map service errors to problem responses
fn map_error(error: TransactionError, instance: &str, trace_id: &str) -> ProblemDetails {
    match error {
        TransactionError::Validation(e) => ProblemDetails::new(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            "Invalid Argument",
            e.to_string(),
            instance,
            trace_id,
        ),
        TransactionError::Database(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Database error");
            ProblemDetails::internal(instance, trace_id) // Don't leak internal details
        }
        TransactionError::Serialization(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Outbox payload serialization failed");
            ProblemDetails::internal(instance, trace_id)
        }
    }
}

/// Handler for POST /api/transactions
///
/// Records a Pending transaction together with its outbox row. The message
/// reaches the broker asynchronously through the relay.
pub async fn create_transaction(
    State(state): State<AppState>,
    uri: Uri,
    extensions: Extensions,
    payload: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Transaction>), ProblemDetails> {
    let trace_id = trace_id_from_extensions(&extensions);
    let instance = uri.path();

    let Json(request) = payload.map_err(|rejection| {
        ProblemDetails::new(
            rejection.status(),
            "InvalidRequestBody",
            "Invalid Argument",
            rejection.body_text(),
            instance,
            &trace_id,
        )
    })?;

    let (transaction, _outbox) = transaction_service::create_and_enqueue(&state.pool, &request)
        .await
        .map_err(|e| map_error(e, instance, &trace_id))?;

    Ok((StatusCode::CREATED, Json(transaction)))
}

/// Handler for GET /api/transactions/{id}
pub async fn get_transaction(
    State(state): State<AppState>,
    uri: Uri,
    extensions: Extensions,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Transaction>, ProblemDetails> {
    let trace_id = trace_id_from_extensions(&extensions);
    let instance = uri.path();

    let Path(id) = id.map_err(|rejection| {
        ProblemDetails::new(
            StatusCode::BAD_REQUEST,
            "InvalidTransactionId",
            "Invalid Argument",
            rejection.body_text(),
            instance,
            &trace_id,
        )
    })?;

    match transaction_service::get_transaction(&state.pool, id).await {
        Ok(Some(transaction)) => Ok(Json(transaction)),
        Ok(None) => Err(ProblemDetails::new(
            StatusCode::NOT_FOUND,
            "TransactionNotFound",
            "Transaction Not Found",
            format!("Transaction {} not found", id),
            instance,
            &trace_id,
        )),
        Err(e) => Err(map_error(e, instance, &trace_id)),
    }
}
