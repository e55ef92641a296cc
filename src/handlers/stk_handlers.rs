// handlers/stk_handlers.rs
use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, State},
    http::{header, HeaderMap},
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::middleware::auth::Claims;
use crate::models::{
    GetStkTransactionRequest, InitiateStkRequest, InitiateStkResponse, ListStkTransactionsRequest,
    ListStkTransactionsResponse, ProcessStkTransactionRequest, PublishStkTransactionRequest,
    StkCallbackPayload, StkTransaction,
};
use crate::state::AppState;

pub async fn initiate_stk_push(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<InitiateStkRequest>,
) -> Result<Json<InitiateStkResponse>> {
    info!(actor = %claims.sub, initiator = %payload.initiator_id, "C2B: initiate request");

    let initiated = state.stk.initiate(payload).await?;
    Ok(Json(initiated.response))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<i64>,
) -> Result<Json<StkTransaction>> {
    let request = GetStkTransactionRequest {
        transaction_id,
        ..Default::default()
    };
    Ok(Json(state.stk.get(&request).await?))
}

pub async fn get_transaction_by_receipt(
    State(state): State<AppState>,
    Path(mpesa_receipt_id): Path<String>,
) -> Result<Json<StkTransaction>> {
    let request = GetStkTransactionRequest {
        mpesa_receipt_id,
        ..Default::default()
    };
    Ok(Json(state.stk.get(&request).await?))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<ListStkTransactionsRequest>,
) -> Result<Json<ListStkTransactionsResponse>> {
    Ok(Json(state.stk.list(&claims, &payload).await?))
}

pub async fn process_transaction(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<ProcessStkTransactionRequest>,
) -> Result<Json<StkTransaction>> {
    Ok(Json(state.stk.process(&claims, &payload).await?))
}

pub async fn publish_transaction(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<PublishStkTransactionRequest>,
) -> Result<Json<Value>> {
    let published = state.stk.publish(&claims, payload).await?;
    Ok(Json(json!({ "success": true, "published": published })))
}

/// Webhook the network calls with the outcome of a push.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    if !content_type.starts_with("application/json") {
        warn!(content_type = %content_type, "rejecting callback with unexpected content type");
        return Err(AppError::invalid_data("callback content type must be application/json"));
    }

    let payload: StkCallbackPayload = serde_json::from_slice(&body)?;
    let outcome = state.stk.ingest_callback(payload).await?;

    info!(
        transaction_id = outcome.transaction.id,
        published = outcome.published,
        "Received M-Pesa callback"
    );

    Ok(Json(json!({
        "ResultCode": 0,
        "ResultDesc": "Accepted"
    })))
}
