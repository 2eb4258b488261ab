//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::manage::Action;
use crate::signature::{SignatureKey, SignatureStatus};
use crate::storage::SignatureFilter;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/signatures", get(list_signatures))
        .route("/signatures/{key}", get(signature_details))
        .route("/signatures/{key}/{action}", post(apply_action))
        .route("/budget", get(budget))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn parse_key(raw: &str) -> Result<SignatureKey, ApiError> {
    raw.parse().map_err(|e: crate::signature::InvalidKey| ApiError::BadRequest(e.to_string()))
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    service: Option<String>,
    limit: Option<usize>,
}

async fn list_signatures(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SignatureStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let filter = SignatureFilter {
        status,
        service: query.service,
        limit: query.limit,
    };
    let signatures = state.manage.list(&filter)?;
    Ok(Json(json!({
        "data": signatures,
        "meta": { "total": signatures.len(), "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn signature_details(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let key = parse_key(&key)?;
    let signature = state.manage.details(&key)?;
    Ok(Json(json!({ "data": signature, "meta": meta() })))
}

async fn apply_action(
    State(state): State<AppState>,
    Path((key, action)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let action: Action = action.parse().map_err(ApiError::NotFound)?;
    let key = parse_key(&key)?;
    let transition = state.manage.apply(&key, action)?;
    Ok(Json(json!({
        "data": transition.signature,
        "meta": {
            "action": action.as_str(),
            "changed": transition.changed,
            "timestamp": Utc::now().to_rfc3339()
        }
    })))
}

async fn budget(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match &state.budget {
        Some(ledger) => {
            let snapshot = ledger.snapshot(Utc::now()).await;
            Ok(Json(json!({ "data": snapshot, "meta": meta() })))
        }
        None => Err(ApiError::NotFound("budget ledger not running".to_string())),
    }
}
