//! Mobile-money callback endpoints
//!
//! The provider retries any callback not answered with ResultCode `"0"`, so
//! everything that parses is acknowledged, including payments that could not
//! be applied and internal failures (both are logged and published by the
//! reconciler). Only an unreadable body asks for a retry.

use crate::models::CallbackAck;
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use ispgate_billing::{CallbackKind, CallbackPayload};
use ispgate_common::TenantId;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use utoipa::IntoParams;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/validation", post(validation))
        .route("/confirmation", post(confirmation))
        .route("/result", post(result))
        .route("/timeout", post(timeout))
}

/// `?tenant=` carried by the callback URLs we register
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackQuery {
    /// Routes callbacks that carry no shortcode
    #[serde(default)]
    pub tenant: Option<String>,
}

impl CallbackQuery {
    fn tenant_hint(&self) -> Option<TenantId> {
        self.tenant.as_deref().and_then(|raw| TenantId::parse(raw).ok())
    }
}

async fn acknowledge(state: &AppState, kind: CallbackKind, query: &CallbackQuery, body: &[u8]) -> CallbackAck {
    let raw = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(?kind, error = %e, "unreadable callback body");
            return CallbackAck::retry("Invalid JSON payload");
        }
    };
    let payload = match CallbackPayload::from_json(raw) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(?kind, error = %e, "unusable callback body");
            return CallbackAck::retry("Invalid payload");
        }
    };

    state
        .reconciler
        .handle(kind, query.tenant_hint(), &payload, Utc::now())
        .await;
    CallbackAck::accepted(kind.ack_description())
}

/// C2B validation
#[utoipa::path(
    post,
    path = "/api/mpesa/validation",
    params(CallbackQuery),
    responses((status = 200, description = "Acknowledged", body = CallbackAck)),
    tag = "mpesa"
)]
pub async fn validation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Json<CallbackAck> {
    Json(acknowledge(&state, CallbackKind::Validation, &query, &body).await)
}

/// C2B confirmation
#[utoipa::path(
    post,
    path = "/api/mpesa/confirmation",
    params(CallbackQuery),
    responses((status = 200, description = "Acknowledged", body = CallbackAck)),
    tag = "mpesa"
)]
pub async fn confirmation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Json<CallbackAck> {
    Json(acknowledge(&state, CallbackKind::Confirmation, &query, &body).await)
}

/// Asynchronous result of a B2C, B2B or balance request
#[utoipa::path(
    post,
    path = "/api/mpesa/result",
    params(CallbackQuery),
    responses((status = 200, description = "Acknowledged", body = CallbackAck)),
    tag = "mpesa"
)]
pub async fn result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Json<CallbackAck> {
    Json(acknowledge(&state, CallbackKind::Result, &query, &body).await)
}

/// Provider queue timeout
#[utoipa::path(
    post,
    path = "/api/mpesa/timeout",
    params(CallbackQuery),
    responses((status = 200, description = "Acknowledged", body = CallbackAck)),
    tag = "mpesa"
)]
pub async fn timeout(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Json<CallbackAck> {
    Json(acknowledge(&state, CallbackKind::Timeout, &query, &body).await)
}
