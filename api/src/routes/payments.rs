//! Payment initiation and transaction queries

use crate::error::ApiError;
use crate::models::{ApiResponse, ErrorResponse};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ispgate_billing::{PaymentRequest, SubscriptionPayment};
use ispgate_common::{
    PaymentTransaction, SubscriberId, TenantId, TransactionFilter, TransactionId, TransactionKind, TransactionStatus,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tenants/:tenant/payments", post(initiate_payment))
        .route("/api/tenants/:tenant/subscription-payments", post(initiate_subscription_payment))
        .route("/api/tenants/:tenant/mpesa/register-urls", post(register_urls))
        .route("/api/tenants/:tenant/mpesa/balance", post(check_balance))
        .route("/api/transactions", get(list_transactions))
        .route("/api/transactions/:id", get(get_transaction))
        .route("/api/transactions/:id/cancel", post(cancel_transaction))
}

type Created = (StatusCode, Json<ApiResponse<PaymentTransaction>>);

/// Start a C2B, B2C or B2B payment
#[utoipa::path(
    post,
    path = "/api/tenants/{tenant}/payments",
    params(("tenant" = Uuid, Path,)),
    responses(
        (status = 201, description = "Pending transaction"),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 502, description = "Provider refused", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<Uuid>,
    Json(request): Json<PaymentRequest>,
) -> Result<Created, ApiError> {
    let tx = state
        .payments
        .initiate(TenantId::from_uuid(tenant), request, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(tx))))
}

/// Start a C2B payment that renews a subscription on completion
#[utoipa::path(
    post,
    path = "/api/tenants/{tenant}/subscription-payments",
    params(("tenant" = Uuid, Path,)),
    responses(
        (status = 201, description = "Pending transaction"),
        (status = 404, description = "Unknown subscriber or package", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn initiate_subscription_payment(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<Uuid>,
    Json(payment): Json<SubscriptionPayment>,
) -> Result<Created, ApiError> {
    let tx = state
        .payments
        .initiate_subscription(TenantId::from_uuid(tenant), payment, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(tx))))
}

/// Register the tenant's callback URLs with the provider
#[utoipa::path(
    post,
    path = "/api/tenants/{tenant}/mpesa/register-urls",
    params(("tenant" = Uuid, Path,)),
    responses((status = 200, description = "Provider response")),
    tag = "payments"
)]
pub async fn register_urls(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let response = state.payments.register_urls(TenantId::from_uuid(tenant)).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Request the tenant's account balance
#[utoipa::path(
    post,
    path = "/api/tenants/{tenant}/mpesa/balance",
    params(("tenant" = Uuid, Path,)),
    responses((status = 200, description = "Request accepted; balance follows on the result callback")),
    tag = "payments"
)]
pub async fn check_balance(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let response = state.payments.check_balance(TenantId::from_uuid(tenant)).await?;
    Ok(Json(ApiResponse::success(response)))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TransactionQuery {
    pub tenant: Option<Uuid>,
    pub subscriber: Option<Uuid>,
    /// `c2b`, `b2c` or `b2b`
    #[param(value_type = Option<String>)]
    pub kind: Option<TransactionKind>,
    /// `pending`, `validated`, `completed`, `failed`, `timeout` or `cancelled`
    #[param(value_type = Option<String>)]
    pub status: Option<TransactionStatus>,
    pub reference: Option<String>,
    pub phone: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl From<TransactionQuery> for TransactionFilter {
    fn from(q: TransactionQuery) -> Self {
        TransactionFilter {
            tenant: q.tenant.map(TenantId::from_uuid),
            subscriber: q.subscriber.map(SubscriberId::from_uuid),
            kind: q.kind,
            status: q.status,
            reference: q.reference,
            counterparty: q.phone,
            created_from: q.from,
            created_to: q.to,
        }
    }
}

/// List transactions, newest first
#[utoipa::path(
    get,
    path = "/api/transactions",
    params(TransactionQuery),
    responses((status = 200, description = "Matching transactions")),
    tag = "payments"
)]
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<ApiResponse<Vec<PaymentTransaction>>>, ApiError> {
    let found = state.payments.list(&query.into()).await?;
    Ok(Json(ApiResponse::success(found)))
}

/// Get one transaction
#[utoipa::path(
    get,
    path = "/api/transactions/{id}",
    params(("id" = Uuid, Path,)),
    responses(
        (status = 200, description = "Transaction"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentTransaction>>, ApiError> {
    let id = TransactionId::from_uuid(id);
    let tx = state
        .payments
        .find(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("transaction {} not found", id)))?;
    Ok(Json(ApiResponse::success(tx)))
}

/// Cancel a transaction still awaiting the provider
#[utoipa::path(
    post,
    path = "/api/transactions/{id}/cancel",
    params(("id" = Uuid, Path,)),
    responses(
        (status = 200, description = "Cancelled transaction"),
        (status = 400, description = "Transaction is not open", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn cancel_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentTransaction>>, ApiError> {
    let tx = state.payments.cancel(TransactionId::from_uuid(id), Utc::now()).await?;
    Ok(Json(ApiResponse::success(tx)))
}
