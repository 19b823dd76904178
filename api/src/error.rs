//! HTTP error mapping

use crate::models::ApiResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ispgate_billing::{BillingError, GatewayError};
use ispgate_radius::{RadiusError, Rejection};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Access refused; FreeRADIUS turns 401 into Access-Reject
    #[error("access rejected: {}", .0.message())]
    Rejected(Rejection),

    /// Accounting for a login that does not exist
    #[error("unknown subscriber")]
    UnknownSubscriber,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Provider refused or was unreachable
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl From<RadiusError> for ApiError {
    fn from(e: RadiusError) -> Self {
        if e.is_client_error() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match &e {
            BillingError::TenantNotFound(_)
            | BillingError::SubscriberNotFound(_)
            | BillingError::PackageNotFound(_) => ApiError::NotFound(e.to_string()),
            BillingError::Gateway(GatewayError::MissingCredential(_)) => ApiError::BadRequest(e.to_string()),
            BillingError::Gateway(_) => ApiError::Upstream(e.to_string()),
            _ if e.is_client_error() => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Rejected(_) => StatusCode::UNAUTHORIZED,
            ApiError::UnknownSubscriber | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Rejected(_) => "rejected",
            ApiError::UnknownSubscriber => "unknown_subscriber",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::Rejected(rejection) => (status, Json(rejection.to_json())).into_response(),
            ApiError::UnknownSubscriber => (status, Json(Rejection::LoginInvalid.to_json())).into_response(),
            other => {
                if status.is_server_error() {
                    error!(%status, error = %other, "request failed");
                }
                let body: ApiResponse<()> = ApiResponse::error(other.code(), &other.to_string());
                (status, Json(body)).into_response()
            }
        }
    }
}
