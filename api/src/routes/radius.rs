//! FreeRADIUS `rest` module endpoints
//!
//! | call | success | refused |
//! |---|---|---|
//! | authorize | 200, `control:`/`reply:` attributes | 401, Reply-Message |
//! | authenticate | 204 | 401, Reply-Message |
//! | accounting | 204 | 404 for an unknown login |
//! | post-auth | 204 | |
//!
//! A missing identity attribute is 400, a store failure 500.

use crate::error::ApiError;
use crate::extract::RadiusBody;
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use ispgate_radius::{AccountingEvent, AccountingOutcome, Decision, Field, PostAuthEvent};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/authorize", post(authorize))
        .route("/authenticate", post(authenticate))
        .route("/accounting", post(accounting))
        .route("/post-auth", post(post_auth))
}

/// Authorize a login and return its profile
#[utoipa::path(
    post,
    path = "/radius/authorize",
    responses(
        (status = 200, description = "Accepted; control and reply attributes"),
        (status = 401, description = "Rejected; reply:Reply-Message"),
        (status = 400, description = "User-Name missing")
    ),
    tag = "radius"
)]
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    RadiusBody(bag): RadiusBody,
) -> Result<Json<Value>, ApiError> {
    let login = bag.require(Field::UserName)?;
    match state.radius.authorizer.authorize(login, Utc::now()).await? {
        Decision::Accept(reply) => Ok(Json(reply.to_json())),
        Decision::Reject(rejection) => Err(ApiError::Rejected(rejection)),
    }
}

/// Check a login's password
#[utoipa::path(
    post,
    path = "/radius/authenticate",
    responses(
        (status = 204, description = "Accepted"),
        (status = 401, description = "Rejected; reply:Reply-Message")
    ),
    tag = "radius"
)]
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    RadiusBody(bag): RadiusBody,
) -> Result<StatusCode, ApiError> {
    let login = bag.require(Field::UserName)?;
    let password = bag.require(Field::Password)?;
    match state.radius.authorizer.authenticate(login, password, Utc::now()).await? {
        Decision::Accept(()) => Ok(StatusCode::NO_CONTENT),
        Decision::Reject(rejection) => Err(ApiError::Rejected(rejection)),
    }
}

/// Record an accounting packet
#[utoipa::path(
    post,
    path = "/radius/accounting",
    responses(
        (status = 204, description = "Recorded"),
        (status = 404, description = "Unknown login"),
        (status = 400, description = "Missing identity or unknown Acct-Status-Type")
    ),
    tag = "radius"
)]
pub async fn accounting(
    State(state): State<Arc<AppState>>,
    RadiusBody(bag): RadiusBody,
) -> Result<StatusCode, ApiError> {
    let event = AccountingEvent::from_bag(&bag)?;
    match state.radius.accounting.ingest(event, Utc::now()).await? {
        AccountingOutcome::Recorded { .. } => Ok(StatusCode::NO_CONTENT),
        AccountingOutcome::NasEvent => {
            info!(nas = ?bag.get(Field::NasIpAddress), "NAS accounting event");
            Ok(StatusCode::NO_CONTENT)
        }
        AccountingOutcome::UnknownSubscriber => Err(ApiError::UnknownSubscriber),
    }
}

/// Append to the post-auth audit log
#[utoipa::path(
    post,
    path = "/radius/post-auth",
    responses((status = 204, description = "Recorded")),
    tag = "radius"
)]
pub async fn post_auth(
    State(state): State<Arc<AppState>>,
    RadiusBody(bag): RadiusBody,
) -> Result<StatusCode, ApiError> {
    let event = PostAuthEvent::from_bag(&bag)?;
    state.radius.post_auth.record(event, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}
