//! RADIUS request body extractor
//!
//! FreeRADIUS' rest module posts either JSON or a urlencoded form depending
//! on its `body` setting. Both end up as one [`AttributeBag`].

use crate::error::ApiError;
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::header::CONTENT_TYPE;
use axum::Form;
use ispgate_radius::AttributeBag;

/// Normalized RADIUS attributes of the request
#[derive(Debug)]
pub struct RadiusBody(pub AttributeBag);

#[async_trait]
impl<S> FromRequest<S> for RadiusBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            return Ok(RadiusBody(AttributeBag::from_pairs(pairs)));
        }

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))?;
        Ok(RadiusBody(AttributeBag::from_json(&value)?))
    }
}
