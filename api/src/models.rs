//! API Models

use serde::{Deserialize, Serialize, Serializer};
use utoipa::ToSchema;

/// Standard API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

// ============ Payment callbacks ============

/// Provider acknowledgement code
///
/// Serialized as the string `"0"` (stop retrying) or the number `1`
/// (retry), which is what the provider expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Accepted,
    Retry,
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ResultCode::Accepted => serializer.serialize_str("0"),
            ResultCode::Retry => serializer.serialize_u8(1),
        }
    }
}

/// Body returned on every payment callback
#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    #[schema(value_type = String, example = "0")]
    pub result_code: ResultCode,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted(desc: &str) -> Self {
        Self { result_code: ResultCode::Accepted, result_desc: desc.to_string() }
    }

    pub fn retry(desc: &str) -> Self {
        Self { result_code: ResultCode::Retry, result_desc: desc.to_string() }
    }
}
