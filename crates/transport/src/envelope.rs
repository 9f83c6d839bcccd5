//! Dashboard API response envelope
//!
//! Every API response uses one of two shapes:
//!
//! ```text
//! { success: true,  data: any|null, message: string|null, meta: {...} }
//! { success: false, error: { code, message, context: {} } }
//! ```

use serde::{Deserialize, Serialize};

use crate::classify::{ApiError, ErrorKind};

/// Decoded response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Structured error carried by a `success: false` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl<T> Envelope<T> {
    /// Unwrap the payload, turning a `success: false` envelope into a typed
    /// error. `status` is the HTTP status the envelope arrived with.
    pub fn into_data(self, status: u16) -> Result<Option<T>, ApiError> {
        if self.success {
            return Ok(self.data);
        }
        let error = match self.error {
            Some(body) => ApiError::new(ErrorKind::from_code(&body.code), body.message)
                .with_code(body.code),
            None => ApiError::new(
                ErrorKind::Unknown,
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ),
        };
        Err(error.with_status(status))
    }
}

/// Build a `success: false` envelope body.
pub fn error_envelope(
    code: &str,
    message: &str,
    context: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": {
            "code": code,
            "message": message,
            "context": context,
        }
    })
}
