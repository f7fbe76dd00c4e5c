use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use utoipa::ToSchema;

use crate::store::StoreError;

/// Wire shape for every error body: `{error, code, details?}`
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid state for update: {0}")]
    InvalidStateForUpdate(String),

    #[error("Quote mismatch: {0}")]
    QuoteMismatch(String),

    #[error("Guest information required: {0}")]
    GuestRequired(String),

    #[error("Idempotency-Key header is required for this endpoint")]
    IdempotencyKeyRequired,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("PMS client error ({status}): {message}")]
    PmsClient { status: u16, message: String },

    #[error("PMS server error: {0}")]
    PmsServer(String),

    #[error("PMS request timed out: {0}")]
    PmsTimeout(String),

    #[error("PSP error: {0}")]
    Psp(String),

    #[error("Webhook signature verification failed: {0}")]
    PspSignature(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut details = serde_json::Map::new();
        details.insert(field.to_string(), Value::String(message.clone()));
        ServiceError::Validation {
            message,
            details: Some(Value::Object(details)),
        }
    }

    /// Stable machine-readable code for the error body
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation { .. } => "VALIDATION",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidTransition(_) => "INVALID_TRANSITION",
            ServiceError::InvalidStateForUpdate(_) => "INVALID_STATE_FOR_UPDATE",
            ServiceError::QuoteMismatch(_) => "QUOTE_MISMATCH",
            ServiceError::GuestRequired(_) => "GUEST_REQUIRED",
            ServiceError::IdempotencyKeyRequired => "IDEMPOTENCY_KEY_REQUIRED",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::PmsClient { .. } => "PMS_CLIENT_ERROR",
            ServiceError::PmsServer(_) => "PMS_SERVER_ERROR",
            ServiceError::PmsTimeout(_) => "PMS_TIMEOUT",
            ServiceError::Psp(_) => "PSP_ERROR",
            ServiceError::PspSignature(_) => "PSP_SIGNATURE",
            ServiceError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            ServiceError::Store(_) => "INTERNAL",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation { .. } => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidTransition(_) => StatusCode::CONFLICT,
            ServiceError::InvalidStateForUpdate(_) => StatusCode::CONFLICT,
            ServiceError::QuoteMismatch(_) => StatusCode::CONFLICT,
            ServiceError::GuestRequired(_) => StatusCode::BAD_REQUEST,
            ServiceError::IdempotencyKeyRequired => StatusCode::BAD_REQUEST,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            // 4xx from the PMS passes through with its original status
            ServiceError::PmsClient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ServiceError::PmsServer(_) => StatusCode::BAD_GATEWAY,
            ServiceError::PmsTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Psp(_) => StatusCode::BAD_GATEWAY,
            ServiceError::PspSignature(_) => StatusCode::BAD_REQUEST,
            ServiceError::UnsupportedCurrency(_) => StatusCode::BAD_REQUEST,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        let details = serde_json::to_value(&err).ok();
        ServiceError::Validation {
            message: err.to_string(),
            details,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Store and internal failures get a generic message; the detail goes
        // to the log, not the client.
        let (message, details) = match &self {
            ServiceError::Store(e) => {
                error!("store error: {}", e);
                ("Internal server error".to_string(), None)
            }
            ServiceError::Internal(e) => {
                error!("internal error: {}", e);
                ("Internal server error".to_string(), None)
            }
            ServiceError::Validation { message, details } => {
                (message.clone(), details.clone())
            }
            other => (other.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}
