use std::{future::Future, time::Duration};

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Failures surfaced to callers of the broker API.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection upgrade failed")]
    Upgrade(#[source] TransportError),

    #[error("write to connection {connection_id} failed")]
    Write {
        connection_id: Uuid,
        #[source]
        source: TransportError,
    },

    #[error("failed to encode socket event")]
    Encode(#[from] serde_json::Error),

    #[error("connection {0} is not registered")]
    ConnectionNotFound(Uuid),

    #[error("broker actor loop is not running")]
    Unavailable,

    #[error("broker actor loop restarted before replying")]
    Restarted,

    #[error("broker did not reply within {0:?}")]
    Timeout(Duration),
}

/// Inbound frame that could not be turned into a socket event.
///
/// Only ever logged by the reader task; the connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("malformed socket event: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    BrokerUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::BrokerUnavailable => "BROKER_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::BrokerUnavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::NotFound => "requested resource not found",
            Self::BrokerUnavailable => "connection broker is temporarily unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

/// JSON error body returned by the HTTP surface.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        match &error {
            BrokerError::ConnectionNotFound(connection_id) => {
                Self::new(ErrorCode::NotFound, error.to_string())
                    .with_details(json!({ "connection_id": connection_id }))
            }
            BrokerError::Encode(_) | BrokerError::Upgrade(_) => {
                Self::new(ErrorCode::ValidationFailed, error.to_string())
            }
            BrokerError::Unavailable | BrokerError::Restarted | BrokerError::Timeout(_) => {
                Self::new(ErrorCode::BrokerUnavailable, error.to_string())
            }
            BrokerError::Write { .. } => Self::from_code(ErrorCode::InternalError),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use serde_json::Value;
    use uuid::Uuid;

    use super::{with_request_id_scope, ApiError, BrokerError, ErrorCode};

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn api_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-scoped-123")
        );
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::AuthForbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
        assert_eq!(parsed["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn missing_connection_maps_to_not_found_with_details() {
        let connection_id = Uuid::new_v4();
        let response = ApiError::from(BrokerError::ConnectionNotFound(connection_id)).into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["details"]["connection_id"], connection_id.to_string());
    }

    #[test]
    fn loop_failures_are_retryable_unavailability() {
        for error in [
            BrokerError::Unavailable,
            BrokerError::Restarted,
            BrokerError::Timeout(Duration::from_secs(1)),
        ] {
            let api_error = ApiError::from(error);
            assert_eq!(api_error.code(), ErrorCode::BrokerUnavailable);
            assert!(api_error.code().retryable());
            assert_eq!(api_error.code().status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
