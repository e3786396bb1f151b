//! API error types and helpers.
//!
//! # Purpose
//! Turns a [`ConsoleError`] into a status code and a `{code, message,
//! request_id}` body. The code is the error kind's stable name, so clients can
//! tell `stale_row` from `busy` even though both are 409.
//!
//! # Security considerations
//! - The captured `detail` (driver text, crypto failures) is logged here and
//!   never copied into the body.
use crate::api::types::ErrorResponse;
use crate::error::{ConsoleError, ErrorKind};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn from_console(err: ConsoleError, request_id: Option<&str>) -> Self {
        let status = status_for(err.kind);
        match err.kind {
            ErrorKind::Internal | ErrorKind::BackendUnavailable => {
                tracing::error!(
                    code = err.kind.code(),
                    detail = ?err.detail,
                    request_id,
                    "request failed"
                );
            }
            ErrorKind::BackendDenied => {
                tracing::warn!(detail = ?err.detail, request_id, "backend refused operation");
            }
            _ => {
                tracing::debug!(code = err.kind.code(), message = %err.message, request_id, "request rejected");
            }
        }
        Self {
            status,
            body: ErrorResponse {
                code: err.kind.code().to_string(),
                message: err.message,
                request_id: request_id.map(str::to_string),
            },
        }
    }

    pub fn is_auth(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::GateDenied => StatusCode::BAD_REQUEST,
        ErrorKind::Auth | ErrorKind::NoResources => StatusCode::UNAUTHORIZED,
        ErrorKind::BackendDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::StaleRow | ErrorKind::Busy | ErrorKind::Expired => {
            StatusCode::CONFLICT
        }
        ErrorKind::BackendUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::Canceled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build a 500 without a console error behind it.
pub fn api_internal_message(message: &str, request_id: Option<&str>) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            code: ErrorKind::Internal.code().to_string(),
            message: message.to_string(),
            request_id: request_id.map(str::to_string),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;

    #[test]
    fn kinds_map_to_statuses() {
        let cases = [
            (ErrorKind::Validation, StatusCode::BAD_REQUEST),
            (ErrorKind::GateDenied, StatusCode::BAD_REQUEST),
            (ErrorKind::Auth, StatusCode::UNAUTHORIZED),
            (ErrorKind::NoResources, StatusCode::UNAUTHORIZED),
            (ErrorKind::BackendDenied, StatusCode::FORBIDDEN),
            (ErrorKind::NotFound, StatusCode::NOT_FOUND),
            (ErrorKind::StaleRow, StatusCode::CONFLICT),
            (ErrorKind::Busy, StatusCode::CONFLICT),
            (ErrorKind::Expired, StatusCode::CONFLICT),
            (ErrorKind::BackendUnavailable, StatusCode::BAD_GATEWAY),
            (ErrorKind::Canceled, StatusCode::REQUEST_TIMEOUT),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            assert_eq!(status_for(kind), status, "{kind:?}");
        }
    }

    #[test]
    fn detail_stays_out_of_the_body() {
        let err: ConsoleError = BackendError::Query("relation \"secret\" does not exist".into()).into();
        let api = ApiError::from_console(err, Some("req-1"));
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.body.code, "backend_unavailable");
        assert!(!api.body.message.contains("secret"));
        assert_eq!(api.body.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn conflict_family_keeps_distinct_codes() {
        let stale = ApiError::from_console(ConsoleError::new(ErrorKind::StaleRow, "gone"), None);
        let busy = ApiError::from_console(ConsoleError::busy("committing"), None);
        assert_eq!(stale.status, busy.status);
        assert_ne!(stale.body.code, busy.body.code);
    }
}
