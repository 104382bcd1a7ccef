//! HTTP error mapping for the control API.

use agentplane_core::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Errors a handler can surface, translated to status codes per the error
/// taxonomy
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    /// Path user does not match the credential-bound user
    AccessDenied,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::AccessDenied => (StatusCode::FORBIDDEN, "ACCESS_DENIED"),
            ApiError::Core(e) => match e {
                Error::UserNotFound(_) => (StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
                Error::ProjectNotFound(_) => (StatusCode::NOT_FOUND, "PROJECT_NOT_FOUND"),
                Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
                Error::ExtensionNotFound(_) => (StatusCode::NOT_FOUND, "EXTENSION_NOT_FOUND"),
                Error::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
                Error::UnknownSetting(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_SETTING"),
                Error::ProjectNotActive(_) => (StatusCode::BAD_REQUEST, "PROJECT_NOT_ACTIVE"),
                Error::ReadinessTimeout(_, _) => {
                    (StatusCode::GATEWAY_TIMEOUT, "READINESS_TIMEOUT")
                }
                Error::CloneFailed(_) => (StatusCode::BAD_GATEWAY, "CLONE_FAILED"),
                Error::Orchestrator(_) => (StatusCode::BAD_GATEWAY, "ORCHESTRATOR_ERROR"),
                Error::StorageUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
                }
                Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
                // Client went away; 499 in the nginx tradition
                Error::Cancelled(_) => (
                    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
                    "CANCELLED",
                ),
                Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::AccessDenied => "Access denied".to_string(),
            ApiError::Core(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = Json(ErrorBody {
            error: self.message(),
            code,
        });
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Core(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::ProjectNotFound("p".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("p".into()), StatusCode::CONFLICT),
            (Error::UnknownSetting("k".into()), StatusCode::BAD_REQUEST),
            (Error::ProjectNotActive("p".into()), StatusCode::BAD_REQUEST),
            (
                Error::ReadinessTimeout("p".into(), 120),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (Error::Orchestrator("x".into()), StatusCode::BAD_GATEWAY),
            (
                Error::StorageUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Upstream("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (error, expected) in cases {
            let (status, _) = ApiError::Core(error).status_and_code();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_cancelled_maps_to_client_closed_request() {
        let (status, code) = ApiError::Core(Error::Cancelled("bye".into())).status_and_code();
        assert_eq!(status.as_u16(), 499);
        assert_eq!(code, "CANCELLED");
    }

    #[test]
    fn test_access_denied_is_forbidden() {
        let (status, code) = ApiError::AccessDenied.status_and_code();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "ACCESS_DENIED");
    }
}
