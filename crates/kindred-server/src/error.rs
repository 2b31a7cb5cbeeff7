//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kindred_types::CompanionError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CompanionError> for ServerError {
    fn from(e: CompanionError) -> Self {
        match e {
            CompanionError::Validation(msg) => ServerError::BadRequest(msg),
            CompanionError::Capability(e) => ServerError::Unavailable(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServerError::Unavailable(_) => {
                tracing::warn!(error = %self, "capability unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            ServerError::Internal(_) | ServerError::Bind { .. } | ServerError::Io(_) => {
                tracing::error!(error = %self, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = ErrorBody {
            code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_types::CapabilityError;

    #[test]
    fn companion_errors_map_to_status_codes() {
        let bad: ServerError = CompanionError::Validation("empty".into()).into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let broken: ServerError = CompanionError::Persistence("disk".into()).into();
        assert_eq!(broken.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let offline: ServerError =
            CompanionError::Capability(CapabilityError::Unavailable("planner".into())).into();
        assert_eq!(offline.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
