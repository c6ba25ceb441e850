//! Mapping of lifecycle results onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::core::{LifecycleError, Outcome};

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Outcome::Created(body) => (StatusCode::CREATED, Json(body)).into_response(),
            Outcome::Accepted(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            Outcome::Gone => (StatusCode::GONE, Json(json!({}))).into_response(),
        }
    }
}

impl LifecycleError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_)
            | Self::Validation(_)
            | Self::BadRequest(_)
            | Self::InstanceNotFound(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableState(_) | Self::AsyncRequired => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Persistence(_) | Self::Module(_) | Self::Engine(_) | Self::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::Validation(e) => json!({ "error": e.field, "description": e.issue }),
            Self::AsyncRequired => json!({
                "error": "AsyncRequired",
                "description": "This service plan requires client support for asynchronous service operations.",
            }),
            Self::MalformedRequest(reason) => json!({
                "error": "MalformedRequest",
                "description": reason,
            }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
