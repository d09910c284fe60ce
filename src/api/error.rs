use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::errors::{FleetError, HypervisorError};

/// Maps engine errors onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl<E> From<E> for ApiError
where
    E: Into<FleetError>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::ClassNotFound { .. } | FleetError::VmNotInClass { .. } => {
                StatusCode::NOT_FOUND
            }
            FleetError::InvalidState { .. } => StatusCode::CONFLICT,
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::Hypervisor(HypervisorError::NotFound(_)) => StatusCode::NOT_FOUND,
            FleetError::Hypervisor(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = self.0.to_string(), "Request failed");
        }
        (
            status,
            Json(json!({
                "status": "error",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
