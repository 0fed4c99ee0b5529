//! Plugin RPC surface.
//!
//! The runtime speaks JSON over a unix socket, one POST per operation. The
//! handlers translate between the fixed wire shapes and the driver; errors
//! travel back as `{"Err": "..."}` bodies.

pub mod ipam;
pub mod network;
pub mod server;

use crate::core::error::DriverError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Default plugin socket, where the runtime discovers us.
pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/flannel-np.sock";

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "Err")]
    pub err: String,
}

/// Driver errors rendered the way the runtime expects them.
#[derive(Debug)]
pub struct ApiError(pub DriverError);

impl From<DriverError> for ApiError {
    fn from(err: DriverError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DriverError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            // Missing networks/endpoints surface as forbidden operations.
            DriverError::NotFound { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                err: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;
