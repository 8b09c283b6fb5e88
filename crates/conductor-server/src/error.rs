use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use conductor_store::StoreError;

use crate::rpc;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// RPC error code for the same condition.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => rpc::NOT_FOUND,
            Self::InvalidRequest(_) => rpc::INVALID_PARAMS,
            Self::Timeout(_) | Self::Store(_) | Self::Internal(_) => rpc::INTERNAL_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), axum::Json(body)).into_response()
    }
}
