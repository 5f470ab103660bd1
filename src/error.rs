//! 统一的 API 错误类型与转换。
//!
//! The flow client treats any 500 as a permanent failure for that chunk,
//! so malformed requests and storage failures both answer 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::coordinator::UploadError;
use crate::flow::FlowError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    Malformed(String),
    Storage(String),
    BadMethod,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Malformed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Unable to extract flow data: {msg}"),
            )
                .into_response(),
            ApiError::Storage(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Part upload failure: {msg}"),
            )
                .into_response(),
            ApiError::BadMethod => (StatusCode::INTERNAL_SERVER_ERROR, "bad method").into_response(),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        ApiError::Malformed(error.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidUploadId(_) => ApiError::Malformed(error.to_string()),
            other => ApiError::Storage(other.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Flow(err) => err.into(),
            UploadError::Store(err) => err.into(),
        }
    }
}
