//! Error types for the application

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Upstream returned status: {0}")]
    UpstreamStatus(u16),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(u64),

    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::ConsumerNotFound(_) | AppError::SensorNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            AppError::InvalidSetting(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Storage(_) | AppError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::MalformedSnapshot(_)
            | AppError::UpstreamStatus(_)
            | AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
        };

        (status, message).into_response()
    }
}
