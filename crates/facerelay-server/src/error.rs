use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::relay::AdmissionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Device credentials required")]
    Unauthorized,

    #[error("{0}")]
    Admission(#[from] AdmissionError),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": self.to_string() })),
            AppError::Admission(e) => admission_response(e),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
        };

        (status, Json(body)).into_response()
    }
}

fn admission_response(e: &AdmissionError) -> (StatusCode, serde_json::Value) {
    if let Some(reason) = e.reason() {
        return (
            StatusCode::FORBIDDEN,
            json!({ "error": e.to_string(), "reason": reason }),
        );
    }

    match e {
        AdmissionError::Superseded => (
            StatusCode::CONFLICT,
            json!({ "error": e.to_string() }),
        ),
        AdmissionError::CapacityExceeded { active, max } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": e.to_string(), "active": active, "max": max }),
        ),
        AdmissionError::Negotiation(_) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": e.to_string() }),
        ),
        _ => {
            tracing::error!("Admission failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal server error" }),
            )
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
