//! Client for the external face-recognition service.

use std::time::Duration;

use async_trait::async_trait;
use facerelay_protocol::BoundingBox;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("recognition service returned {0}")]
    Status(StatusCode),

    #[error("recognition service reported failure: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// One face as reported by the recognition service
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RawPrediction {
    pub userid: String,
    pub confidence: f32,
    #[serde(default)]
    pub x_min: i32,
    #[serde(default)]
    pub y_min: i32,
    #[serde(default)]
    pub x_max: i32,
    #[serde(default)]
    pub y_max: i32,
}

impl RawPrediction {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox {
            x_min: self.x_min,
            y_min: self.y_min,
            x_max: self.x_max,
            y_max: self.y_max,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    success: bool,
    #[serde(default)]
    predictions: Vec<RawPrediction>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Send one JPEG to `endpoint` and return the faces found
    async fn recognize(
        &self,
        endpoint: &str,
        jpeg: Vec<u8>,
    ) -> Result<Vec<RawPrediction>, RecognitionError>;
}

/// Multipart HTTP client for the recognition service
#[derive(Clone)]
pub struct HttpRecognitionBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRecognitionBackend {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("facerelay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl RecognitionBackend for HttpRecognitionBackend {
    async fn recognize(
        &self,
        endpoint: &str,
        jpeg: Vec<u8>,
    ) -> Result<Vec<RawPrediction>, RecognitionError> {
        let part = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(endpoint)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RecognitionError::Timeout(self.timeout)
                } else {
                    RecognitionError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(RecognitionError::Status(response.status()));
        }

        let body: RecognitionResponse = response
            .json()
            .await
            .map_err(|e| RecognitionError::Decode(e.to_string()))?;

        if !body.success {
            return Err(RecognitionError::Rejected(
                body.error.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(body.predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_response() {
        let body: RecognitionResponse = serde_json::from_str(
            r#"{
                "success": true,
                "predictions": [
                    {"userid": "p-1", "confidence": 0.91, "x_min": 10, "y_min": 20, "x_max": 110, "y_max": 140},
                    {"userid": "unknown", "confidence": 0.0}
                ]
            }"#,
        )
        .unwrap();

        assert!(body.success);
        assert_eq!(body.predictions.len(), 2);
        assert_eq!(
            body.predictions[0].bbox(),
            BoundingBox {
                x_min: 10,
                y_min: 20,
                x_max: 110,
                y_max: 140
            }
        );
        assert_eq!(body.predictions[1].bbox(), BoundingBox::default());
    }

    #[test]
    fn missing_predictions_means_none() {
        let body: RecognitionResponse =
            serde_json::from_str(r#"{"success": false, "error": "No face found"}"#).unwrap();
        assert!(!body.success);
        assert!(body.predictions.is_empty());
        assert_eq!(body.error.as_deref(), Some("No face found"));
    }
}
