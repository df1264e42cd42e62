use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class a device is registered under
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Kiosk,
    Scanner,
    Display,
}

impl DeviceClass {
    /// Only kiosks and scanners stream video into the relay
    pub fn may_stream(self) -> bool {
        matches!(self, DeviceClass::Kiosk | DeviceClass::Scanner)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Kiosk => write!(f, "kiosk"),
            DeviceClass::Scanner => write!(f, "scanner"),
            DeviceClass::Display => write!(f, "display"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kiosk" => Ok(DeviceClass::Kiosk),
            "scanner" => Ok(DeviceClass::Scanner),
            "display" => Ok(DeviceClass::Display),
            other => Err(format!("unknown device class '{}'", other)),
        }
    }
}

/// Lifecycle of a device media connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    New,
    Negotiating,
    Established,
    Failed,
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Failed | LifecycleState::Closed)
    }
}

/// SDP offer or answer exchanged over the media session endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn answer(sdp: String) -> Self {
        Self {
            sdp,
            kind: "answer".to_string(),
        }
    }
}

/// Face bounding box in source image pixels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

/// One recognised face, enriched with a display name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub identity: String,
    pub name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Result of recognising one sampled frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReport {
    pub device_id: String,
    pub predictions: Vec<Prediction>,
    /// Size of the JPEG that was sent for recognition
    pub size: usize,
    pub timestamp: DateTime<Utc>,
}

/// Base64 JPEG preview of a sampled frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePreview {
    pub device_id: String,
    pub image: String,
}

/// Reply to an on-demand capture request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    pub success: bool,
    pub device_id: String,
    pub frame_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CaptureResult {
    pub fn captured(device_id: String, frame_index: u64, image: String) -> Self {
        Self {
            success: true,
            device_id,
            frame_index,
            image: Some(image),
            reason: None,
        }
    }

    pub fn failed(device_id: String, frame_index: u64, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            device_id,
            frame_index,
            image: None,
            reason: Some(reason.into()),
        }
    }
}
