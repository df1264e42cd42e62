use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CaptureResult, FramePreview, RecognitionReport};

/// Control messages sent by observers over the event channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverCommand {
    /// Keepalive
    Ping,

    /// Grab a single frame from a device right now
    Capture {
        #[serde(alias = "deviceId")]
        device_id: String,
        #[serde(alias = "frameIndex", default)]
        frame_index: u64,
    },

    /// Look up the device's recognition endpoint again
    RefreshEndpoint {
        #[serde(alias = "deviceId")]
        device_id: String,
    },
}

/// Events pushed to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Sent once after the observer is registered
    Connected,

    /// Preview of a sampled frame
    Frame {
        data: FramePreview,
        timestamp: DateTime<Utc>,
    },

    /// Recognition result for a sampled frame
    Recognition { data: RecognitionReport },

    /// Reply to [`ObserverCommand::Capture`]
    CaptureResult { data: CaptureResult },

    /// Reply to [`ObserverCommand::Ping`]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_command_accepts_camel_case_fields() {
        let cmd: ObserverCommand =
            serde_json::from_str(r#"{"type":"capture","deviceId":"kiosk-1","frameIndex":7}"#)
                .unwrap();
        assert_eq!(
            cmd,
            ObserverCommand::Capture {
                device_id: "kiosk-1".to_string(),
                frame_index: 7
            }
        );
    }

    #[test]
    fn events_are_tagged_by_type() {
        let json = serde_json::to_value(&RelayEvent::Pong).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "pong" }));

        let json = serde_json::to_value(&RelayEvent::CaptureResult {
            data: CaptureResult::failed("kiosk-1".to_string(), 3, "device not connected"),
        })
        .unwrap();
        assert_eq!(json["type"], "capture_result");
        assert_eq!(json["data"]["success"], false);
        assert_eq!(json["data"]["reason"], "device not connected");
        assert!(json["data"].get("image").is_none());
    }
}
