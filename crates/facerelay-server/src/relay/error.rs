use facerelay_media::{FeedError, MediaError};
use facerelay_protocol::DeviceClass;
use thiserror::Error;

use crate::directory::DirectoryError;

/// Why a device session was not admitted
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Device is not registered")]
    UnknownDevice,

    #[error("Device is not approved")]
    NotApproved,

    #[error("Invalid device credential")]
    BadCredential,

    #[error("Device class '{0}' may not stream to the relay")]
    WrongClass(DeviceClass),

    #[error("Connection limit reached ({active}/{max})")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Session negotiation failed: {0}")]
    Negotiation(String),

    #[error("Session was replaced or closed before negotiation finished")]
    Superseded,

    #[error("Directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl AdmissionError {
    /// Machine-readable reason for credential rejections
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            AdmissionError::UnknownDevice => Some("unregistered_device"),
            AdmissionError::NotApproved => Some("unapproved_device"),
            AdmissionError::BadCredential => Some("invalid_credential"),
            AdmissionError::WrongClass(_) => Some("wrong_device_class"),
            _ => None,
        }
    }
}

/// Why an on-demand capture produced no image
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device {0} has no live video track")]
    NotConnected(String),

    #[error("no frame arrived in time")]
    Timeout,

    #[error("video track ended")]
    TrackEnded,

    #[error("encoding failed: {0}")]
    Encode(#[from] MediaError),

    #[error("encoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<FeedError> for CaptureError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Timeout(_) => CaptureError::Timeout,
            FeedError::Ended => CaptureError::TrackEnded,
        }
    }
}
