//! Media processing utilities for facerelay
//!
//! This crate turns inbound RTP video into frames the relay can sample:
//! - H.264 RTP depayloading into Annex B access units
//! - Video decoding (GStreamer, behind the `gstreamer` feature)
//! - JPEG encoding of decoded frames
//! - Fan-out of decoded frames to every consumer of a track

pub mod codec;
pub mod error;
pub mod feed;
pub mod h264;

#[cfg(feature = "gstreamer")]
pub mod gst_decoder;

pub use codec::*;
pub use error::MediaError;
pub use feed::{FeedError, FrameFeed, FrameSubscription, TrackHandle};
pub use h264::H264Depacketizer;
