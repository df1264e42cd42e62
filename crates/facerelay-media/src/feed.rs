//! Fan-out of decoded frames from one track to many consumers
//!
//! A track has exactly one RTP reader, which owns the [`FrameFeed`]. Everything
//! else that wants frames (the sampling loop, on-demand captures) holds a
//! [`TrackHandle`] and subscribes, so consumers never compete for packets on
//! the track itself. Handles do not keep the feed alive: once the reader drops
//! its feed every subscription reports [`FeedError::Ended`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::codec::VideoFrame;

/// Frames kept for a slow subscriber before it starts skipping
const FEED_DEPTH: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("track ended")]
    Ended,
}

/// Producing side, owned by the track reader
#[derive(Debug)]
pub struct FrameFeed {
    tx: broadcast::Sender<Arc<VideoFrame>>,
}

impl FrameFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_DEPTH);
        Self { tx }
    }

    /// Publish a decoded frame. Frames nobody is waiting for are dropped.
    pub fn push(&self, frame: VideoFrame) {
        let _ = self.tx.send(Arc::new(frame));
    }

    pub fn handle(&self) -> TrackHandle {
        TrackHandle {
            template: Arc::new(self.tx.subscribe()),
        }
    }
}

impl Default for FrameFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable consumer-side handle to a track's frames
#[derive(Debug, Clone)]
pub struct TrackHandle {
    template: Arc<broadcast::Receiver<Arc<VideoFrame>>>,
}

impl TrackHandle {
    /// Subscribe to frames decoded from now on
    pub fn subscribe(&self) -> FrameSubscription {
        FrameSubscription {
            rx: self.template.resubscribe(),
        }
    }
}

/// Receiving side; yields frames pushed after it was created
#[derive(Debug)]
pub struct FrameSubscription {
    rx: broadcast::Receiver<Arc<VideoFrame>>,
}

impl FrameSubscription {
    /// Wait up to `wait` for the next frame
    pub async fn next(&mut self, wait: Duration) -> Result<Arc<VideoFrame>, FeedError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(FeedError::Timeout(wait)),
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::trace!("Frame subscriber lagged, skipped {} frames", skipped);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(FeedError::Ended),
            }
        }
    }
}
