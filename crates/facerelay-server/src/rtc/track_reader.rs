//! Reads RTP from a device's video track and decodes it into frames
//!
//! One reader per track. RTP is depayloaded on the async side; complete access
//! units are handed to a blocking decode thread that owns the [`FrameFeed`].
//! When the track closes the feed is dropped and every subscriber sees the
//! track end.

use std::sync::Arc;
use std::time::Duration;

use facerelay_media::{DecoderFactory, FrameFeed, H264Depacketizer, TrackHandle};
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

/// Access units buffered ahead of the decoder before new ones are dropped
const DECODE_QUEUE: usize = 8;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Start reading `track` and return a handle to its decoded frames
pub fn spawn_reader(
    track: Arc<TrackRemote>,
    device_id: String,
    decoders: Arc<dyn DecoderFactory>,
) -> TrackHandle {
    let feed = FrameFeed::new();
    let handle = feed.handle();
    let (au_tx, au_rx) = mpsc::channel(DECODE_QUEUE);

    let decode_device = device_id.clone();
    tokio::task::spawn_blocking(move || decode_loop(decode_device, decoders, au_rx, feed));
    tokio::spawn(read_loop(track, device_id, au_tx));

    handle
}

async fn read_loop(track: Arc<TrackRemote>, device_id: String, au_tx: mpsc::Sender<Vec<u8>>) {
    tracing::info!(
        "Reading video track {} from {} ({})",
        track.id(),
        device_id,
        track.codec().capability.mime_type
    );

    let mut depacketizer = H264Depacketizer::new();
    let mut packet_count = 0u64;
    let mut timeouts = 0u64;
    let mut dropped = 0u64;

    loop {
        let packet = match tokio::time::timeout(READ_TIMEOUT, track.read_rtp()).await {
            Err(_) => {
                timeouts += 1;
                if timeouts == 1 || timeouts % 5 == 0 {
                    tracing::debug!(
                        "No RTP from {} for {:?} (attempt {})",
                        device_id,
                        READ_TIMEOUT,
                        timeouts
                    );
                }
                continue;
            }
            Ok(Ok((packet, _attributes))) => packet,
            Ok(Err(e)) => {
                // webrtc-rs reports end of track and a receiver that is not
                // bound yet through the same error types as transient read
                // failures, so only the message tells them apart
                let error_msg = e.to_string();
                if error_msg.contains("closed") || error_msg.contains("EOF") {
                    tracing::info!("Video track from {} closed", device_id);
                    break;
                }
                if error_msg.contains("RTPReceiver must not be nil") {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                if packet_count % 100 == 0 {
                    tracing::warn!("Error reading RTP from {}: {}", device_id, e);
                }
                continue;
            }
        };

        timeouts = 0;
        packet_count += 1;
        if packet_count == 1 {
            tracing::info!(
                "First RTP packet from {} ({} bytes)",
                device_id,
                packet.payload.len()
            );
        }

        let access_unit = match depacketizer.push(&packet.payload, packet.header.marker) {
            Ok(Some(au)) => au,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!("Dropping malformed RTP from {}: {}", device_id, e);
                depacketizer.reset();
                continue;
            }
        };

        match au_tx.try_send(access_unit) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped == 1 || dropped % 30 == 0 {
                    tracing::warn!("Decoder for {} is behind; dropped {} access units", device_id, dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Decoder for {} stopped; ending track reader", device_id);
                break;
            }
        }
    }

    tracing::info!("Track reader for {} finished after {} packets", device_id, packet_count);
}

fn decode_loop(
    device_id: String,
    decoders: Arc<dyn DecoderFactory>,
    mut au_rx: mpsc::Receiver<Vec<u8>>,
    feed: FrameFeed,
) {
    let mut decoder = match decoders.create() {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!("Cannot decode video from {}: {}", device_id, e);
            return;
        }
    };
    tracing::info!("Decoding video from {} with {}", device_id, decoder.name());

    let mut decoded = 0u64;
    let mut errors = 0u64;

    while let Some(access_unit) = au_rx.blocking_recv() {
        match decoder.decode(&access_unit) {
            Ok(Some(frame)) => {
                decoded += 1;
                if decoded == 1 {
                    tracing::info!(
                        "First frame from {}: {}x{}",
                        device_id,
                        frame.width,
                        frame.height
                    );
                }
                feed.push(frame);
            }
            Ok(None) => {}
            Err(e) => {
                errors += 1;
                if errors == 1 || errors % 50 == 0 {
                    tracing::warn!("Decode error for {} ({} so far): {}", device_id, errors, e);
                }
            }
        }
    }

    tracing::debug!("Decoder for {} stopped after {} frames", device_id, decoded);
}
