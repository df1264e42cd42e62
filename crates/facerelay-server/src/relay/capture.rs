//! Per-device sampling loop feeding the recognition dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use facerelay_media::{FeedError, TrackHandle, VideoFrame, FULL_QUALITY};
use facerelay_protocol::{FramePreview, RelayEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dispatcher::{DispatchOutcome, NoMatchLog, RecognitionDispatcher, SampledFrame};
use super::error::CaptureError;
use crate::ws::BroadcastHub;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// How long to wait for a frame before logging a stall
    pub frame_wait: Duration,
    /// Minimum gap between frames forwarded for recognition
    pub sample_interval: Duration,
    pub publish_frames: bool,
    pub preview_quality: u8,
    pub no_match_log_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_wait: Duration::from_secs(5),
            sample_interval: Duration::from_secs(1),
            publish_frames: false,
            preview_quality: 60,
            no_match_log_interval: Duration::from_secs(30),
        }
    }
}

/// Time gate deciding which received frames are forwarded
#[derive(Debug, Clone)]
pub struct SampleGate {
    interval: Duration,
    last: Option<Instant>,
}

impl SampleGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Wait for one frame on `track` and encode it at full quality
pub async fn capture_frame(track: &TrackHandle, wait: Duration) -> Result<Vec<u8>, CaptureError> {
    let mut subscription = track.subscribe();
    let frame = subscription.next(wait).await?;
    let jpeg = tokio::task::spawn_blocking(move || frame.encode_jpeg(FULL_QUALITY)).await??;
    Ok(jpeg)
}

/// Samples one device's video track and hands frames to the dispatcher.
///
/// Started once the device connection is established and stopped when the
/// track ends or the connection terminates. A stopped loop cannot be
/// restarted. Recognition work runs in tasks owned by the loop; stopping the
/// loop halts sampling but lets those tasks finish.
pub struct FrameCaptureLoop {
    device_id: String,
    track: TrackHandle,
    endpoint: RwLock<String>,
    settings: CaptureSettings,
    dispatcher: Arc<RecognitionDispatcher>,
    hub: Arc<BroadcastHub>,
    no_match: Arc<NoMatchLog>,
    started: AtomicBool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<DispatchOutcome>>>,
}

impl FrameCaptureLoop {
    pub fn new(
        device_id: String,
        track: TrackHandle,
        endpoint: String,
        settings: CaptureSettings,
        dispatcher: Arc<RecognitionDispatcher>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let no_match = Arc::new(NoMatchLog::new(settings.no_match_log_interval));

        Self {
            device_id,
            track,
            endpoint: RwLock::new(endpoint),
            settings,
            dispatcher,
            hub,
            no_match,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Point future recognition calls at a different endpoint
    pub fn set_endpoint(&self, endpoint: String) {
        let mut current = self.endpoint.write().unwrap_or_else(|p| p.into_inner());
        if *current != endpoint {
            tracing::info!(
                "Recognition endpoint for {} changed to {}",
                self.device_id,
                endpoint
            );
            *current = endpoint;
        }
    }

    /// Spawn the sampling loop. Returns `None` if it was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.running.store(true, Ordering::SeqCst);

        let this = self.clone();
        Some(tokio::spawn(async move {
            this.run().await;
            this.running.store(false, Ordering::SeqCst);
        }))
    }

    /// Request termination. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Grab one frame now, bypassing the sampling gate
    pub async fn capture_once(&self) -> Result<Vec<u8>, CaptureError> {
        capture_frame(&self.track, self.settings.frame_wait).await
    }

    /// Recognition tasks dispatched by this loop that have not finished yet
    pub fn outstanding_tasks(&self) -> usize {
        self.lock_tasks().iter().filter(|t| !t.is_finished()).count()
    }

    /// Wait for every dispatched recognition task to complete
    pub async fn join_outstanding(&self) -> Vec<DispatchOutcome> {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!("Recognition task for {} failed: {}", self.device_id, e),
            }
        }
        outcomes
    }

    async fn run(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }

        let mut subscription = self.track.subscribe();
        let mut gate = SampleGate::new(self.settings.sample_interval);
        let mut stalls: u64 = 0;

        tracing::info!("Capture loop started for {}", self.device_id);

        loop {
            let next = tokio::select! {
                _ = stop_rx.changed() => break,
                next = subscription.next(self.settings.frame_wait) => next,
            };

            match next {
                Ok(frame) => {
                    stalls = 0;
                    if gate.admit(Instant::now()) {
                        self.dispatch(frame);
                    }
                }
                Err(FeedError::Timeout(wait)) => {
                    // The peer may resume sending
                    stalls += 1;
                    if stalls == 1 || stalls % 12 == 0 {
                        tracing::debug!(
                            "No frame from {} in {:?} ({} consecutive stalls)",
                            self.device_id,
                            wait,
                            stalls
                        );
                    }
                }
                Err(FeedError::Ended) => {
                    tracing::info!("Video track for {} ended", self.device_id);
                    break;
                }
            }
        }

        tracing::info!(
            "Capture loop stopped for {} ({} recognition tasks outstanding)",
            self.device_id,
            self.outstanding_tasks()
        );
    }

    fn dispatch(&self, frame: Arc<VideoFrame>) {
        let device_id = self.device_id.clone();
        let endpoint = self.endpoint();
        let dispatcher = self.dispatcher.clone();
        let hub = self.hub.clone();
        let no_match = self.no_match.clone();
        let preview_quality = self.settings.publish_frames.then_some(self.settings.preview_quality);

        let task = tokio::spawn(async move {
            // Shed frames are dropped before any encoding work
            let Some(permit) = dispatcher.admit(&device_id).await else {
                return DispatchOutcome::Shed;
            };

            let encoded =
                tokio::task::spawn_blocking(move || encode_sample(&frame, preview_quality)).await;
            let (jpeg, preview) = match encoded {
                Ok(Ok(encoded)) => encoded,
                Ok(Err(e)) => {
                    tracing::warn!("Failed to encode frame from {}: {}", device_id, e);
                    return DispatchOutcome::Failed;
                }
                Err(e) => {
                    tracing::warn!("Encoder task for {} failed: {}", device_id, e);
                    return DispatchOutcome::Failed;
                }
            };

            if let Some(preview) = preview {
                let event = RelayEvent::Frame {
                    data: FramePreview {
                        device_id: device_id.clone(),
                        image: base64::engine::general_purpose::STANDARD.encode(preview),
                    },
                    timestamp: Utc::now(),
                };
                hub.publish(&event, Some(&device_id)).await;
            }

            let frame = SampledFrame {
                device_id,
                endpoint,
                jpeg,
            };
            dispatcher.recognize_admitted(permit, frame, &no_match).await
        });

        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<DispatchOutcome>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for FrameCaptureLoop {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// JPEG for recognition plus an optional lower-quality preview
fn encode_sample(
    frame: &VideoFrame,
    preview_quality: Option<u8>,
) -> Result<(Vec<u8>, Option<Vec<u8>>), facerelay_media::MediaError> {
    let jpeg = frame.encode_jpeg(FULL_QUALITY)?;
    let preview = match preview_quality {
        Some(quality) => Some(frame.encode_jpeg(quality)?),
        None => None,
    };
    Ok((jpeg, preview))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::relay::gate::ConcurrencyGate;
    use crate::relay::names::{NameCachePolicy, PersonNameResolver};
    use crate::relay::recognition::{RawPrediction, RecognitionBackend, RecognitionError};
    use async_trait::async_trait;
    use facerelay_media::FrameFeed;
    use tokio::sync::mpsc;

    /// Records when each recognition call arrives
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<(Instant, String)>>,
    }

    #[async_trait]
    impl RecognitionBackend for RecordingBackend {
        async fn recognize(
            &self,
            endpoint: &str,
            _jpeg: Vec<u8>,
        ) -> Result<Vec<RawPrediction>, RecognitionError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), endpoint.to_string()));
            Ok(Vec::new())
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame::new(4, 4, vec![128; 48]).unwrap()
    }

    fn capture_loop(
        track: TrackHandle,
        settings: CaptureSettings,
        backend: Arc<RecordingBackend>,
        hub: Arc<BroadcastHub>,
    ) -> Arc<FrameCaptureLoop> {
        let gate = Arc::new(ConcurrencyGate::new(10, 20));
        gated_capture_loop(track, settings, backend, hub, gate)
    }

    fn gated_capture_loop(
        track: TrackHandle,
        settings: CaptureSettings,
        backend: Arc<RecordingBackend>,
        hub: Arc<BroadcastHub>,
        gate: Arc<ConcurrencyGate>,
    ) -> Arc<FrameCaptureLoop> {
        let names = Arc::new(PersonNameResolver::new(
            Arc::new(MemoryDirectory::new()),
            NameCachePolicy::default(),
        ));
        let dispatcher = Arc::new(RecognitionDispatcher::new(
            backend,
            gate,
            names,
            hub.clone(),
            Duration::from_secs(1),
        ));
        Arc::new(FrameCaptureLoop::new(
            "kiosk-1".to_string(),
            track,
            "http://recognizer.invalid/a".to_string(),
            settings,
            dispatcher,
            hub,
        ))
    }

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            frame_wait: Duration::from_millis(50),
            sample_interval: Duration::from_millis(200),
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn sample_gate_enforces_interval() {
        let mut gate = SampleGate::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(gate.admit(t0));
        assert!(!gate.admit(t0 + Duration::from_millis(40)));
        assert!(!gate.admit(t0 + Duration::from_millis(99)));
        assert!(gate.admit(t0 + Duration::from_millis(100)));
        assert!(!gate.admit(t0 + Duration::from_millis(150)));
        assert!(gate.admit(t0 + Duration::from_millis(260)));
    }

    #[tokio::test]
    async fn forwards_at_most_one_frame_per_interval() {
        let feed = FrameFeed::new();
        let backend = Arc::new(RecordingBackend::default());
        let capture = capture_loop(
            feed.handle(),
            fast_settings(),
            backend.clone(),
            Arc::new(BroadcastHub::default()),
        );
        let handle = capture.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Frames 25ms apart against a 200ms interval
        let started = Instant::now();
        for _ in 0..20 {
            feed.push(frame());
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let elapsed = started.elapsed();
        drop(feed);
        handle.await.unwrap();
        capture.join_outstanding().await;

        let calls = backend.calls.lock().unwrap().len();
        let allowed = (elapsed.as_millis() / 200) as usize + 1;
        assert!(calls >= 1, "expected at least one forwarded frame");
        assert!(calls <= allowed, "forwarded {} frames, allowed {}", calls, allowed);
        assert!(calls < 20);
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn survives_stalls_and_stops_when_track_ends() {
        let feed = FrameFeed::new();
        let backend = Arc::new(RecordingBackend::default());
        let capture = capture_loop(
            feed.handle(),
            fast_settings(),
            backend.clone(),
            Arc::new(BroadcastHub::default()),
        );
        let handle = capture.start().unwrap();

        // Several frame waits elapse with nothing on the track
        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(capture.is_running());

        feed.push(frame());
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(feed);

        handle.await.unwrap();
        capture.join_outstanding().await;
        assert!(!capture.is_running());
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_loop_is_not_restartable() {
        let feed = FrameFeed::new();
        let capture = capture_loop(
            feed.handle(),
            fast_settings(),
            Arc::new(RecordingBackend::default()),
            Arc::new(BroadcastHub::default()),
        );
        let handle = capture.start().unwrap();

        capture.stop();
        capture.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!capture.is_running());
        assert!(capture.start().is_none());
        capture.stop();
    }

    #[tokio::test]
    async fn endpoint_changes_apply_to_later_frames() {
        let feed = FrameFeed::new();
        let backend = Arc::new(RecordingBackend::default());
        let capture = capture_loop(
            feed.handle(),
            CaptureSettings {
                sample_interval: Duration::ZERO,
                ..fast_settings()
            },
            backend.clone(),
            Arc::new(BroadcastHub::default()),
        );
        let handle = capture.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        feed.push(frame());
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.set_endpoint("http://recognizer.invalid/b".to_string());
        feed.push(frame());
        tokio::time::sleep(Duration::from_millis(50)).await;

        capture.stop();
        handle.await.unwrap();
        capture.join_outstanding().await;

        let calls = backend.calls.lock().unwrap();
        let endpoints: Vec<_> = calls.iter().map(|(_, e)| e.as_str()).collect();
        assert_eq!(
            endpoints,
            vec!["http://recognizer.invalid/a", "http://recognizer.invalid/b"]
        );
    }

    #[tokio::test]
    async fn publishes_previews_when_enabled() {
        let feed = FrameFeed::new();
        let hub = Arc::new(BroadcastHub::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(tx, Some("kiosk-1".to_string())).await;

        let capture = capture_loop(
            feed.handle(),
            CaptureSettings {
                publish_frames: true,
                ..fast_settings()
            },
            Arc::new(RecordingBackend::default()),
            hub,
        );
        let handle = capture.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        feed.push(frame());
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.stop();
        handle.await.unwrap();
        capture.join_outstanding().await;

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "frame");
        assert_eq!(first["data"]["device_id"], "kiosk-1");
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "recognition");
    }

    #[tokio::test]
    async fn overloaded_gate_sheds_before_encoding() {
        let feed = FrameFeed::new();
        let hub = Arc::new(BroadcastHub::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(tx, Some("kiosk-1".to_string())).await;

        // One permit, already taken, and no room to queue
        let gate = Arc::new(ConcurrencyGate::new(1, 0));
        let held = gate.enter().await.unwrap();

        let backend = Arc::new(RecordingBackend::default());
        let capture = gated_capture_loop(
            feed.handle(),
            CaptureSettings {
                publish_frames: true,
                sample_interval: Duration::ZERO,
                ..fast_settings()
            },
            backend.clone(),
            hub,
            gate.clone(),
        );
        let handle = capture.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            feed.push(frame());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        capture.stop();
        handle.await.unwrap();

        let outcomes = capture.join_outstanding().await;
        assert!(!outcomes.is_empty());
        assert!(outcomes.iter().all(|o| *o == DispatchOutcome::Shed));
        assert!(backend.calls.lock().unwrap().is_empty());
        // No preview means the frame was never encoded
        assert!(rx.try_recv().is_err());
        assert_eq!(gate.pending(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn capture_once_returns_a_jpeg() {
        let feed = FrameFeed::new();
        let capture = capture_loop(
            feed.handle(),
            fast_settings(),
            Arc::new(RecordingBackend::default()),
            Arc::new(BroadcastHub::default()),
        );

        let pending = {
            let capture = capture.clone();
            tokio::spawn(async move { capture.capture_once().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.push(frame());

        let jpeg = pending.await.unwrap().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn capture_once_times_out_without_frames() {
        let feed = FrameFeed::new();
        let result = capture_frame(&feed.handle(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(CaptureError::Timeout)));

        let handle = feed.handle();
        drop(feed);
        let result = capture_frame(&handle, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(CaptureError::TrackEnded)));
    }
}
