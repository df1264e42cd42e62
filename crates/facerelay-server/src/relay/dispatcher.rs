//! Sends sampled frames to the recognition service and publishes the results.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use facerelay_protocol::{Prediction, RecognitionReport, RelayEvent};

use super::gate::{ConcurrencyGate, GatePermit};
use super::names::{PersonNameResolver, NO_MATCH_IDENTITY};
use super::recognition::{RecognitionBackend, RecognitionError};
use crate::ws::BroadcastHub;

/// What happened to one frame handed to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Result published with this many predictions
    Published(usize),
    /// Gate overloaded; nothing was sent
    Shed,
    /// Call failed or timed out; nothing was published
    Failed,
}

/// Rate limit for "no match" log lines, one per capture loop
pub struct NoMatchLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl NoMatchLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn should_log(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// A JPEG ready for recognition
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub device_id: String,
    pub endpoint: String,
    pub jpeg: Vec<u8>,
}

pub struct RecognitionDispatcher {
    backend: Arc<dyn RecognitionBackend>,
    gate: Arc<ConcurrencyGate>,
    names: Arc<PersonNameResolver>,
    hub: Arc<BroadcastHub>,
    timeout: Duration,
}

impl RecognitionDispatcher {
    pub fn new(
        backend: Arc<dyn RecognitionBackend>,
        gate: Arc<ConcurrencyGate>,
        names: Arc<PersonNameResolver>,
        hub: Arc<BroadcastHub>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            gate,
            names,
            hub,
            timeout,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Recognise one frame and publish the result to the device's observers.
    /// At most one attempt is made; failures are logged and dropped.
    pub async fn recognize(&self, frame: SampledFrame, no_match: &NoMatchLog) -> DispatchOutcome {
        let Some(permit) = self.admit(&frame.device_id).await else {
            return DispatchOutcome::Shed;
        };
        self.recognize_admitted(permit, frame, no_match).await
    }

    /// Enter the gate for one frame from `device_id`, or `None` if it is shed
    pub async fn admit(&self, device_id: &str) -> Option<GatePermit<'_>> {
        let permit = self.gate.enter().await;
        if permit.is_none() {
            tracing::debug!(
                "Shedding frame from {} ({} requests pending)",
                device_id,
                self.gate.pending()
            );
        }
        permit
    }

    /// Like [`recognize`](Self::recognize) for a frame that already holds a
    /// permit. The permit is released as soon as the service call returns.
    pub async fn recognize_admitted(
        &self,
        permit: GatePermit<'_>,
        frame: SampledFrame,
        no_match: &NoMatchLog,
    ) -> DispatchOutcome {
        let size = frame.jpeg.len();
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.timeout,
            self.backend.recognize(&frame.endpoint, frame.jpeg),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RecognitionError::Timeout(self.timeout)),
        };
        drop(permit);

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Recognition failed for {}: {}", frame.device_id, e);
                return DispatchOutcome::Failed;
            }
        };

        tracing::trace!(
            "Recognition for {} took {:?} ({} faces)",
            frame.device_id,
            started.elapsed(),
            raw.len()
        );

        if raw.iter().all(|p| p.userid == NO_MATCH_IDENTITY) && no_match.should_log() {
            tracing::info!("No known faces from {}", frame.device_id);
        }

        let mut predictions = Vec::with_capacity(raw.len());
        for p in &raw {
            predictions.push(Prediction {
                name: self.names.resolve(&p.userid).await,
                identity: p.userid.clone(),
                confidence: p.confidence,
                bbox: p.bbox(),
            });
        }

        let count = predictions.len();
        let event = RelayEvent::Recognition {
            data: RecognitionReport {
                device_id: frame.device_id.clone(),
                predictions,
                size,
                timestamp: Utc::now(),
            },
        };
        self.hub.publish(&event, Some(&frame.device_id)).await;

        DispatchOutcome::Published(count)
    }
}
