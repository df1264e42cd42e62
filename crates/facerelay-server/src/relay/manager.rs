//! Device connection registry and admission control
//!
//! Owns every live device connection, keyed by device ID. At most one
//! connection exists per device: a new offer from a connected device closes
//! the previous session first. Media session callbacks never touch the
//! registry directly; they post [`SessionEvent`]s that a single pump task
//! applies to the matching connection's [`Lifecycle`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facerelay_media::TrackHandle;
use facerelay_protocol::{LifecycleState, SessionDescription};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::capture::{capture_frame, CaptureSettings, FrameCaptureLoop};
use super::dispatcher::RecognitionDispatcher;
use super::error::{AdmissionError, CaptureError};
use super::lifecycle::{Lifecycle, Transition, TransportState};
use crate::auth::DeviceAuthenticator;
use crate::directory::Directory;
use crate::ws::BroadcastHub;

/// A negotiated media session, owned by exactly one device connection
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn close(&self);
}

/// Negotiates media sessions from device offers
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Answer `offer`. The session reports its track and transport changes
    /// through `events`.
    async fn negotiate(
        &self,
        offer: SessionDescription,
        events: SessionEvents,
    ) -> anyhow::Result<(Arc<dyn MediaSession>, SessionDescription)>;
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    Track(TrackHandle),
    Transport(TransportState),
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub device_id: String,
    pub session_id: Uuid,
    pub kind: SessionEventKind,
}

/// Sender handed to one media session
#[derive(Debug, Clone)]
pub struct SessionEvents {
    device_id: String,
    session_id: Uuid,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEvents {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn track(&self, handle: TrackHandle) {
        self.send(SessionEventKind::Track(handle));
    }

    pub fn transport(&self, state: TransportState) {
        self.send(SessionEventKind::Transport(state));
    }

    fn send(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            device_id: self.device_id.clone(),
            session_id: self.session_id,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("Connection manager gone; dropping session event");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_connections: usize,
    pub default_endpoint: String,
    pub capture: CaptureSettings,
}

struct DeviceConnection {
    session_id: Uuid,
    /// `None` while the session is still negotiating
    session: Option<Arc<dyn MediaSession>>,
    lifecycle: Lifecycle,
    capture: Option<Arc<FrameCaptureLoop>>,
    admitted_at: DateTime<Utc>,
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub device_id: String,
    pub state: LifecycleState,
    pub capturing: bool,
    pub endpoint: Option<String>,
    pub outstanding_recognitions: usize,
    pub admitted_at: DateTime<Utc>,
}

pub struct ConnectionManager {
    authenticator: DeviceAuthenticator,
    directory: Arc<dyn Directory>,
    factory: Arc<dyn SessionFactory>,
    dispatcher: Arc<RecognitionDispatcher>,
    hub: Arc<BroadcastHub>,
    settings: ManagerSettings,
    /// Device ID -> connection, including ones still negotiating. Never held
    /// across a negotiation or a session close.
    connections: Mutex<HashMap<String, DeviceConnection>>,
    /// Device ID -> inbound video, for on-demand captures
    tracks: RwLock<HashMap<String, TrackHandle>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionManager {
    pub fn new(
        authenticator: DeviceAuthenticator,
        directory: Arc<dyn Directory>,
        factory: Arc<dyn SessionFactory>,
        dispatcher: Arc<RecognitionDispatcher>,
        hub: Arc<BroadcastHub>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            authenticator,
            directory,
            factory,
            dispatcher,
            hub,
            settings,
            connections: Mutex::new(HashMap::new()),
            tracks: RwLock::new(HashMap::new()),
            events_tx,
        });

        tokio::spawn(pump_events(Arc::downgrade(&manager), events_rx));
        manager
    }

    pub fn max_connections(&self) -> usize {
        self.settings.max_connections
    }

    /// Authenticate a device and answer its session offer.
    ///
    /// The device's slot is reserved before negotiation starts and the
    /// registry is not locked while the session negotiates. A newer offer
    /// from the same device replaces a pending one, which then fails with
    /// [`AdmissionError::Superseded`].
    pub async fn admit(
        self: &Arc<Self>,
        device_id: &str,
        secret: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, AdmissionError> {
        let record = self.authenticator.authenticate(device_id, secret).await?;
        if !record.class.may_stream() {
            return Err(AdmissionError::WrongClass(record.class));
        }

        let session_id = Uuid::new_v4();
        let previous = {
            let mut connections = self.connections.lock().await;
            let previous = connections.remove(device_id);

            let active = connections.len();
            if active >= self.settings.max_connections {
                tracing::warn!(
                    "Rejecting {}: connection limit reached ({}/{})",
                    device_id,
                    active,
                    self.settings.max_connections
                );
                return Err(AdmissionError::CapacityExceeded {
                    active,
                    max: self.settings.max_connections,
                });
            }

            let mut lifecycle = Lifecycle::new();
            lifecycle.begin_negotiation();
            connections.insert(
                device_id.to_string(),
                DeviceConnection {
                    session_id,
                    session: None,
                    lifecycle,
                    capture: None,
                    admitted_at: Utc::now(),
                },
            );
            previous
        };

        if let Some(previous) = previous {
            tracing::info!(
                "Device {} sent a new offer; closing session {}",
                device_id,
                previous.session_id
            );
            self.teardown(device_id, previous).await;
        }

        let events = SessionEvents {
            device_id: device_id.to_string(),
            session_id,
            tx: self.events_tx.clone(),
        };

        // Runs to completion even if the caller goes away, so the reserved
        // slot is always either filled or released
        let manager = self.clone();
        let device = device_id.to_string();
        let answer = tokio::spawn(async move {
            manager.negotiate(device, session_id, offer, events).await
        })
        .await
        .map_err(|e| AdmissionError::Negotiation(e.to_string()))??;

        tracing::info!(
            "Admitted {} ({} class, session {}, {}/{} live)",
            device_id,
            record.class,
            session_id,
            self.live_count().await,
            self.settings.max_connections
        );

        Ok(answer)
    }

    /// Negotiate a reserved session and attach it to its slot
    async fn negotiate(
        &self,
        device_id: String,
        session_id: Uuid,
        offer: SessionDescription,
        events: SessionEvents,
    ) -> Result<SessionDescription, AdmissionError> {
        let negotiated = self.factory.negotiate(offer, events).await;

        let mut connections = self.connections.lock().await;
        let current = connections
            .get(&device_id)
            .is_some_and(|c| c.session_id == session_id);

        match negotiated {
            Ok((session, answer)) => {
                if let Some(conn) = connections.get_mut(&device_id).filter(|_| current) {
                    conn.session = Some(session);
                    return Ok(answer);
                }
                drop(connections);
                tracing::info!(
                    "Session {} of {} was replaced or closed during negotiation",
                    session_id,
                    device_id
                );
                session.close().await;
                Err(AdmissionError::Superseded)
            }
            Err(e) => {
                let reserved = if current {
                    connections.remove(&device_id)
                } else {
                    None
                };
                drop(connections);
                if let Some(conn) = reserved {
                    self.teardown(&device_id, conn).await;
                }
                Err(AdmissionError::Negotiation(e.to_string()))
            }
        }
    }

    /// Apply a media session event to its connection
    pub async fn handle_event(&self, event: SessionEvent) {
        let mut connections = self.connections.lock().await;

        let Some(conn) = connections.get_mut(&event.device_id) else {
            tracing::debug!("Event for unknown device {} ignored", event.device_id);
            return;
        };
        if conn.session_id != event.session_id {
            tracing::debug!(
                "Stale event from session {} of {} ignored",
                event.session_id,
                event.device_id
            );
            return;
        }

        let transition = match event.kind {
            SessionEventKind::Track(handle) => {
                if conn.lifecycle.state().is_terminal() {
                    Transition::None
                } else {
                    self.tracks
                        .write()
                        .await
                        .insert(event.device_id.clone(), handle);
                    conn.lifecycle.on_track()
                }
            }
            SessionEventKind::Transport(state) => {
                if state == TransportState::Disconnected {
                    tracing::warn!(
                        "Transport for {} disconnected; waiting for it to recover",
                        event.device_id
                    );
                } else {
                    tracing::debug!("Transport for {} is now {:?}", event.device_id, state);
                }
                conn.lifecycle.on_transport(state)
            }
        };

        match transition {
            Transition::None => {}
            Transition::Establish => {
                let Some(track) = self.tracks.read().await.get(&event.device_id).cloned() else {
                    return;
                };
                let endpoint = self.resolve_endpoint(&event.device_id).await;
                let capture = Arc::new(FrameCaptureLoop::new(
                    event.device_id.clone(),
                    track,
                    endpoint,
                    self.settings.capture.clone(),
                    self.dispatcher.clone(),
                    self.hub.clone(),
                ));
                capture.start();
                conn.capture = Some(capture);
                tracing::info!("Connection for {} established", event.device_id);
            }
            Transition::Terminate(state) => {
                let removed = connections.remove(&event.device_id);
                drop(connections);
                if let Some(conn) = removed {
                    tracing::info!("Connection for {} ended ({:?})", event.device_id, state);
                    self.teardown(&event.device_id, conn).await;
                }
            }
        }
    }

    /// Close a device's connection. Returns false if it had none.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let removed = self.connections.lock().await.remove(device_id);
        match removed {
            Some(mut conn) => {
                conn.lifecycle.close();
                self.teardown(device_id, conn).await;
                true
            }
            None => false,
        }
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (device_id, conn) in drained {
            self.teardown(&device_id, conn).await;
        }
    }

    pub async fn live_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn state(&self, device_id: &str) -> Option<LifecycleState> {
        self.connections
            .lock()
            .await
            .get(device_id)
            .map(|c| c.lifecycle.state())
    }

    pub async fn capture_loop(&self, device_id: &str) -> Option<Arc<FrameCaptureLoop>> {
        self.connections
            .lock()
            .await
            .get(device_id)
            .and_then(|c| c.capture.clone())
    }

    /// One full-quality JPEG from the device's live track
    pub async fn capture_once(&self, device_id: &str) -> Result<Vec<u8>, CaptureError> {
        let track = self
            .tracks
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| CaptureError::NotConnected(device_id.to_string()))?;

        capture_frame(&track, self.settings.capture.frame_wait).await
    }

    /// Look up the device's recognition endpoint again and apply it to the
    /// running capture loop. Returns `None` if the device is not capturing.
    pub async fn refresh_endpoint(&self, device_id: &str) -> Option<String> {
        let capture = self.capture_loop(device_id).await?;
        let endpoint = self.resolve_endpoint(device_id).await;
        capture.set_endpoint(endpoint.clone());
        Some(endpoint)
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let connections = self.connections.lock().await;
        let mut snapshot: Vec<_> = connections
            .iter()
            .map(|(device_id, conn)| ConnectionSnapshot {
                device_id: device_id.clone(),
                state: conn.lifecycle.state(),
                capturing: conn.capture.as_ref().is_some_and(|c| c.is_running()),
                endpoint: conn.capture.as_ref().map(|c| c.endpoint()),
                outstanding_recognitions: conn
                    .capture
                    .as_ref()
                    .map(|c| c.outstanding_tasks())
                    .unwrap_or(0),
                admitted_at: conn.admitted_at,
            })
            .collect();
        snapshot.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshot
    }

    async fn resolve_endpoint(&self, device_id: &str) -> String {
        match self.directory.recognition_endpoint(device_id).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => self.settings.default_endpoint.clone(),
            Err(e) => {
                tracing::warn!(
                    "Endpoint lookup for {} failed, using default: {}",
                    device_id,
                    e
                );
                self.settings.default_endpoint.clone()
            }
        }
    }

    /// Release everything a removed connection owned
    async fn teardown(&self, device_id: &str, conn: DeviceConnection) {
        if let Some(capture) = &conn.capture {
            capture.stop();
        }
        self.tracks.write().await.remove(device_id);
        if let Some(session) = &conn.session {
            session.close().await;
        }
        tracing::debug!("Session {} of {} torn down", conn.session_id, device_id);
    }
}

async fn pump_events(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_secret;
    use crate::directory::{DeviceRecord, MemoryDirectory};
    use crate::relay::gate::ConcurrencyGate;
    use crate::relay::names::{NameCachePolicy, PersonNameResolver};
    use crate::relay::recognition::{RawPrediction, RecognitionBackend, RecognitionError};
    use facerelay_media::FrameFeed;
    use facerelay_protocol::DeviceClass;
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    struct NullBackend;

    #[async_trait]
    impl RecognitionBackend for NullBackend {
        async fn recognize(
            &self,
            _endpoint: &str,
            _jpeg: Vec<u8>,
        ) -> Result<Vec<RawPrediction>, RecognitionError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaSession for FakeSession {
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Answers offers; offers containing "slow" wait for `hold` to be notified
    #[derive(Default)]
    struct FakeFactory {
        sessions: std::sync::Mutex<Vec<(SessionEvents, Arc<FakeSession>)>>,
        hold: tokio::sync::Notify,
    }

    impl FakeFactory {
        fn session(&self, index: usize) -> (SessionEvents, Arc<FakeSession>) {
            self.sessions.lock().unwrap()[index].clone()
        }

        fn negotiated(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn negotiate(
            &self,
            offer: SessionDescription,
            events: SessionEvents,
        ) -> anyhow::Result<(Arc<dyn MediaSession>, SessionDescription)> {
            if offer.sdp.is_empty() {
                anyhow::bail!("empty offer");
            }
            let session = Arc::new(FakeSession::default());
            self.sessions
                .lock()
                .unwrap()
                .push((events, session.clone()));
            if offer.sdp.contains("slow") {
                self.hold.notified().await;
            }
            Ok((session, SessionDescription::answer("v=0 answer".to_string())))
        }
    }

    fn device(id: &str, class: DeviceClass, approved: bool) -> DeviceRecord {
        static HASH: OnceLock<String> = OnceLock::new();
        DeviceRecord {
            device_id: id.to_string(),
            secret_hash: HASH.get_or_init(|| hash_secret("s3cret").unwrap()).clone(),
            approved,
            class,
            recognition_endpoint: None,
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            sdp: "v=0 offer".to_string(),
            kind: "offer".to_string(),
        }
    }

    fn slow_offer() -> SessionDescription {
        SessionDescription {
            sdp: "v=0 slow offer".to_string(),
            kind: "offer".to_string(),
        }
    }

    fn manager(max_connections: usize) -> (Arc<ConnectionManager>, Arc<FakeFactory>) {
        let directory: Arc<dyn Directory> = Arc::new(
            MemoryDirectory::new()
                .with_device(device("kiosk-1", DeviceClass::Kiosk, true))
                .with_device(device("scanner-1", DeviceClass::Scanner, true))
                .with_device(device("display-1", DeviceClass::Display, true))
                .with_device(device("kiosk-new", DeviceClass::Kiosk, false)),
        );
        let hub = Arc::new(BroadcastHub::default());
        let names = Arc::new(PersonNameResolver::new(
            directory.clone(),
            NameCachePolicy::default(),
        ));
        let dispatcher = Arc::new(RecognitionDispatcher::new(
            Arc::new(NullBackend),
            Arc::new(ConcurrencyGate::new(10, 20)),
            names,
            hub.clone(),
            Duration::from_secs(1),
        ));
        let factory = Arc::new(FakeFactory::default());
        let manager = ConnectionManager::new(
            DeviceAuthenticator::new(directory.clone()),
            directory,
            factory.clone(),
            dispatcher,
            hub,
            ManagerSettings {
                max_connections,
                default_endpoint: "http://recognizer.invalid/default".to_string(),
                capture: CaptureSettings {
                    frame_wait: Duration::from_millis(50),
                    sample_interval: Duration::from_millis(100),
                    ..CaptureSettings::default()
                },
            },
        );
        (manager, factory)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn establish(manager: &ConnectionManager, events: &SessionEvents, feed: &FrameFeed) {
        events.track(feed.handle());
        events.transport(TransportState::Connected);
        eventually(move || async move {
            manager.state(events.device_id()).await == Some(LifecycleState::Established)
        })
        .await;
    }

    #[tokio::test]
    async fn admits_and_answers() {
        let (manager, _) = manager(4);

        let answer = manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();

        assert_eq!(answer.kind, "answer");
        assert_eq!(manager.live_count().await, 1);
        assert_eq!(manager.state("kiosk-1").await, Some(LifecycleState::Negotiating));
        assert!(manager.capture_loop("kiosk-1").await.is_none());
    }

    #[tokio::test]
    async fn rejects_bad_devices_with_reasons() {
        let (manager, _) = manager(4);

        let cases = [
            ("ghost", "s3cret", "unregistered_device"),
            ("kiosk-1", "wrong", "invalid_credential"),
            ("kiosk-new", "s3cret", "unapproved_device"),
            ("display-1", "s3cret", "wrong_device_class"),
        ];
        for (device_id, secret, reason) in cases {
            let err = manager.admit(device_id, secret, offer()).await.unwrap_err();
            assert_eq!(err.reason(), Some(reason), "device {}", device_id);
        }
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn enforces_connection_cap() {
        let (manager, _) = manager(1);
        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();

        let err = manager.admit("scanner-1", "s3cret", offer()).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::CapacityExceeded { active: 1, max: 1 }
        ));
        assert_eq!(manager.live_count().await, 1);

        // The connected device may still replace its own session
        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn negotiation_failure_leaves_no_connection() {
        let (manager, _) = manager(4);
        let bad = SessionDescription {
            sdp: String::new(),
            kind: "offer".to_string(),
        };

        let err = manager.admit("kiosk-1", "s3cret", bad).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Negotiation(_)));
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn establishes_only_after_track_and_transport() {
        let (manager, factory) = manager(4);
        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (events, _) = factory.session(0);
        let feed = FrameFeed::new();

        events.transport(TransportState::Connected);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.state("kiosk-1").await, Some(LifecycleState::Negotiating));
        assert!(manager.capture_loop("kiosk-1").await.is_none());

        events.track(feed.handle());
        let m = manager.as_ref();
        eventually(move || async move {
            m.state("kiosk-1").await == Some(LifecycleState::Established)
        })
        .await;

        let capture = manager.capture_loop("kiosk-1").await.unwrap();
        assert!(capture.is_running());
        assert_eq!(capture.endpoint(), "http://recognizer.invalid/default");
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_session() {
        let (manager, factory) = manager(4);
        let feed = FrameFeed::new();

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (first_events, first_session) = factory.session(0);
        establish(&manager, &first_events, &feed).await;
        let first_loop = manager.capture_loop("kiosk-1").await.unwrap();

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();

        assert_eq!(manager.live_count().await, 1);
        assert!(first_session.closed.load(Ordering::SeqCst));
        let first = first_loop.as_ref();
        eventually(move || async move { !first.is_running() }).await;
        assert_eq!(manager.state("kiosk-1").await, Some(LifecycleState::Negotiating));

        // Late events from the replaced session do not touch the new one
        first_events.transport(TransportState::Failed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.live_count().await, 1);

        let (second_events, second_session) = factory.session(1);
        establish(&manager, &second_events, &feed).await;
        assert!(!second_session.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn terminal_state_purges_device() {
        let (manager, factory) = manager(4);
        let feed = FrameFeed::new();

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (events, session) = factory.session(0);
        establish(&manager, &events, &feed).await;
        let capture = manager.capture_loop("kiosk-1").await.unwrap();

        events.transport(TransportState::Failed);
        let m = manager.as_ref();
        eventually(move || async move { m.live_count().await == 0 }).await;

        assert!(session.closed.load(Ordering::SeqCst));
        let c = capture.as_ref();
        eventually(move || async move { !c.is_running() }).await;
        assert!(matches!(
            manager.capture_once("kiosk-1").await,
            Err(CaptureError::NotConnected(_))
        ));
        assert!(manager.refresh_endpoint("kiosk-1").await.is_none());
    }

    #[tokio::test]
    async fn capture_once_reads_the_live_track() {
        let (manager, factory) = manager(4);
        let feed = FrameFeed::new();

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (events, _) = factory.session(0);
        establish(&manager, &events, &feed).await;

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.capture_once("kiosk-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.push(facerelay_media::VideoFrame::new(2, 2, vec![0; 12]).unwrap());

        let jpeg = pending.await.unwrap().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn disconnect_releases_session() {
        let (manager, factory) = manager(4);
        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (_, session) = factory.session(0);

        assert!(manager.disconnect("kiosk-1").await);
        assert!(!manager.disconnect("kiosk-1").await);
        assert!(session.closed.load(Ordering::SeqCst));
        assert!(manager.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn slow_negotiation_does_not_block_other_devices() {
        let (manager, factory) = manager(4);

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.admit("kiosk-1", "s3cret", slow_offer()).await })
        };
        let f = factory.as_ref();
        eventually(move || async move { f.negotiated() == 1 }).await;

        // kiosk-1 is still negotiating; everything else keeps working
        let other = tokio::time::timeout(Duration::from_secs(5), async {
            manager.admit("scanner-1", "s3cret", offer()).await.unwrap();
            manager.snapshot().await
        })
        .await
        .expect("admission blocked by a pending negotiation");
        assert_eq!(other.len(), 2);
        assert_eq!(other[0].state, LifecycleState::Negotiating);

        // Events that arrive before the answer are not lost
        let (events, session) = factory.session(0);
        let feed = FrameFeed::new();
        events.track(feed.handle());
        events.transport(TransportState::Connected);

        factory.hold.notify_one();
        slow.await.unwrap().unwrap();

        let m = manager.as_ref();
        eventually(move || async move {
            m.state("kiosk-1").await == Some(LifecycleState::Established)
        })
        .await;
        assert!(!session.closed.load(Ordering::SeqCst));
        assert_eq!(manager.live_count().await, 2);
    }

    #[tokio::test]
    async fn newer_offer_supersedes_pending_negotiation() {
        let (manager, factory) = manager(4);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.admit("kiosk-1", "s3cret", slow_offer()).await })
        };
        let f = factory.as_ref();
        eventually(move || async move { f.negotiated() == 1 }).await;

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        factory.hold.notify_one();

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, AdmissionError::Superseded));
        assert!(factory.session(0).1.closed.load(Ordering::SeqCst));
        assert!(!factory.session(1).1.closed.load(Ordering::SeqCst));
        assert_eq!(manager.live_count().await, 1);
        assert_eq!(manager.state("kiosk-1").await, Some(LifecycleState::Negotiating));
    }

    #[tokio::test]
    async fn pending_negotiations_count_against_the_cap() {
        let (manager, factory) = manager(1);

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.admit("kiosk-1", "s3cret", slow_offer()).await })
        };
        let f = factory.as_ref();
        eventually(move || async move { f.negotiated() == 1 }).await;

        let err = manager.admit("scanner-1", "s3cret", offer()).await.unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::CapacityExceeded { active: 1, max: 1 }
        ));

        factory.hold.notify_one();
        slow.await.unwrap().unwrap();
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn transient_disconnect_keeps_capturing() {
        let (manager, factory) = manager(4);
        let feed = FrameFeed::new();

        manager.admit("kiosk-1", "s3cret", offer()).await.unwrap();
        let (events, session) = factory.session(0);
        establish(&manager, &events, &feed).await;
        let capture = manager.capture_loop("kiosk-1").await.unwrap();

        events.transport(TransportState::Disconnected);
        events.transport(TransportState::Connected);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(manager.state("kiosk-1").await, Some(LifecycleState::Established));
        assert!(capture.is_running());
        assert!(!session.closed.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(
            &capture,
            &manager.capture_loop("kiosk-1").await.unwrap()
        ));
    }
}
