//! WebRTC media sessions for devices
//!
//! Devices publish one H.264 video track. The relay only receives: it answers
//! the device's offer, reads the inbound track and reports track and transport
//! changes back to the connection manager.

mod track_reader;

pub use track_reader::spawn_reader;

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use facerelay_media::DecoderFactory;
use facerelay_protocol::SessionDescription;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::relay::{MediaSession, SessionEvents, SessionFactory, TransportState};

/// How often to ask the device for a keyframe
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// H.264 profiles accepted from devices, with their payload types
const H264_PROFILES: [(u8, &str); 2] = [
    // Constrained baseline, level 3.1
    (102, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
    // Baseline, level 3.1
    (96, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
];

pub struct WebRtcSessionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    decoders: Arc<dyn DecoderFactory>,
    gather_timeout: Duration,
}

impl WebRtcSessionFactory {
    pub fn new(stun_servers: Vec<String>, decoders: Arc<dyn DecoderFactory>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        for (payload_type, fmtp) in H264_PROFILES {
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/H264".to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: fmtp.to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let ice_servers = stun_servers
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            decoders,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
        })
    }

    /// Longest wait for ICE gathering before answering with the candidates
    /// found so far
    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    async fn answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        offer: SessionDescription,
        events: SessionEvents,
    ) -> Result<SessionDescription> {
        let device_id = events.device_id().to_string();
        let track_events = events.clone();
        let decoders = self.decoders.clone();
        let weak_pc = Arc::downgrade(pc);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let decoders = decoders.clone();
            let pc = weak_pc.clone();

            Box::pin(async move {
                if track.kind() != RTPCodecType::Video {
                    tracing::debug!(
                        "Ignoring {:?} track from {}",
                        track.kind(),
                        events.device_id()
                    );
                    return;
                }

                let ssrc = track.ssrc();
                let handle = spawn_reader(track, events.device_id().to_string(), decoders);
                events.track(handle);
                tokio::spawn(request_keyframes(pc, ssrc));
            })
        }));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!("Peer connection for {} is {}", events.device_id(), state);
                if let Some(state) = transport_state(state) {
                    events.transport(state);
                }
            })
        }));

        let remote = RTCSessionDescription::offer(offer.sdp)?;
        pc.set_remote_description(remote).await?;

        let answer = pc.create_answer(None).await?;
        // Answer with every candidate inlined; devices do not trickle
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;
        if tokio::time::timeout(self.gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                "ICE gathering for {} incomplete after {:?}; answering with partial candidates",
                device_id,
                self.gather_timeout
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after negotiation"))?;

        Ok(SessionDescription::answer(local.sdp))
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn negotiate(
        &self,
        offer: SessionDescription,
        events: SessionEvents,
    ) -> Result<(Arc<dyn MediaSession>, SessionDescription)> {
        if offer.kind != "offer" {
            anyhow::bail!("expected an offer, got '{}'", offer.kind);
        }

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        match self.answer(&pc, offer, events).await {
            Ok(answer) => Ok((Arc::new(WebRtcSession { pc }), answer)),
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    tracing::warn!("Error closing failed peer connection: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Periodic PLIs so sampling never waits long for a decodable frame
async fn request_keyframes(pc: Weak<RTCPeerConnection>, media_ssrc: u32) {
    let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(pc) = pc.upgrade() else {
            break;
        };
        if pc.connection_state() == RTCPeerConnectionState::Closed {
            break;
        }

        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            tracing::debug!("Keyframe request failed, stopping: {}", e);
            break;
        }
    }
}
