//! Peer connection controller.
//!
//! Owns the negotiation state machine (SDP offer/answer + ICE exchange),
//! buffers locally-discovered candidates until the local description
//! exists, and publishes every connectivity-state transition on the
//! event bus. A fresh `RTCPeerConnection` is built for every negotiation
//! round: a new offer tears the previous connection down first, guarding
//! against a stale mid-negotiation session.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::IceServerConfig;
use crate::config::AudioConfig;
use crate::error::BridgeError;
use crate::event::EventBus;
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::stream::input::InboundPipeline;

/// Connectivity state of the session. Single authoritative value,
/// mutated only by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Failed,
            5 => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Locally-discovered candidates held back until the local description
/// exists. Drained exactly once, in discovery order.
#[derive(Default)]
pub(crate) struct CandidateBuffer {
    pending: Vec<SignalingMessage>,
}

impl CandidateBuffer {
    pub(crate) fn push(&mut self, candidate: SignalingMessage) {
        self.pending.push(candidate);
    }

    pub(crate) fn drain(&mut self) -> Vec<SignalingMessage> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Controller for a single peer connection.
pub struct PeerConnectionController {
    audio: AudioConfig,
    ice_servers: Vec<IceServerConfig>,
    signaling: Arc<SignalingChannel>,
    bus: Arc<EventBus>,
    /// Outgoing audio track. Survives connection resets; re-added to
    /// each fresh connection.
    track: Arc<TrackLocalStaticRTP>,
    connection: tokio::sync::Mutex<Option<Arc<RTCPeerConnection>>>,
    state: Arc<AtomicU8>,
    candidates: Arc<parking_lot::Mutex<CandidateBuffer>>,
    inbound: Arc<InboundPipeline>,
}

impl PeerConnectionController {
    pub fn new(
        audio: AudioConfig,
        ice_servers: Vec<IceServerConfig>,
        signaling: Arc<SignalingChannel>,
        inbound: Arc<InboundPipeline>,
        bus: Arc<EventBus>,
    ) -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: audio.codec_sample_rate,
                channels: audio.channels,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "webrtc-audio-bridge".to_owned(),
        ));

        Self {
            audio,
            ice_servers,
            signaling,
            bus,
            track,
            connection: tokio::sync::Mutex::new(None),
            state: Arc::new(AtomicU8::new(ConnectionState::New as u8)),
            candidates: Arc::new(parking_lot::Mutex::new(CandidateBuffer::default())),
            inbound,
        }
    }

    /// Create the initial peer connection so remote candidates arriving
    /// before any offer have an ICE agent to go to.
    pub async fn init(&self) -> Result<(), BridgeError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.create_peer_connection().await?);
        }
        Ok(())
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The outgoing audio track packets are written to.
    pub fn track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    /// Dispatch an incoming signaling message.
    pub async fn handle_signaling(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { sdp } => {
                if let Err(e) = self.handle_offer(&sdp).await {
                    warn!("offer handling failed: {}", e);
                    self.transition(ConnectionState::Failed);
                }
            }
            SignalingMessage::Answer { sdp } => {
                if let Err(e) = self.handle_answer(&sdp).await {
                    warn!("answer handling failed: {}", e);
                    self.transition(ConnectionState::Failed);
                }
            }
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.apply_remote_candidate(candidate, sdp_mid, sdp_mline_index)
                    .await;
            }
            // Application messages are surfaced through the bus only.
            SignalingMessage::ApplicationEvent(_) => {}
        }
    }

    /// Receiver role: apply a session offer and answer it.
    ///
    /// Any prior connection is torn down and rebuilt before the new
    /// remote description is applied. Offers arriving while already
    /// connected are ignored.
    pub async fn handle_offer(&self, sdp: &str) -> Result<(), BridgeError> {
        if self.state() == ConnectionState::Connected {
            info!("ignoring session offer while connected");
            return Ok(());
        }
        if self.state() == ConnectionState::New {
            self.transition(ConnectionState::Connecting);
        }

        let connection = self.reset().await?;

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| BridgeError::Negotiation(format!("invalid offer sdp: {}", e)))?;
        connection
            .set_remote_description(offer)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("set remote description: {}", e)))?;

        let answer = connection
            .create_answer(None)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("create answer: {}", e)))?;
        connection
            .set_local_description(answer)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("set local description: {}", e)))?;

        // Local description now exists: release everything buffered.
        self.flush_candidates().await;

        if let Some(local) = connection.local_description().await {
            self.signaling
                .send(&SignalingMessage::Answer { sdp: local.sdp })
                .await;
        }

        Ok(())
    }

    /// Sender role: create an offer and send it over signaling.
    pub async fn initiate(&self) -> Result<(), BridgeError> {
        if self.state() == ConnectionState::New {
            self.transition(ConnectionState::Connecting);
        }

        self.init().await?;
        let guard = self.connection.lock().await;
        let connection = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Negotiation("no connection".to_string()))?
            .clone();
        drop(guard);

        let offer = connection
            .create_offer(None)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("create offer: {}", e)))?;
        connection
            .set_local_description(offer)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("set local description: {}", e)))?;

        self.flush_candidates().await;

        if let Some(local) = connection.local_description().await {
            self.signaling
                .send(&SignalingMessage::Offer { sdp: local.sdp })
                .await;
        }

        Ok(())
    }

    /// Apply a session answer from the remote peer.
    pub async fn handle_answer(&self, sdp: &str) -> Result<(), BridgeError> {
        let guard = self.connection.lock().await;
        let connection = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Negotiation("answer without a connection".to_string()))?
            .clone();
        drop(guard);

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| BridgeError::Negotiation(format!("invalid answer sdp: {}", e)))?;
        connection
            .set_remote_description(answer)
            .await
            .map_err(|e| BridgeError::Negotiation(format!("set remote description: {}", e)))?;

        Ok(())
    }

    /// Apply a remote ICE candidate immediately, regardless of
    /// remote-description state. The ICE agent treats early candidates
    /// as no-op-safe; a rejection is logged, never propagated.
    pub async fn apply_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) {
        if candidate.is_empty() {
            return;
        }

        let guard = self.connection.lock().await;
        let connection = match guard.as_ref() {
            Some(c) => c.clone(),
            None => {
                warn!("remote candidate arrived before any connection exists, dropping");
                return;
            }
        };
        drop(guard);

        if connection.remote_description().await.is_none() {
            info!("applying remote candidate before remote description is set");
        }

        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        };
        if let Err(e) = connection.add_ice_candidate(init).await {
            warn!("ICE agent rejected remote candidate: {}", e);
        } else {
            debug!("remote candidate added");
        }
    }

    /// Explicit teardown.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            if let Err(e) = connection.close().await {
                warn!("failed to close peer connection: {}", e);
            }
        }
        self.candidates.lock().clear();
    }

    fn transition(&self, new_state: ConnectionState) {
        self.state.store(new_state as u8, Ordering::SeqCst);
        self.bus.publish_state(new_state);
    }

    /// Tear down any existing connection and build a fresh one.
    async fn reset(&self) -> Result<Arc<RTCPeerConnection>, BridgeError> {
        let mut guard = self.connection.lock().await;
        if let Some(old) = guard.take() {
            debug!("tearing down previous peer connection before renegotiation");
            if let Err(e) = old.close().await {
                warn!("failed to close previous peer connection: {}", e);
            }
        }
        self.candidates.lock().clear();

        let connection = self.create_peer_connection().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn flush_candidates(&self) {
        let pending = self.candidates.lock().drain();
        if pending.is_empty() {
            return;
        }
        debug!("flushing {} buffered local candidates", pending.len());
        for message in pending {
            self.signaling.send(&message).await;
        }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, BridgeError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| BridgeError::Engine(format!("register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| BridgeError::Engine(format!("register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| s.to_rtc_ice_server())
                .collect(),
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| BridgeError::Engine(format!("create peer connection: {}", e)))?,
        );

        connection
            .add_transceiver_from_track(
                self.track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| BridgeError::Engine(format!("add transceiver: {}", e)))?;

        // Locally discovered candidates: transmit immediately when the
        // local description exists, otherwise buffer for the flush.
        let signaling = self.signaling.clone();
        let candidates = self.candidates.clone();
        let weak = Arc::downgrade(&connection);
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = signaling.clone();
            let candidates = candidates.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(c) => c,
                    None => return,
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("failed to serialize local candidate: {}", e);
                        return;
                    }
                };
                let message = SignalingMessage::IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };

                let connection = match weak.upgrade() {
                    Some(c) => c,
                    None => return,
                };
                if connection.local_description().await.is_some() {
                    // Preserve discovery order: anything still buffered
                    // goes out before this candidate.
                    let pending = candidates.lock().drain();
                    for earlier in pending {
                        signaling.send(&earlier).await;
                    }
                    signaling.send(&message).await;
                } else {
                    debug!("local candidate buffered until local description is available");
                    candidates.lock().push(message);
                }
            })
        }));

        let state = self.state.clone();
        let bus = self.bus.clone();
        connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let new_state = ConnectionState::from(s);
            info!("peer connection state: {:?}", new_state);
            state.store(new_state as u8, Ordering::SeqCst);
            bus.publish_state(new_state);
            Box::pin(async {})
        }));

        self.inbound.attach(&connection);

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AudioFormat;
    use crate::stream::input::PlaybackBuffer;

    fn candidate_message(n: u32) -> SignalingMessage {
        SignalingMessage::IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn test_candidate_buffer_drains_in_order_once() {
        let mut buffer = CandidateBuffer::default();
        buffer.push(candidate_message(1));
        buffer.push(candidate_message(2));
        buffer.push(candidate_message(3));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        let candidates: Vec<String> = drained
            .iter()
            .map(|m| match m {
                SignalingMessage::IceCandidate { candidate, .. } => candidate.clone(),
                _ => panic!("unexpected message"),
            })
            .collect();
        assert_eq!(candidates, ["candidate:1", "candidate:2", "candidate:3"]);

        // A second drain yields nothing.
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(ConnectionState::from_u8(2), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_u8(99), ConnectionState::New);
    }

    fn test_controller(bus: Arc<EventBus>) -> PeerConnectionController {
        let audio = AudioConfig::default();
        // Retry cap 0 so sends to the unreachable endpoint drop fast.
        let signaling = Arc::new(SignalingChannel::new(
            "ws://127.0.0.1:9".to_string(),
            None,
            0,
            bus.clone(),
        ));
        let inbound = Arc::new(InboundPipeline::new(
            AudioFormat::new(audio.codec_sample_rate, audio.channels),
            Arc::new(PlaybackBuffer::new()),
            bus.clone(),
        ));
        PeerConnectionController::new(audio, vec![], signaling, inbound, bus)
    }

    #[tokio::test]
    async fn test_remote_candidate_before_offer_is_tolerated() {
        let bus = Arc::new(EventBus::new());
        let controller = test_controller(bus);
        controller.init().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::New);

        controller
            .apply_remote_candidate(
                "candidate:1 1 UDP 2130706431 192.168.1.7 50000 typ host".to_string(),
                Some("0".to_string()),
                Some(0),
            )
            .await;
        // No panic and no state change: the candidate is deferred-useful.
        assert_eq!(controller.state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_malformed_offer_fails_state() {
        let bus = Arc::new(EventBus::new());
        let controller = test_controller(bus);
        controller.init().await.unwrap();

        controller
            .handle_signaling(SignalingMessage::Offer {
                sdp: "this is not sdp".to_string(),
            })
            .await;
        assert_eq!(controller.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_offer_produces_local_answer() {
        let bus = Arc::new(EventBus::new());
        let controller = test_controller(bus.clone());
        controller.init().await.unwrap();

        // A second in-process peer produces a genuine offer.
        let remote = test_controller(Arc::new(EventBus::new()));
        remote.init().await.unwrap();
        remote.initiate().await.unwrap();
        let offer_sdp = {
            let guard = remote.connection.lock().await;
            guard
                .as_ref()
                .unwrap()
                .local_description()
                .await
                .unwrap()
                .sdp
        };

        controller.handle_offer(&offer_sdp).await.unwrap();

        let guard = controller.connection.lock().await;
        let local = guard.as_ref().unwrap().local_description().await;
        assert!(local.is_some(), "answer should be set as local description");
    }
}
