//! Top-level session object.
//!
//! Owns the async runtime, the event bus, the signaling channel, the
//! peer connection controller and both media pipelines, and wires them
//! together: signaling messages dispatch to the controller, and
//! connectivity-state notifications drive the outbound worker — only
//! the Connected state starts it, any other state stops it.

use std::sync::Arc;

use log::warn;

use crate::codec::AudioFormat;
use crate::config::SessionConfig;
use crate::diagnostics;
use crate::error::BridgeError;
use crate::event::EventBus;
use crate::peer::{ConnectionState, IceServerConfig, PeerConnectionController};
use crate::signaling::SignalingChannel;
use crate::stream::input::{InboundPipeline, PlaybackBuffer};
use crate::stream::output::{AudioBlock, OutboundPipeline, WebRtcPacketSink};

/// A live audio-bridge session.
pub struct Session {
    runtime: tokio::runtime::Runtime,
    bus: Arc<EventBus>,
    signaling: Arc<SignalingChannel>,
    controller: Arc<PeerConnectionController>,
    outbound: Arc<OutboundPipeline>,
    playback: Arc<PlaybackBuffer>,
}

impl Session {
    /// Construct a session from explicit configuration. Nothing
    /// connects yet; call [`Session::connect`].
    pub fn new(config: SessionConfig) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| BridgeError::Runtime(e.to_string()))?;

        let bus = Arc::new(EventBus::new());

        let signaling = Arc::new(SignalingChannel::new(
            config.signaling_url.clone(),
            config.bearer_token.clone(),
            config.send_retry_cap,
            bus.clone(),
        ));

        let playback = Arc::new(PlaybackBuffer::new());
        let codec_format = AudioFormat::new(config.audio.codec_sample_rate, config.audio.channels);
        let inbound = Arc::new(InboundPipeline::new(
            codec_format,
            playback.clone(),
            bus.clone(),
        ));

        let ice_servers = vec![IceServerConfig::stun(&config.stun_server)];
        let controller = Arc::new(PeerConnectionController::new(
            config.audio.clone(),
            ice_servers,
            signaling.clone(),
            inbound,
            bus.clone(),
        ));

        let sink = Arc::new(WebRtcPacketSink::new(
            controller.track(),
            runtime.handle().clone(),
        ));
        let outbound = Arc::new(OutboundPipeline::new(
            config.audio.clone(),
            sink,
            bus.clone(),
        ));

        // Only Connected runs the outbound worker; every other state
        // stops it, unconditionally and idempotently.
        let outbound_for_state = outbound.clone();
        bus.on_state_change(move |state| {
            if *state == ConnectionState::Connected {
                if let Err(e) = outbound_for_state.start() {
                    warn!("failed to start outbound pipeline: {}", e);
                }
            } else {
                outbound_for_state.stop();
            }
        });

        if let Some(endpoint) = &config.diagnostics_url {
            diagnostics::install_panic_hook(endpoint.clone(), config.user.clone());
        }

        Ok(Self {
            runtime,
            bus,
            signaling,
            controller,
            outbound,
            playback,
        })
    }

    /// Open the signaling channel and prepare the peer connection.
    /// Incoming messages dispatch to the controller from here on.
    pub fn connect(&self) -> Result<(), BridgeError> {
        let controller = self.controller.clone();
        let handle = self.runtime.handle().clone();
        self.signaling.set_handler(move |message| {
            let controller = controller.clone();
            handle.spawn(async move {
                controller.handle_signaling(message).await;
            });
        });

        self.runtime.block_on(async {
            self.controller.init().await?;
            self.signaling.connect().await
        })
    }

    /// Sender role: kick off negotiation by sending an offer.
    pub fn initiate(&self) -> Result<(), BridgeError> {
        self.runtime.block_on(self.controller.initiate())
    }

    /// Capture boundary: hand one block to the outbound pipeline.
    /// Never blocks.
    pub fn enqueue_capture_block(&self, block: AudioBlock) {
        self.outbound.enqueue(block);
    }

    /// Render boundary: fill `out` with decoded audio, silence for any
    /// shortfall. Returns the number of real samples written.
    pub fn read_render(&self, out: &mut [f32]) -> usize {
        self.playback.read(out)
    }

    /// Current connectivity state.
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Whether the signaling channel is open.
    pub fn is_signaling_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// The session's notification registry.
    pub fn events(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Stop the pipelines and tear everything down.
    pub fn disconnect(&self) {
        self.outbound.stop();
        self.playback.clear();
        self.runtime.block_on(async {
            self.controller.close().await;
            self.signaling.close().await;
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;

    fn offline_config() -> SessionConfig {
        SessionConfig {
            signaling_url: "ws://127.0.0.1:9/session".to_string(),
            send_retry_cap: 0,
            audio: AudioConfig::default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_session_starts_in_new_state() {
        let session = Session::new(offline_config()).unwrap();
        assert_eq!(session.state(), ConnectionState::New);
        assert!(!session.is_signaling_connected());
    }

    #[test]
    fn test_render_before_any_media_is_silence() {
        let session = Session::new(offline_config()).unwrap();
        let mut out = [7.0f32; 128];
        assert_eq!(session.read_render(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_enqueue_before_connected_is_dropped() {
        let session = Session::new(offline_config()).unwrap();
        session.enqueue_capture_block(AudioBlock {
            samples: vec![0.0; 1764],
            channels: 2,
            sample_count: 882,
            sample_rate: 44_100,
            timestamp: 1,
        });
        // The worker only runs in the Connected state.
        assert_eq!(session.state(), ConnectionState::New);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let session = Session::new(offline_config()).unwrap();
        session.disconnect();
        session.disconnect();
    }
}
