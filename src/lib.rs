//! webrtc-audio-bridge: real-time audio between a host audio callback
//! and a remote WebRTC peer.
//!
//! A WebSocket signaling channel negotiates the session (SDP offer and
//! answer plus ICE candidates as JSON envelopes); once connectivity
//! reaches Connected, a dedicated worker drains captured audio blocks
//! in timestamp order, resamples them to the codec rate, encodes OPUS
//! frames and sends RTP packets over the media track. Received media is
//! decoded into a lock-guarded handoff buffer the render callback pulls
//! from, with silence on shortfall.
//!
//! ## Features
//!
//! - **Bidirectional audio**: host callback -> WebRTC and WebRTC -> host
//! - **OPUS codec**: 48kHz, 20ms frames, in-band FEC
//! - **Sample-rate conversion**: any host rate to the codec rate
//! - **Real-time safe boundaries**: capture enqueues, render pulls;
//!   nothing on those paths blocks
//! - **Resilient signaling**: bounded reconnect-and-retry on send

pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod peer;
pub mod resample;
pub mod rtp;
pub mod session;
pub mod signaling;
pub mod stream;

pub use config::{AudioConfig, SessionConfig, UserIdentity};
pub use error::BridgeError;
pub use event::{AudioEvent, ChannelEvent, EventBus};
pub use peer::{ConnectionState, IceServerConfig, PeerConnectionController};
pub use rtp::{RtpHeader, TransportPacket};
pub use session::Session;
pub use signaling::{SignalingChannel, SignalingMessage};
pub use stream::{AudioBlock, InboundPipeline, OutboundPipeline, PacketSink, PlaybackBuffer};
