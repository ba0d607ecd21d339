//! Error types for the audio bridge.
//!
//! Only connectivity-level failures surface here. Per-frame and
//! per-packet failures (codec rejections, resampler hiccups, transport
//! send errors) are handled locally in the pipelines: logged and
//! dropped, never propagated to callers on the hot path.

use crate::codec::CodecError;

/// Fatal errors that prevent a session or one of its components from
/// being created or negotiated.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The signaling connection could not be established.
    #[error("signaling connect failed: {0}")]
    SignalingConnect(String),

    /// The WebRTC engine could not be constructed.
    #[error("webrtc engine error: {0}")]
    Engine(String),

    /// A session description was malformed or could not be applied.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Codec construction or configuration failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Resampler construction failed.
    #[error("resampler error: {0}")]
    Resampler(String),

    /// A transport-level send failed. Transient; the pipelines log and
    /// drop rather than propagate these.
    #[error("transport error: {0}")]
    Transport(String),

    /// The async runtime could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A worker thread could not be spawned.
    #[error("worker spawn failed: {0}")]
    WorkerSpawn(String),
}
