//! Configuration for the audio bridge.
//!
//! Everything is passed explicitly at construction time. There is no
//! process-wide configuration object; each component receives the piece
//! of configuration it needs when it is built.

/// Audio pipeline configuration.
///
/// Defaults match the common DAW-to-WebRTC setup: 44.1kHz host audio,
/// stereo, encoded as 48kHz OPUS in 20ms frames.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate of the host (capture/render) boundary in Hz.
    pub host_sample_rate: u32,
    /// Sample rate the codec operates at (48000 for WebRTC OPUS).
    pub codec_sample_rate: u32,
    /// Number of interleaved channels (1 or 2).
    pub channels: u16,
    /// Frame duration in milliseconds. Also bounds the outbound worker's
    /// wait-for-work timeout.
    pub frame_duration_ms: u32,
    /// Requested OPUS bitrate in bits per second.
    pub codec_bitrate: u32,
    /// Enable automatic bitrate after applying the explicit request.
    /// When set, `codec_bitrate` is effectively advisory.
    pub auto_bitrate: bool,
    /// Enable in-band forward error correction.
    pub fec_enabled: bool,
    /// Expected packet loss percentage hint for the encoder (0-100).
    pub expected_packet_loss_pct: u8,
    /// Encoder complexity (0-10).
    pub complexity: u8,
    /// RTP payload type for outgoing packets.
    pub payload_type: u8,
    /// RTP synchronization source identifier.
    pub ssrc: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            host_sample_rate: 44_100,
            codec_sample_rate: 48_000,
            channels: 2,
            frame_duration_ms: 20,
            codec_bitrate: 96_000,
            auto_bitrate: true,
            fec_enabled: true,
            expected_packet_loss_pct: 10,
            complexity: 5,
            payload_type: 111,
            ssrc: 12345,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one frame at the host rate.
    pub fn host_frame_samples_per_channel(&self) -> usize {
        (self.host_sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Total interleaved samples in one frame at the host rate.
    pub fn host_frame_samples_total(&self) -> usize {
        self.host_frame_samples_per_channel() * self.channels as usize
    }
}

/// Read-only identity of the current user, provided by the external
/// auth collaborator. Only consulted for diagnostics.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: String,
}

/// Top-level session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket signaling endpoint (full URL including route).
    pub signaling_url: String,
    /// Optional bearer credential attached as an Authorization header,
    /// sourced from the external credential store.
    pub bearer_token: Option<String>,
    /// STUN server for ICE gathering.
    pub stun_server: String,
    /// Diagnostics endpoint for best-effort crash reports. `None`
    /// disables reporting.
    pub diagnostics_url: Option<String>,
    /// Current user identity, if any.
    pub user: Option<UserIdentity>,
    /// Maximum reconnect-and-retry attempts for a signaling send.
    pub send_retry_cap: u32,
    /// Audio pipeline configuration.
    pub audio: AudioConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:5055/session".to_string(),
            bearer_token: None,
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            diagnostics_url: None,
            user: None,
            send_retry_cap: 3,
            audio: AudioConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_frame_samples() {
        let config = AudioConfig::default();
        // 20ms at 44.1kHz stereo
        assert_eq!(config.host_frame_samples_per_channel(), 882);
        assert_eq!(config.host_frame_samples_total(), 1764);
    }

    #[test]
    fn test_host_frame_samples_48k() {
        let config = AudioConfig {
            host_sample_rate: 48_000,
            ..Default::default()
        };
        assert_eq!(config.host_frame_samples_per_channel(), 960);
        assert_eq!(config.host_frame_samples_total(), 1920);
    }
}
