//! OPUS codec adapter.
//!
//! Wraps the `audiopus` encoder/decoder. The encoder is configured once
//! at construction and enforces the legal OPUS frame-size set: requested
//! frame lengths snap up to the nearest legal size with zero padding,
//! never truncation.

use bytes::Bytes;
use log::{debug, warn};

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Bandwidth, Bitrate, Channels, SampleRate};

use super::{AudioFormat, CodecError};

/// Maximum size of an encoded OPUS frame in bytes.
const MAX_OPUS_PACKET_SIZE: usize = 4000;

/// Maximum decoded samples per channel (60ms at 48kHz).
const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 2880;

/// Encoder configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Requested bitrate in bits per second.
    pub bitrate: u32,
    /// Switch to automatic bitrate after applying the explicit request.
    pub auto_bitrate: bool,
    /// Enable in-band forward error correction.
    pub fec_enabled: bool,
    /// Expected packet loss percentage (0-100).
    pub expected_packet_loss_pct: u8,
    /// Complexity (0-10).
    pub complexity: u8,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate: 96_000,
            auto_bitrate: true,
            fec_enabled: true,
            expected_packet_loss_pct: 10,
            complexity: 5,
        }
    }
}

fn to_sample_rate(rate: u32) -> Result<SampleRate, CodecError> {
    match rate {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(CodecError::UnsupportedFormat(format!(
            "sample rate {} Hz",
            other
        ))),
    }
}

fn to_channels(channels: u16) -> Result<Channels, CodecError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(CodecError::UnsupportedFormat(format!("{} channels", n))),
    }
}

/// OPUS encoder wrapper.
pub struct Encoder {
    inner: OpusEncoder,
    format: AudioFormat,
    /// Scratch buffer for zero-padded frames.
    scratch: Vec<f32>,
}

impl Encoder {
    /// Create a new encoder for the given format.
    ///
    /// The bitrate request is applied first; when `auto_bitrate` is set
    /// the encoder is then switched to automatic mode, which makes the
    /// explicit request advisory.
    pub fn new(format: AudioFormat, settings: &EncoderSettings) -> Result<Self, CodecError> {
        let sample_rate = to_sample_rate(format.sample_rate)?;
        let channels = to_channels(format.channels)?;

        let mut inner = OpusEncoder::new(sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;

        inner
            .set_bitrate(Bitrate::BitsPerSecond(settings.bitrate as i32))
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;
        if settings.auto_bitrate {
            inner
                .set_bitrate(Bitrate::Auto)
                .map_err(|e| CodecError::LibraryError(e.to_string()))?;
        }
        inner
            .set_bandwidth(Bandwidth::Wideband)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;
        inner
            .set_packet_loss_perc(settings.expected_packet_loss_pct)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;
        inner
            .set_complexity(settings.complexity)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;
        inner
            .set_inband_fec(settings.fec_enabled)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;

        Ok(Self {
            inner,
            format,
            scratch: Vec::new(),
        })
    }

    /// The format this encoder was built for.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Encode one frame of interleaved PCM.
    ///
    /// `samples_per_channel` is the requested frame length; it snaps up
    /// to the nearest legal OPUS frame size and the input is zero-padded
    /// to match. Returns the encoded payload, or empty bytes when the
    /// codec rejects the frame.
    pub fn encode_frame(&mut self, pcm: &[f32], samples_per_channel: usize) -> Bytes {
        let channels = self.format.channels as usize;
        if pcm.is_empty() || pcm.len() != samples_per_channel * channels {
            warn!(
                "encode_frame: {} samples do not match {} per channel x {} channels",
                pcm.len(),
                samples_per_channel,
                channels
            );
            return Bytes::new();
        }

        let frame_size = self.format.snap_frame_size(samples_per_channel);
        self.scratch.clear();
        self.scratch.extend_from_slice(pcm);
        self.scratch.resize(frame_size * channels, 0.0);

        let mut output = vec![0u8; MAX_OPUS_PACKET_SIZE];
        match self.inner.encode_float(&self.scratch, &mut output) {
            Ok(len) => {
                output.truncate(len);
                Bytes::from(output)
            }
            Err(e) => {
                debug!("opus encode rejected frame of {} samples: {}", frame_size, e);
                Bytes::new()
            }
        }
    }
}

/// OPUS decoder wrapper.
pub struct Decoder {
    inner: OpusDecoder,
    format: AudioFormat,
}

impl Decoder {
    /// Create a new decoder for the given format.
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let sample_rate = to_sample_rate(format.sample_rate)?;
        let channels = to_channels(format.channels)?;

        let inner = OpusDecoder::new(sample_rate, channels)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;

        Ok(Self { inner, format })
    }

    /// The format this decoder was built for.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Decode an OPUS payload to interleaved PCM.
    pub fn decode(&mut self, payload: &[u8], fec: bool) -> Result<Vec<f32>, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::InvalidInput);
        }

        let channels = self.format.channels as usize;
        let mut output = vec![0f32; MAX_DECODED_SAMPLES_PER_CHANNEL * channels];

        let samples_per_channel = self
            .inner
            .decode_float(Some(payload), &mut output, fec)
            .map_err(|e| CodecError::LibraryError(e.to_string()))?;

        output.truncate(samples_per_channel * channels);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(samples_per_channel: usize, channels: usize) -> Vec<f32> {
        (0..samples_per_channel * channels)
            .map(|i| (i as f32 * 0.02).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_encode_legal_frame() {
        let mut encoder =
            Encoder::new(AudioFormat::standard(), &EncoderSettings::default()).unwrap();
        let pcm = sine_frame(960, 2);
        let payload = encoder.encode_frame(&pcm, 960);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_encode_snaps_and_pads() {
        let mut encoder =
            Encoder::new(AudioFormat::standard(), &EncoderSettings::default()).unwrap();
        // 700 samples per channel snaps up to 960 with zero padding.
        let pcm = sine_frame(700, 2);
        let payload = encoder.encode_frame(&pcm, 700);
        assert!(!payload.is_empty());
    }

    #[test]
    fn test_encode_mismatched_input_is_empty() {
        let mut encoder =
            Encoder::new(AudioFormat::standard(), &EncoderSettings::default()).unwrap();
        let pcm = sine_frame(960, 2);
        // Claimed frame length does not match the buffer.
        let payload = encoder.encode_frame(&pcm, 480);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_encode_empty_input_is_empty() {
        let mut encoder =
            Encoder::new(AudioFormat::standard(), &EncoderSettings::default()).unwrap();
        let payload = encoder.encode_frame(&[], 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_roundtrip_sample_count() {
        let format = AudioFormat::standard();
        let mut encoder = Encoder::new(format, &EncoderSettings::default()).unwrap();
        let mut decoder = Decoder::new(format).unwrap();

        let pcm = sine_frame(960, 2);
        let payload = encoder.encode_frame(&pcm, 960);
        assert!(!payload.is_empty());

        let decoded = decoder.decode(&payload, false).unwrap();
        assert_eq!(decoded.len(), 960 * 2);
    }

    #[test]
    fn test_decode_empty_payload_rejected() {
        let mut decoder = Decoder::new(AudioFormat::standard()).unwrap();
        assert!(decoder.decode(&[], false).is_err());
    }

    #[test]
    fn test_unsupported_rate_rejected() {
        let result = Encoder::new(AudioFormat::new(44_100, 2), &EncoderSettings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_channels_rejected() {
        let result = Encoder::new(AudioFormat::new(48_000, 6), &EncoderSettings::default());
        assert!(result.is_err());
    }
}
