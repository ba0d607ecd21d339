//! Audio codec support.
//!
//! OPUS is the only codec: it is mandatory for WebRTC audio and operates
//! on a fixed set of legal frame durations (2.5 to 60 ms).

pub mod opus;

/// Common codec error type
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Invalid input data
    #[error("invalid input data")]
    InvalidInput,
    /// Unsupported sample rate or channel layout
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Codec library error
    #[error("codec library error: {0}")]
    LibraryError(String),
}

/// Audio format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g., 48000)
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Standard format: 48kHz stereo (required for WebRTC)
    pub fn standard() -> Self {
        Self::new(48_000, 2)
    }

    /// Samples per millisecond (per channel)
    pub fn samples_per_ms(&self) -> usize {
        (self.sample_rate as usize) / 1000
    }

    /// Samples per channel per frame for given duration
    pub fn samples_per_channel(&self, duration_ms: usize) -> usize {
        self.samples_per_ms() * duration_ms
    }

    /// Total samples per frame for given duration (samples * channels)
    pub fn total_samples_per_frame(&self, duration_ms: usize) -> usize {
        self.samples_per_channel(duration_ms) * self.channels as usize
    }

    /// Legal OPUS frame sizes in samples per channel, ascending.
    /// These correspond to 2.5, 5, 10, 20, 40 and 60 ms frames.
    pub fn legal_frame_sizes(&self) -> [usize; 6] {
        let sr = self.sample_rate as usize;
        [sr / 400, sr / 200, sr / 100, sr / 50, sr / 25, (sr * 3) / 50]
    }

    /// Snap a requested frame size (samples per channel) up to the
    /// nearest legal size at or above it. Requests beyond the largest
    /// legal size use the largest.
    pub fn snap_frame_size(&self, requested: usize) -> usize {
        let sizes = self.legal_frame_sizes();
        sizes
            .iter()
            .copied()
            .find(|&s| s >= requested)
            .unwrap_or(sizes[5])
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::standard()
    }
}
