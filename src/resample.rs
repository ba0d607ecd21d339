//! Sample-rate conversion between the host rate and the codec rate.
//!
//! Wraps `rubato` behind an interleaved-PCM interface: the pipeline
//! slices fixed-size interleaved frames at the host rate and gets
//! interleaved frames at the codec rate back. Equal rates pass through
//! untouched.

use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

use crate::error::BridgeError;

/// Converts interleaved f32 PCM between two sample rates, preserving
/// channel interleaving. Operates on fixed-size input frames.
pub struct SampleRateConverter {
    /// `None` when source and target rates are equal (passthrough).
    inner: Option<SincFixedIn<f32>>,
    channels: usize,
    /// Input frame length in samples per channel.
    input_frames: usize,
    /// Deinterleave scratch, one buffer per channel.
    channel_bufs: Vec<Vec<f32>>,
}

impl SampleRateConverter {
    /// Create a converter for fixed input frames of
    /// `input_frames` samples per channel.
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: u16,
        input_frames: usize,
    ) -> Result<Self, BridgeError> {
        let channels = channels as usize;

        let inner = if source_rate == target_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = target_rate as f64 / source_rate as f64;
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input_frames, channels)
                .map_err(|e| BridgeError::Resampler(e.to_string()))?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            channels,
            input_frames,
            channel_bufs: vec![vec![0.0; input_frames]; channels],
        })
    }

    /// Convert one interleaved frame. The input must hold exactly the
    /// configured frame length for every channel.
    ///
    /// Returns the converted interleaved samples; may legitimately be
    /// shorter or longer than a naive ratio estimate while the filter
    /// settles.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, BridgeError> {
        if interleaved.len() != self.input_frames * self.channels {
            return Err(BridgeError::Resampler(format!(
                "expected {} samples, got {}",
                self.input_frames * self.channels,
                interleaved.len()
            )));
        }

        let resampler = match self.inner.as_mut() {
            Some(r) => r,
            None => return Ok(interleaved.to_vec()),
        };

        for (ch, buf) in self.channel_bufs.iter_mut().enumerate() {
            for (frame, sample) in buf.iter_mut().enumerate() {
                *sample = interleaved[frame * self.channels + ch];
            }
        }

        let output = resampler
            .process(&self.channel_bufs, None)
            .map_err(|e| BridgeError::Resampler(e.to_string()))?;

        let out_frames = output.first().map(|c| c.len()).unwrap_or(0);
        let mut out = vec![0.0f32; out_frames * self.channels];
        for (ch, channel) in output.iter().enumerate() {
            for (frame, &sample) in channel.iter().enumerate() {
                out[frame * self.channels + ch] = sample;
            }
        }

        Ok(out)
    }

    /// Output samples per channel for a full input frame, estimated from
    /// the rate ratio.
    pub fn channels(&self) -> usize {
        self.channels
    }
}
