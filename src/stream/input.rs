//! Inbound pipeline: remote track -> decoded PCM -> render boundary.
//!
//! The track reader publishes a receipt notification for every raw
//! payload, decodes it, and pushes the PCM into the playback buffer.
//! The render callback pulls exactly the sample count it needs; when
//! the buffer runs dry the shortfall is silence, never a stall.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::opus::Decoder;
use crate::codec::AudioFormat;
use crate::event::{AudioEvent, EventBus};

/// Decoded-block FIFO between asynchronous network receipt and the
/// synchronous render callback.
///
/// The lock is held only for queue manipulation and the copy into the
/// caller's buffer; decode work never happens under it.
pub struct PlaybackBuffer {
    inner: parking_lot::Mutex<PlaybackInner>,
}

struct PlaybackInner {
    queue: VecDeque<Vec<f32>>,
    /// Block currently being consumed.
    current: Vec<f32>,
    /// Read position within `current`.
    position: usize,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(PlaybackInner {
                queue: VecDeque::new(),
                current: Vec::new(),
                position: 0,
            }),
        }
    }

    /// Queue one decoded block. Empty blocks are ignored.
    pub fn push(&self, block: Vec<f32>) {
        if block.is_empty() {
            return;
        }
        self.inner.lock().queue.push_back(block);
    }

    /// Fill `out` completely, splitting or concatenating queued blocks
    /// as needed. Any shortfall is rendered as silence. Returns how many
    /// samples came from real audio.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut written = 0;
        {
            let mut inner = self.inner.lock();
            while written < out.len() {
                if inner.position >= inner.current.len() {
                    match inner.queue.pop_front() {
                        Some(block) => {
                            inner.current = block;
                            inner.position = 0;
                        }
                        None => break,
                    }
                }
                let available = inner.current.len() - inner.position;
                let needed = out.len() - written;
                let count = available.min(needed);
                let start = inner.position;
                out[written..written + count]
                    .copy_from_slice(&inner.current[start..start + count]);
                written += count;
                inner.position += count;
            }
        }

        if written < out.len() {
            out[written..].fill(0.0);
        }
        written
    }

    /// Samples currently queued (including the partially-consumed block).
    pub fn queued_samples(&self) -> usize {
        let inner = self.inner.lock();
        let current_remaining = inner.current.len() - inner.position;
        inner.queue.iter().map(|b| b.len()).sum::<usize>() + current_remaining
    }

    /// Drop all queued audio.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.current.clear();
        inner.position = 0;
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts remote media and feeds the playback buffer.
pub struct InboundPipeline {
    format: AudioFormat,
    playback: Arc<PlaybackBuffer>,
    bus: Arc<EventBus>,
    /// Epoch for receipt timestamps (monotonic).
    epoch: Instant,
}

impl InboundPipeline {
    pub fn new(format: AudioFormat, playback: Arc<PlaybackBuffer>, bus: Arc<EventBus>) -> Self {
        Self {
            format,
            playback,
            bus,
            epoch: Instant::now(),
        }
    }

    /// Register the track handler on a peer connection. Non-OPUS tracks
    /// are ignored.
    pub fn attach(&self, connection: &Arc<RTCPeerConnection>) {
        let format = self.format;
        let playback = self.playback.clone();
        let bus = self.bus.clone();
        let epoch = self.epoch;

        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let codec = track.codec();
                if !codec.capability.mime_type.to_lowercase().contains("opus") {
                    debug!("ignoring non-opus track: {}", codec.capability.mime_type);
                    return Box::pin(async {});
                }
                info!("remote audio track received");

                let playback = playback.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    run_track_reader(track, format, playback, bus, epoch).await;
                })
            },
        ));
    }
}

/// Read RTP from the remote track until it ends, decoding each payload
/// and publishing receipt/decode notifications.
async fn run_track_reader(
    track: Arc<TrackRemote>,
    format: AudioFormat,
    playback: Arc<PlaybackBuffer>,
    bus: Arc<EventBus>,
    epoch: Instant,
) {
    let mut decoder = match Decoder::new(format) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!("failed to create decoder for remote track: {}", e);
            return;
        }
    };

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let payload: Bytes = packet.payload;
                if payload.is_empty() {
                    continue;
                }

                let received_at_ms = epoch.elapsed().as_millis() as u64;
                bus.publish_audio(AudioEvent::BlockReceived {
                    payload: payload.clone(),
                    received_at_ms,
                });

                match decoder.decode(&payload, false) {
                    Ok(samples) if !samples.is_empty() => {
                        let samples_per_channel = samples.len() / format.channels as usize;
                        playback.push(samples);
                        bus.publish_audio(AudioEvent::BlockDecoded {
                            samples_per_channel,
                            channels: format.channels,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("dropping undecodable payload: {}", e);
                    }
                }
            }
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("eof")
                    || text.contains("closed")
                    || text.contains("nil")
                    || text.contains("must not be")
                {
                    break;
                }
                warn!("rtp read error: {}", e);
            }
        }
    }
    debug!("track reader exited");
}
