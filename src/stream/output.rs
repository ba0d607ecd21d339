//! Outbound pipeline: captured audio blocks -> encoded packets -> transport.
//!
//! A dedicated worker thread drains a timestamp-ordered queue of
//! captured blocks, slices fixed-duration frames at the host rate, and
//! drives resample -> encode -> packetize -> send. The capture callback
//! only enqueues; every blocking step happens on the worker.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::codec::opus::{Encoder, EncoderSettings};
use crate::codec::AudioFormat;
use crate::config::AudioConfig;
use crate::error::BridgeError;
use crate::event::{AudioEvent, EventBus};
use crate::resample::SampleRateConverter;
use crate::rtp::TransportPacket;

/// One block of captured audio as delivered by the host callback.
///
/// Blocks are moved into the pipeline and freed by the worker; they are
/// never shared after handoff.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Interleaved float samples.
    pub samples: Vec<f32>,
    /// Channel count.
    pub channels: u16,
    /// Frames per channel.
    pub sample_count: usize,
    /// Source sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic capture timestamp in milliseconds. Blocks are merged
    /// in non-decreasing timestamp order even when delivered out of
    /// order.
    pub timestamp: u64,
}

/// Destination for finished transport packets.
///
/// Send failures are non-fatal: the worker logs them and moves on to
/// the next frame.
pub trait PacketSink: Send + Sync {
    fn send(&self, packet: &TransportPacket) -> Result<(), BridgeError>;
}

/// Writes packets to the outgoing WebRTC track.
pub struct WebRtcPacketSink {
    track: Arc<TrackLocalStaticRTP>,
    runtime: tokio::runtime::Handle,
}

impl WebRtcPacketSink {
    pub fn new(track: Arc<TrackLocalStaticRTP>, runtime: tokio::runtime::Handle) -> Self {
        Self { track, runtime }
    }
}

impl PacketSink for WebRtcPacketSink {
    fn send(&self, packet: &TransportPacket) -> Result<(), BridgeError> {
        let rtp_packet = webrtc::rtp::packet::Packet {
            header: webrtc::rtp::header::Header {
                version: 2,
                payload_type: packet.header.payload_type,
                sequence_number: packet.header.sequence,
                timestamp: packet.header.timestamp,
                ssrc: packet.header.ssrc,
                ..Default::default()
            },
            payload: packet.payload.clone(),
        };

        // Writing to an unbound track is a silent no-op in the engine,
        // matching the only-log-never-throw transport contract.
        match self
            .runtime
            .block_on(self.track.write_rtp(&rtp_packet))
        {
            Ok(_) => Ok(()),
            Err(e) => Err(BridgeError::Transport(e.to_string())),
        }
    }
}

/// Sequence/timestamp state for outgoing packets. The sequence advances
/// exactly once per packet; the timestamp advances by the converted
/// samples per channel each frame represents, independent of wall time.
pub(crate) struct PacketCounters {
    sequence: u16,
    timestamp: u32,
}

impl PacketCounters {
    pub(crate) fn new() -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Stamp one packet and advance both counters.
    pub(crate) fn stamp(&mut self, samples_per_channel: u32) -> (u16, u32) {
        let stamped = (self.sequence, self.timestamp);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples_per_channel);
        stamped
    }

    /// Media time passed but no packet was produced (codec rejected the
    /// frame). The clock still advances so the receiver's timeline does
    /// not drift.
    pub(crate) fn skip(&mut self, samples_per_channel: u32) {
        self.timestamp = self.timestamp.wrapping_add(samples_per_channel);
    }
}

/// A queued block ordered by capture timestamp; arrival index breaks
/// ties so equal timestamps drain first-in first-out.
struct QueuedBlock {
    block: AudioBlock,
    arrival: u64,
}

impl PartialEq for QueuedBlock {
    fn eq(&self, other: &Self) -> bool {
        self.block.timestamp == other.block.timestamp && self.arrival == other.arrival
    }
}

impl Eq for QueuedBlock {}

impl PartialOrd for QueuedBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.block.timestamp, self.arrival).cmp(&(other.block.timestamp, other.arrival))
    }
}

/// Timestamp-ordered block queue with condvar wakeup for the worker.
struct BlockQueue {
    inner: parking_lot::Mutex<QueueInner>,
    condvar: parking_lot::Condvar,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<QueuedBlock>>,
    arrivals: u64,
    shutdown: bool,
}

impl BlockQueue {
    fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                arrivals: 0,
                shutdown: false,
            }),
            condvar: parking_lot::Condvar::new(),
        }
    }

    fn push(&self, block: AudioBlock) {
        let mut inner = self.inner.lock();
        let arrival = inner.arrivals;
        inner.arrivals += 1;
        inner.heap.push(Reverse(QueuedBlock { block, arrival }));
        drop(inner);
        self.condvar.notify_one();
    }

    /// Wait (bounded by `timeout`) for queued blocks or shutdown, then
    /// drain everything in timestamp order. Returns `false` on shutdown.
    fn wait_drain(&self, timeout: Duration, out: &mut Vec<AudioBlock>) -> bool {
        let mut inner = self.inner.lock();
        if inner.heap.is_empty() && !inner.shutdown {
            let _ = self.condvar.wait_for(&mut inner, timeout);
        }
        if inner.shutdown {
            return false;
        }
        while let Some(Reverse(queued)) = inner.heap.pop() {
            out.push(queued.block);
        }
        true
    }

    fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = false;
        inner.heap.clear();
    }
}

/// Outbound worker statistics (atomic, lock-free).
#[derive(Default)]
pub struct OutputStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub encode_drops: AtomicU64,
    pub resample_drops: AtomicU64,
    pub send_errors: AtomicU64,
}

/// Statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct OutputStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub encode_drops: u64,
    pub resample_drops: u64,
    pub send_errors: u64,
}

/// Outbound pipeline with its dedicated worker thread.
pub struct OutboundPipeline {
    audio: AudioConfig,
    sink: Arc<dyn PacketSink>,
    bus: Arc<EventBus>,
    queue: Arc<BlockQueue>,
    running: Arc<AtomicBool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<OutputStats>,
}

impl OutboundPipeline {
    pub fn new(audio: AudioConfig, sink: Arc<dyn PacketSink>, bus: Arc<EventBus>) -> Self {
        Self {
            audio,
            sink,
            bus,
            queue: Arc::new(BlockQueue::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: parking_lot::Mutex::new(None),
            stats: Arc::new(OutputStats::default()),
        }
    }

    /// Accept one captured block. Never blocks; empty blocks and blocks
    /// arriving while the worker is stopped are dropped silently.
    pub fn enqueue(&self, block: AudioBlock) {
        if block.samples.is_empty() || !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.bus.publish_audio(AudioEvent::BlockProcessed {
            frames: block.sample_count,
            channels: block.channels,
            timestamp: block.timestamp,
        });
        self.queue.push(block);
    }

    /// Start the worker. Idempotent and safe from any thread.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut worker = self.worker.lock();
        if self.running.load(Ordering::SeqCst) {
            debug!("outbound pipeline already running");
            return Ok(());
        }

        self.queue.reset();
        self.running.store(true, Ordering::SeqCst);

        let audio = self.audio.clone();
        let sink = self.sink.clone();
        let bus = self.bus.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();

        let handle = thread::Builder::new()
            .name("audio-bridge-tx".to_string())
            .spawn(move || worker_loop(audio, queue, running, sink, bus, stats));

        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(BridgeError::WorkerSpawn(e.to_string()))
            }
        }
    }

    /// Stop the worker and join it. Idempotent; the second call in a
    /// row is a no-op. Returns only after the worker has fully exited.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        self.running.store(false, Ordering::SeqCst);
        self.queue.shutdown();
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> OutputStatsSnapshot {
        OutputStatsSnapshot {
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            encode_drops: self.stats.encode_drops.load(Ordering::Relaxed),
            resample_drops: self.stats.resample_drops.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OutboundPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn raise_thread_priority() {
    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
        };
        SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
    }

    #[cfg(unix)]
    unsafe {
        let _ = libc::nice(-20);
    }
}

fn worker_loop(
    audio: AudioConfig,
    queue: Arc<BlockQueue>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn PacketSink>,
    bus: Arc<EventBus>,
    stats: Arc<OutputStats>,
) {
    raise_thread_priority();

    let format = AudioFormat::new(audio.codec_sample_rate, audio.channels);
    let settings = EncoderSettings {
        bitrate: audio.codec_bitrate,
        auto_bitrate: audio.auto_bitrate,
        fec_enabled: audio.fec_enabled,
        expected_packet_loss_pct: audio.expected_packet_loss_pct,
        complexity: audio.complexity,
    };
    let mut encoder = match Encoder::new(format, &settings) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("failed to create encoder, outbound pipeline disabled: {}", e);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let frame_per_channel = audio.host_frame_samples_per_channel();
    let frame_total = audio.host_frame_samples_total();
    let mut resampler = match SampleRateConverter::new(
        audio.host_sample_rate,
        audio.codec_sample_rate,
        audio.channels,
        frame_per_channel,
    ) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!("failed to create resampler, outbound pipeline disabled: {}", e);
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut accumulation: Vec<f32> = Vec::with_capacity(frame_total * 2);
    let mut drained: Vec<AudioBlock> = Vec::new();
    let mut counters = PacketCounters::new();
    let wait = Duration::from_millis(audio.frame_duration_ms as u64);

    while running.load(Ordering::SeqCst) {
        drained.clear();
        if !queue.wait_drain(wait, &mut drained) {
            break;
        }

        for block in drained.drain(..) {
            accumulation.extend_from_slice(&block.samples);
        }

        while accumulation.len() >= frame_total {
            let frame: Vec<f32> = accumulation.drain(..frame_total).collect();

            let converted = match resampler.process(&frame) {
                Ok(converted) => converted,
                Err(e) => {
                    warn!("resampler error, dropping frame: {}", e);
                    stats.resample_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if converted.is_empty() {
                warn!("resampler produced no output, dropping frame");
                stats.resample_drops.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let converted_per_channel = converted.len() / audio.channels as usize;
            let payload = encoder.encode_frame(&converted, converted_per_channel);
            if payload.is_empty() {
                stats.encode_drops.fetch_add(1, Ordering::Relaxed);
                counters.skip(converted_per_channel as u32);
                continue;
            }

            let (sequence, timestamp) = counters.stamp(converted_per_channel as u32);
            let packet = TransportPacket::new(
                audio.payload_type,
                sequence,
                timestamp,
                audio.ssrc,
                payload,
            );

            let bytes = packet.payload.len();
            match sink.send(&packet) {
                Ok(()) => {
                    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                    bus.publish_audio(AudioEvent::BlockSent {
                        sequence,
                        timestamp,
                        bytes,
                    });
                }
                Err(e) => {
                    warn!("packet send failed: {}", e);
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    debug!("outbound worker exited cleanly");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct CollectSink {
        packets: parking_lot::Mutex<Vec<TransportPacket>>,
    }

    impl CollectSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn packets(&self) -> Vec<TransportPacket> {
            self.packets.lock().clone()
        }
    }

    impl PacketSink for CollectSink {
        fn send(&self, packet: &TransportPacket) -> Result<(), BridgeError> {
            self.packets.lock().push(packet.clone());
            Ok(())
        }
    }

    fn stereo_block(frames: usize, sample_rate: u32, timestamp: u64) -> AudioBlock {
        AudioBlock {
            samples: (0..frames * 2).map(|i| (i as f32 * 0.013).sin() * 0.4).collect(),
            channels: 2,
            sample_count: frames,
            sample_rate,
            timestamp,
        }
    }

    fn wait_for_packets(sink: &CollectSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while sink.packets().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_queue_drains_in_timestamp_order() {
        let queue = BlockQueue::new();
        queue.push(stereo_block(4, 44_100, 30));
        queue.push(stereo_block(4, 44_100, 10));
        queue.push(stereo_block(4, 44_100, 20));

        let mut drained = Vec::new();
        assert!(queue.wait_drain(Duration::from_millis(1), &mut drained));
        let order: Vec<u64> = drained.iter().map(|b| b.timestamp).collect();
        assert_eq!(order, [10, 20, 30]);
    }

    #[test]
    fn test_queue_equal_timestamps_fifo() {
        let queue = BlockQueue::new();
        let mut first = stereo_block(4, 44_100, 5);
        first.samples[0] = 111.0;
        let mut second = stereo_block(4, 44_100, 5);
        second.samples[0] = 222.0;
        queue.push(first);
        queue.push(second);

        let mut drained = Vec::new();
        queue.wait_drain(Duration::from_millis(1), &mut drained);
        assert_eq!(drained[0].samples[0], 111.0);
        assert_eq!(drained[1].samples[0], 222.0);
    }

    #[test]
    fn test_sequence_wraps_at_16_bits() {
        let mut counters = PacketCounters {
            sequence: 65_535,
            timestamp: 0,
        };
        let (first, _) = counters.stamp(960);
        let (second, ts) = counters.stamp(960);
        assert_eq!(first, 65_535);
        assert_eq!(second, 0);
        assert_eq!(ts, 960);
    }

    #[test]
    fn test_timestamp_accumulates_per_packet() {
        let mut counters = PacketCounters::new();
        let (_, t0) = counters.stamp(960);
        let (_, t1) = counters.stamp(960);
        let (_, t2) = counters.stamp(480);
        assert_eq!((t0, t1, t2), (0, 960, 1920));

        // A rejected frame still advances the media clock.
        counters.skip(960);
        let (_, t3) = counters.stamp(960);
        assert_eq!(t3, 2400 + 960);
    }

    #[test]
    fn test_one_source_frame_produces_one_packet() {
        let sink = CollectSink::new();
        let bus = Arc::new(EventBus::new());
        let pipeline = OutboundPipeline::new(AudioConfig::default(), sink.clone(), bus);
        pipeline.start().unwrap();

        // 960 frames per channel at 44.1kHz: more than one 20ms frame
        // (882), less than two.
        pipeline.enqueue(stereo_block(960, 44_100, 1));
        wait_for_packets(&sink, 1);
        pipeline.stop();

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.sequence, 0);
        assert_eq!(packets[0].header.timestamp, 0);
        assert_eq!(packets[0].header.payload_type, 111);
        assert!(!packets[0].payload.is_empty());
    }

    #[test]
    fn test_timestamp_advances_by_converted_samples() {
        let sink = CollectSink::new();
        let bus = Arc::new(EventBus::new());
        let pipeline = OutboundPipeline::new(AudioConfig::default(), sink.clone(), bus);
        pipeline.start().unwrap();

        // Two full 20ms source frames (2 x 882 per channel).
        pipeline.enqueue(stereo_block(882, 44_100, 1));
        pipeline.enqueue(stereo_block(882, 44_100, 2));
        wait_for_packets(&sink, 2);
        pipeline.stop();

        let packets = sink.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.sequence, 0);
        assert_eq!(packets[1].header.sequence, 1);

        let delta = packets[1].header.timestamp - packets[0].header.timestamp;
        // 882 samples at 44.1kHz are nominally 960 at 48kHz.
        assert!(
            (900..=1020).contains(&delta),
            "unexpected timestamp delta {}",
            delta
        );
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let sink = CollectSink::new();
        let bus = Arc::new(EventBus::new());
        let pipeline = OutboundPipeline::new(AudioConfig::default(), sink, bus);

        pipeline.start().unwrap();
        assert!(pipeline.is_running());
        pipeline.stop();
        assert!(!pipeline.is_running());
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_start_twice_keeps_single_worker() {
        let sink = CollectSink::new();
        let bus = Arc::new(EventBus::new());
        let pipeline = OutboundPipeline::new(AudioConfig::default(), sink, bus);

        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn test_enqueue_while_stopped_is_dropped() {
        let sink = CollectSink::new();
        let bus = Arc::new(EventBus::new());
        let pipeline = OutboundPipeline::new(AudioConfig::default(), sink.clone(), bus);

        pipeline.enqueue(stereo_block(960, 44_100, 1));
        thread::sleep(Duration::from_millis(50));
        assert!(sink.packets().is_empty());
    }
}
