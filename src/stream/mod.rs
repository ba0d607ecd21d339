//! Media pipelines between the host audio boundary and the transport.

pub mod input;
pub mod output;

pub use input::{InboundPipeline, PlaybackBuffer};
pub use output::{AudioBlock, OutboundPipeline, PacketSink, WebRtcPacketSink};
