//! RTP packet building and parsing.
//!
//! Implements the RFC 3550 fixed header (12 bytes). The packetizer is
//! pure: sequence and timestamp state belongs to the caller (the
//! outbound pipeline), which increments the sequence exactly once per
//! packet and advances the timestamp by the samples each packet carries.

use bytes::Bytes;

/// RTP header structure (12 bytes, no CSRC list)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type (0-127)
    pub payload_type: u8,
    /// Sequence number (wraps at 65535)
    pub sequence: u16,
    /// Timestamp in source-domain samples
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse an RTP header from bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        let byte0 = data[0];
        let version = (byte0 >> 6) & 0x03;
        if version != 2 {
            return None;
        }

        let byte1 = data[1];

        Some(RtpHeader {
            version,
            padding: (byte0 & 0x20) != 0,
            extension: (byte0 & 0x10) != 0,
            marker: (byte1 & 0x80) != 0,
            payload_type: byte1 & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Encode the header into the first 12 bytes of `buffer`.
    /// Returns the number of bytes written (0 if the buffer is too small).
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < 12 {
            return 0;
        }

        buffer[0] = (self.version << 6)
            | if self.padding { 0x20 } else { 0 }
            | if self.extension { 0x10 } else { 0 };
        buffer[1] = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);
        buffer[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buffer[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        12
    }
}

/// A transport packet: RTP header plus codec payload.
#[derive(Debug, Clone)]
pub struct TransportPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl TransportPacket {
    /// Build a packet from its header fields and payload. Pure function
    /// of its inputs.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                marker: false,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            payload,
        }
    }

    /// Encode the full packet (header + payload) to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; 12 + self.payload.len()];
        let header_len = self.header.encode(&mut buffer);
        buffer[header_len..].copy_from_slice(&self.payload);
        buffer
    }

    /// Parse a packet from bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = RtpHeader::parse(data)?;
        Some(Self {
            header,
            payload: Bytes::copy_from_slice(&data[12..]),
        })
    }
}
