//! # spc-frame
//!
//! MAC frame types for the superposition-coding MAC.
//!
//! This crate provides the link-layer value types shared by every layer of
//! the simulator:
//! - Hardware addresses ([`MacAddress`])
//! - Upper-layer packets ([`Packet`])
//! - MAC header variants ([`MacHeader`], [`FrameType`], [`StreamIndex`])
//! - Whole frames and on-air transmissions ([`MacFrame`], [`AirFrames`])
//! - A compact binary header codec ([`codec`])
//!
//! ## Header Layout
//!
//! Every header starts with a 2-byte frame control field followed by a
//! 2-byte little-endian NAV duration in microseconds:
//! - Frame control byte 0: frame type code
//! - Frame control byte 1: bit 0 is the stream index (0 = first, 1 = second)
//!
//! The remaining fields depend on the frame type. A 4-byte FCS trailer is
//! counted in [`MacFrame::size`] but never materialized.

pub mod codec;
pub mod error;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use error::FrameError;

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame check sequence trailer in bytes.
pub const FCS_LENGTH: u32 = 4;

/// Largest NAV duration a header can carry, in microseconds.
pub const MAX_DURATION_US: u16 = 0x7fff;

// ============================================================================
// Addresses
// ============================================================================

/// 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The broadcast address.
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Build a unicast address from a sequential index.
    ///
    /// Index 1 becomes `00:00:00:00:00:01`.
    pub fn from_index(index: u64) -> Self {
        let bytes = index.to_be_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[2..8]);
        // Keep the group bit clear so allocated addresses stay unicast.
        addr[0] &= 0xfe;
        MacAddress(addr)
    }

    /// True for broadcast and multicast addresses.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// True only for the all-ones broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

// ============================================================================
// Packets
// ============================================================================

/// An upper-layer packet handed to the MAC for delivery.
///
/// Only the size matters to the channel model, so the payload bytes are not
/// carried. `port` identifies the application flow and is what aggregation
/// matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    /// Unique packet identifier.
    pub uid: u64,
    /// Destination application port.
    pub port: u16,
    /// Payload size in bytes.
    pub size: u32,
}

impl Packet {
    /// Create a new packet.
    pub fn new(uid: u64, port: u16, size: u32) -> Self {
        Packet { uid, port, size }
    }
}

// ============================================================================
// Header Types
// ============================================================================

/// MAC frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Unicast or broadcast data.
    Data = 0x00,
    /// Request to send.
    Rts = 0x01,
    /// Clear to send.
    Cts = 0x02,
    /// Superposed data for two receivers.
    DataSpc = 0x03,
    /// Request to send naming two receivers.
    RtsSpc = 0x04,
    /// Clear to send in reply to an SPC request.
    CtsSpc = 0x05,
    /// Acknowledgement.
    Ack = 0x06,
}

impl FrameType {
    /// Decode from the frame control type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(FrameType::Data),
            0x01 => Some(FrameType::Rts),
            0x02 => Some(FrameType::Cts),
            0x03 => Some(FrameType::DataSpc),
            0x04 => Some(FrameType::RtsSpc),
            0x05 => Some(FrameType::CtsSpc),
            0x06 => Some(FrameType::Ack),
            _ => None,
        }
    }

    /// Frame control type code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Serialized header size in bytes (without FCS).
    pub fn header_size(self) -> u32 {
        match self {
            FrameType::Data => 16,
            FrameType::Rts => 16,
            FrameType::Cts => 11,
            FrameType::DataSpc => 22,
            FrameType::RtsSpc => 22,
            FrameType::CtsSpc => 17,
            FrameType::Ack => 10,
        }
    }

    /// Returns a lowercase label suitable for metric labels.
    pub fn as_label(self) -> &'static str {
        match self {
            FrameType::Data => "data",
            FrameType::Rts => "rts",
            FrameType::Cts => "cts",
            FrameType::DataSpc => "data_spc",
            FrameType::RtsSpc => "rts_spc",
            FrameType::CtsSpc => "cts_spc",
            FrameType::Ack => "ack",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "DATA"),
            FrameType::Rts => write!(f, "RTS"),
            FrameType::Cts => write!(f, "CTS"),
            FrameType::DataSpc => write!(f, "DATA_SPC"),
            FrameType::RtsSpc => write!(f, "RTS_SPC"),
            FrameType::CtsSpc => write!(f, "CTS_SPC"),
            FrameType::Ack => write!(f, "ACK"),
        }
    }
}

/// Which half of a superposed transmission a frame belongs to.
///
/// Plain unicast traffic always uses [`StreamIndex::First`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamIndex {
    /// Stream addressed to the first destination.
    #[default]
    First,
    /// Stream addressed to the second destination.
    Second,
}

impl StreamIndex {
    /// Frame control bit for this stream.
    pub fn to_bit(self) -> u8 {
        match self {
            StreamIndex::First => 0,
            StreamIndex::Second => 1,
        }
    }

    /// Decode from the frame control stream bit.
    pub fn from_bit(bits: u8) -> Self {
        if bits & 0x01 == 0 {
            StreamIndex::First
        } else {
            StreamIndex::Second
        }
    }
}

/// MAC header, one variant per frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacHeader {
    /// Data frame.
    Data {
        /// Receiver address (may be a group address).
        receiver: MacAddress,
        /// Transmitter address.
        transmitter: MacAddress,
        /// NAV duration in microseconds.
        duration_us: u16,
    },
    /// Request to send.
    Rts {
        /// Receiver address.
        receiver: MacAddress,
        /// Transmitter address.
        transmitter: MacAddress,
        /// NAV duration in microseconds.
        duration_us: u16,
    },
    /// Clear to send.
    Cts {
        /// Originator of the RTS.
        receiver: MacAddress,
        /// NAV duration in microseconds.
        duration_us: u16,
        /// Quantized RSSI of the RTS as seen by the responder.
        rssi: u8,
    },
    /// Superposed data. Each half of the transmission carries its own copy
    /// with `stream` set accordingly.
    DataSpc {
        /// Destination of the first stream.
        first: MacAddress,
        /// Destination of the second stream.
        second: MacAddress,
        /// Transmitter address.
        transmitter: MacAddress,
        /// Stream this copy belongs to.
        stream: StreamIndex,
        /// NAV duration in microseconds.
        duration_us: u16,
    },
    /// Request to send naming two receivers.
    RtsSpc {
        /// First destination, answers first.
        first: MacAddress,
        /// Second destination, answers one CTS slot later.
        second: MacAddress,
        /// Transmitter address.
        transmitter: MacAddress,
        /// NAV duration in microseconds.
        duration_us: u16,
    },
    /// Clear to send answering an SPC request.
    CtsSpc {
        /// Originator of the RTS_SPC.
        receiver: MacAddress,
        /// Responder address.
        transmitter: MacAddress,
        /// NAV duration in microseconds.
        duration_us: u16,
        /// Quantized RSSI of the RTS_SPC as seen by the responder.
        rssi: u8,
    },
    /// Acknowledgement.
    Ack {
        /// Transmitter of the acknowledged data.
        receiver: MacAddress,
        /// Stream being acknowledged.
        stream: StreamIndex,
        /// NAV duration in microseconds.
        duration_us: u16,
    },
}

impl MacHeader {
    /// Frame type of this header.
    pub fn frame_type(&self) -> FrameType {
        match self {
            MacHeader::Data { .. } => FrameType::Data,
            MacHeader::Rts { .. } => FrameType::Rts,
            MacHeader::Cts { .. } => FrameType::Cts,
            MacHeader::DataSpc { .. } => FrameType::DataSpc,
            MacHeader::RtsSpc { .. } => FrameType::RtsSpc,
            MacHeader::CtsSpc { .. } => FrameType::CtsSpc,
            MacHeader::Ack { .. } => FrameType::Ack,
        }
    }

    /// Serialized header size in bytes.
    pub fn size(&self) -> u32 {
        self.frame_type().header_size()
    }

    /// NAV duration in microseconds.
    pub fn duration_us(&self) -> u16 {
        match *self {
            MacHeader::Data { duration_us, .. }
            | MacHeader::Rts { duration_us, .. }
            | MacHeader::Cts { duration_us, .. }
            | MacHeader::DataSpc { duration_us, .. }
            | MacHeader::RtsSpc { duration_us, .. }
            | MacHeader::CtsSpc { duration_us, .. }
            | MacHeader::Ack { duration_us, .. } => duration_us,
        }
    }

    /// Primary receiver address (addr1).
    pub fn addr1(&self) -> MacAddress {
        match *self {
            MacHeader::Data { receiver, .. }
            | MacHeader::Rts { receiver, .. }
            | MacHeader::Cts { receiver, .. }
            | MacHeader::CtsSpc { receiver, .. }
            | MacHeader::Ack { receiver, .. } => receiver,
            MacHeader::DataSpc { first, .. } | MacHeader::RtsSpc { first, .. } => first,
        }
    }

    /// Second receiver of a dual-destination frame.
    pub fn addr2(&self) -> Option<MacAddress> {
        match *self {
            MacHeader::DataSpc { second, .. } | MacHeader::RtsSpc { second, .. } => Some(second),
            _ => None,
        }
    }

    /// Transmitter address, when the header carries one.
    pub fn transmitter(&self) -> Option<MacAddress> {
        match *self {
            MacHeader::Data { transmitter, .. }
            | MacHeader::Rts { transmitter, .. }
            | MacHeader::DataSpc { transmitter, .. }
            | MacHeader::RtsSpc { transmitter, .. }
            | MacHeader::CtsSpc { transmitter, .. } => Some(transmitter),
            MacHeader::Cts { .. } | MacHeader::Ack { .. } => None,
        }
    }

    /// Stream index. Non-SPC frames report the first stream.
    pub fn stream(&self) -> StreamIndex {
        match *self {
            MacHeader::DataSpc { stream, .. } | MacHeader::Ack { stream, .. } => stream,
            _ => StreamIndex::First,
        }
    }

    /// True when this node is a named receiver of the frame.
    ///
    /// Dual-destination frames count either destination.
    pub fn is_addressed_to(&self, addr: MacAddress) -> bool {
        self.addr1() == addr || self.addr2() == Some(addr)
    }

    /// Carried RSSI sample (CTS and CTS_SPC only).
    pub fn rssi(&self) -> Option<u8> {
        match *self {
            MacHeader::Cts { rssi, .. } | MacHeader::CtsSpc { rssi, .. } => Some(rssi),
            _ => None,
        }
    }

    /// Encode this header to bytes.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_header(self)
    }

    /// Decode a header from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        codec::decode_header(data).map(|(header, _)| header)
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A complete MAC frame: header plus aggregated packets.
///
/// Cloning is cheap; the packet list is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct MacFrame {
    /// Frame header.
    pub header: MacHeader,
    /// Packets carried in the body. Empty for control frames.
    pub packets: Arc<[Packet]>,
}

impl MacFrame {
    /// Create a control frame with no body.
    pub fn control(header: MacHeader) -> Self {
        MacFrame {
            header,
            packets: Arc::from(Vec::new()),
        }
    }

    /// Create a data frame carrying the given packets.
    pub fn data(header: MacHeader, packets: Vec<Packet>) -> Self {
        MacFrame {
            header,
            packets: Arc::from(packets),
        }
    }

    /// Total body size in bytes.
    pub fn payload_size(&self) -> u32 {
        self.packets.iter().map(|p| p.size).sum()
    }

    /// Frame size on air: header, body and FCS.
    pub fn size(&self) -> u32 {
        self.header.size() + self.payload_size() + FCS_LENGTH
    }
}

/// What a transmitter puts on the air.
#[derive(Debug, Clone, PartialEq)]
pub enum AirFrames {
    /// One frame at full power.
    Single(MacFrame),
    /// Two frames superposed with a power split.
    Superposed {
        /// Frame for the first destination.
        first: MacFrame,
        /// Frame for the second destination.
        second: MacFrame,
    },
}

impl AirFrames {
    /// True for a two-stream transmission.
    pub fn is_superposed(&self) -> bool {
        matches!(self, AirFrames::Superposed { .. })
    }

    /// Frame used for addressing and NAV decisions (the first stream).
    pub fn primary(&self) -> &MacFrame {
        match self {
            AirFrames::Single(frame) => frame,
            AirFrames::Superposed { first, .. } => first,
        }
    }

    /// Largest frame size among the carried frames.
    pub fn max_size(&self) -> u32 {
        match self {
            AirFrames::Single(frame) => frame.size(),
            AirFrames::Superposed { first, second } => first.size().max(second.size()),
        }
    }
}
