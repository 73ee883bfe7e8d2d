//! Binary encoding and decoding of MAC headers.

use crate::{FrameError, FrameType, MacAddress, MacHeader, StreamIndex, MAX_DURATION_US};

/// Encode a header into its on-air byte layout.
pub fn encode_header(header: &MacHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.size() as usize);
    buf.push(header.frame_type().code());
    buf.push(header.stream().to_bit());
    buf.extend_from_slice(&header.duration_us().to_le_bytes());

    match *header {
        MacHeader::Data { receiver, transmitter, .. } | MacHeader::Rts { receiver, transmitter, .. } => {
            buf.extend_from_slice(&receiver.0);
            buf.extend_from_slice(&transmitter.0);
        }
        MacHeader::Cts { receiver, rssi, .. } => {
            buf.extend_from_slice(&receiver.0);
            buf.push(rssi);
        }
        MacHeader::DataSpc { first, second, transmitter, .. }
        | MacHeader::RtsSpc { first, second, transmitter, .. } => {
            buf.extend_from_slice(&first.0);
            buf.extend_from_slice(&second.0);
            buf.extend_from_slice(&transmitter.0);
        }
        MacHeader::CtsSpc { receiver, transmitter, rssi, .. } => {
            buf.extend_from_slice(&receiver.0);
            buf.extend_from_slice(&transmitter.0);
            buf.push(rssi);
        }
        MacHeader::Ack { receiver, .. } => {
            buf.extend_from_slice(&receiver.0);
        }
    }

    debug_assert_eq!(buf.len(), header.size() as usize);
    buf
}

/// Decode a header from the start of `data`.
///
/// Returns the header and the number of bytes consumed.
pub fn decode_header(data: &[u8]) -> Result<(MacHeader, usize), FrameError> {
    if data.len() < 4 {
        return Err(FrameError::TooShort { expected: 4, actual: data.len() });
    }
    let frame_type = FrameType::from_code(data[0]).ok_or(FrameError::InvalidFrameType(data[0]))?;
    let expected = frame_type.header_size() as usize;
    if data.len() < expected {
        return Err(FrameError::TooShort { expected, actual: data.len() });
    }

    let stream = StreamIndex::from_bit(data[1]);
    let duration_us = u16::from_le_bytes([data[2], data[3]]);
    if duration_us > MAX_DURATION_US {
        return Err(FrameError::DurationOutOfRange(duration_us));
    }

    let addr_at = |offset: usize| {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&data[offset..offset + 6]);
        MacAddress(addr)
    };

    let header = match frame_type {
        FrameType::Data => MacHeader::Data {
            receiver: addr_at(4),
            transmitter: addr_at(10),
            duration_us,
        },
        FrameType::Rts => MacHeader::Rts {
            receiver: addr_at(4),
            transmitter: addr_at(10),
            duration_us,
        },
        FrameType::Cts => MacHeader::Cts {
            receiver: addr_at(4),
            duration_us,
            rssi: data[10],
        },
        FrameType::DataSpc => MacHeader::DataSpc {
            first: addr_at(4),
            second: addr_at(10),
            transmitter: addr_at(16),
            stream,
            duration_us,
        },
        FrameType::RtsSpc => MacHeader::RtsSpc {
            first: addr_at(4),
            second: addr_at(10),
            transmitter: addr_at(16),
            duration_us,
        },
        FrameType::CtsSpc => MacHeader::CtsSpc {
            receiver: addr_at(4),
            transmitter: addr_at(10),
            duration_us,
            rssi: data[16],
        },
        FrameType::Ack => MacHeader::Ack {
            receiver: addr_at(4),
            stream,
            duration_us,
        },
    };

    Ok((header, expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_matches_header_size() {
        let a = MacAddress::from_index(1);
        let b = MacAddress::from_index(2);
        let c = MacAddress::from_index(3);
        let headers = [
            MacHeader::Data { receiver: b, transmitter: a, duration_us: 60 },
            MacHeader::Cts { receiver: a, duration_us: 19, rssi: 40 },
            MacHeader::CtsSpc { receiver: a, transmitter: c, duration_us: 19, rssi: 41 },
            MacHeader::Ack { receiver: a, stream: StreamIndex::Second, duration_us: 0 },
        ];
        for header in headers {
            assert_eq!(encode_header(&header).len(), header.size() as usize);
        }
    }

    #[test]
    fn test_decode_data_spc_keeps_stream() {
        let header = MacHeader::DataSpc {
            first: MacAddress::from_index(2),
            second: MacAddress::from_index(3),
            transmitter: MacAddress::from_index(1),
            stream: StreamIndex::Second,
            duration_us: 240,
        };
        let bytes = encode_header(&header);
        let (decoded, used) = decode_header(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, 22);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(
            decode_header(&[0x02, 0x00]),
            Err(FrameError::TooShort { expected: 4, actual: 2 })
        );
        assert_eq!(decode_header(&[0x09, 0, 0, 0]), Err(FrameError::InvalidFrameType(0x09)));

        let mut bytes = encode_header(&MacHeader::Ack {
            receiver: MacAddress::from_index(1),
            stream: StreamIndex::First,
            duration_us: 0,
        });
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        assert_eq!(decode_header(&bytes), Err(FrameError::DurationOutOfRange(0xffff)));
    }
}
