// Just enough IPv4/UDP to build and unwrap the datagrams AMT carries; not a general purpose IP stack.
use std::net::Ipv4Addr;

pub const PROTOCOL_IGMP: u8 = 2;
pub const PROTOCOL_UDP: u8 = 17;

const MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// RFC 1071 Internet checksum
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => unreachable!(),
        };
        sum = sum.wrapping_add(word as u32);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub(crate) fn require(bytes: &[u8], expected: usize) -> Result<(), crate::DecodeError> {
    if bytes.len() < expected {
        Err(crate::DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub tos: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    // Must be padded to a multiple of 4 bytes
    pub options: Vec<u8>,
}

impl Header {
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>, crate::EncodeError> {
        debug_assert_eq!(self.options.len() % 4, 0);

        let header_len = MIN_HEADER_LEN + self.options.len();
        let total_len = header_len + payload.len();
        let total_len_field =
            u16::try_from(total_len).map_err(|_| crate::EncodeError::PayloadTooLarge(payload.len()))?;

        let mut datagram = Vec::with_capacity(total_len);
        datagram.push(0x40 | (header_len / 4) as u8);
        datagram.push(self.tos);
        datagram.extend_from_slice(&total_len_field.to_be_bytes());
        datagram.extend_from_slice(&[0, 0, 0, 0]); // identification, flags, fragment offset
        datagram.push(self.ttl);
        datagram.push(self.protocol);
        datagram.extend_from_slice(&[0, 0]);
        datagram.extend_from_slice(&self.source.octets());
        datagram.extend_from_slice(&self.destination.octets());
        datagram.extend_from_slice(&self.options);

        let header_checksum = checksum(&datagram[..header_len]);
        datagram[10..12].copy_from_slice(&header_checksum.to_be_bytes());

        datagram.extend_from_slice(payload);
        Ok(datagram)
    }
}

/// A parsed IPv4 datagram borrowing its payload from the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, crate::DecodeError> {
        require(bytes, 1)?;
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(crate::DecodeError::UnsupportedIpVersion(version));
        }
        require(bytes, MIN_HEADER_LEN)?;

        let header_len = ((bytes[0] & 0x0F) as usize) * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(crate::DecodeError::InvalidHeaderLength(header_len));
        }
        let total_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if total_len < header_len {
            return Err(crate::DecodeError::InvalidHeaderLength(total_len));
        }
        require(bytes, total_len)?;

        Ok(Datagram {
            ttl: bytes[8],
            protocol: bytes[9],
            source: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            destination: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
            options: &bytes[MIN_HEADER_LEN..header_len],
            payload: &bytes[header_len..total_len],
        })
    }

    /// Strips the UDP header and returns the application payload untouched
    pub fn udp_payload(&self) -> Result<&'a [u8], crate::DecodeError> {
        if self.protocol != PROTOCOL_UDP {
            return Err(crate::DecodeError::NotUdp(self.protocol));
        }
        require(self.payload, UDP_HEADER_LEN)?;

        let udp_len = u16::from_be_bytes([self.payload[4], self.payload[5]]) as usize;
        if udp_len < UDP_HEADER_LEN {
            return Err(crate::DecodeError::InvalidHeaderLength(udp_len));
        }
        require(self.payload, udp_len)?;

        Ok(&self.payload[UDP_HEADER_LEN..udp_len])
    }
}

/// Wraps `payload` in UDP and IPv4 headers. The UDP checksum is left at zero, which IPv4 permits.
pub fn build_udp(
    source: std::net::SocketAddrV4,
    destination: std::net::SocketAddrV4,
    ttl: u8,
    payload: &[u8],
) -> Result<Vec<u8>, crate::EncodeError> {
    let udp_len = u16::try_from(UDP_HEADER_LEN + payload.len())
        .map_err(|_| crate::EncodeError::PayloadTooLarge(payload.len()))?;

    let mut segment = Vec::with_capacity(udp_len as usize);
    segment.extend_from_slice(&source.port().to_be_bytes());
    segment.extend_from_slice(&destination.port().to_be_bytes());
    segment.extend_from_slice(&udp_len.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);

    Header {
        tos: 0,
        ttl,
        protocol: PROTOCOL_UDP,
        source: *source.ip(),
        destination: *destination.ip(),
        options: Vec::new(),
    }
    .build(&segment)
}
