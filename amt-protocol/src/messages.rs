// Message layouts follow RFC 7450 §5.1. Every message starts with a single octet holding the
// version (always 0) in the high nibble and the type in the low nibble; see codec.rs.
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use crate::codec::Message;
use crate::ipv4::require;

const NONCE_LEN: usize = 4;
const MAC_LEN: usize = 6;

/// Request nonce; fresh for every handshake attempt and echoed by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; NONCE_LEN]);

impl Nonce {
    pub fn random() -> Self {
        Nonce(rand::random())
    }

    fn read(bytes: &[u8]) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Nonce(nonce)
    }
}

impl Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

/// Opaque token a relay hands out in its Membership Query. It is echoed back verbatim and never
/// verified locally; the relay is trusted to issue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResponseMac(pub [u8; MAC_LEN]);

impl ResponseMac {
    fn read(bytes: &[u8]) -> Self {
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&bytes[..MAC_LEN]);
        ResponseMac(mac)
    }
}

impl Display for ResponseMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

fn write_gateway(buf: &mut Vec<u8>, gateway: &SocketAddr) {
    buf.extend_from_slice(&gateway.port().to_be_bytes());
    let address = match gateway.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };
    buf.extend_from_slice(&address.octets());
}

fn read_address(bytes: &[u8]) -> Result<IpAddr, crate::DecodeError> {
    match bytes.len() {
        4 => Ok(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            let ip = Ipv6Addr::from(octets);
            Ok(ip.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(ip)))
        }
        len => Err(crate::DecodeError::InvalidAddressLength(len)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDiscovery {
    pub nonce: Nonce,
}

impl Message for RelayDiscovery {
    const MESSAGE_TYPE: u8 = 1;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&self.nonce.0);
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, 3 + NONCE_LEN)?;
        Ok(RelayDiscovery {
            nonce: Nonce::read(&body[3..]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAdvertisement {
    pub nonce: Nonce,
    pub relay_address: IpAddr,
}

impl Message for RelayAdvertisement {
    const MESSAGE_TYPE: u8 = 2;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&self.nonce.0);
        match self.relay_address {
            IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
        }
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, 3 + NONCE_LEN)?;
        Ok(RelayAdvertisement {
            nonce: Nonce::read(&body[3..]),
            relay_address: read_address(&body[3 + NONCE_LEN..])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub nonce: Nonce,
    // P flag: the gateway will speak MLD rather than IGMP inside Membership Updates
    pub mld: bool,
}

impl Message for RelayRequest {
    const MESSAGE_TYPE: u8 = 3;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[self.mld as u8, 0, 0]);
        buf.extend_from_slice(&self.nonce.0);
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, 3 + NONCE_LEN)?;
        Ok(RelayRequest {
            nonce: Nonce::read(&body[3..]),
            mld: body[0] & 0x01 != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    // L flag
    pub limited: bool,
    pub response_mac: ResponseMac,
    pub nonce: Nonce,
    /// Encapsulated IGMP/MLD general query, kept as received
    pub query: Vec<u8>,
    /// The gateway's address as seen by the relay; present when the G flag is set
    pub gateway: Option<SocketAddr>,
}

impl MembershipQuery {
    const FIXED_LEN: usize = 1 + MAC_LEN + NONCE_LEN;

    // With the G flag set, the gateway fields trail the query, so its length has to come from the
    // encapsulated IP header
    fn encapsulated_len(datagram: &[u8]) -> Result<usize, crate::DecodeError> {
        require(datagram, 1)?;
        match datagram[0] >> 4 {
            4 => {
                require(datagram, 4)?;
                Ok(u16::from_be_bytes([datagram[2], datagram[3]]) as usize)
            }
            6 => {
                require(datagram, 6)?;
                Ok(40 + u16::from_be_bytes([datagram[4], datagram[5]]) as usize)
            }
            version => Err(crate::DecodeError::UnsupportedIpVersion(version)),
        }
    }
}

impl Message for MembershipQuery {
    const MESSAGE_TYPE: u8 = 4;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.push(((self.limited as u8) << 1) | self.gateway.is_some() as u8);
        buf.extend_from_slice(&self.response_mac.0);
        buf.extend_from_slice(&self.nonce.0);
        buf.extend_from_slice(&self.query);
        if let Some(gateway) = &self.gateway {
            write_gateway(buf, gateway);
        }
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, Self::FIXED_LEN)?;
        let flags = body[0];
        let response_mac = ResponseMac::read(&body[1..]);
        let nonce = Nonce::read(&body[1 + MAC_LEN..]);
        let rest = &body[Self::FIXED_LEN..];

        let (query, gateway) = if flags & 0x01 != 0 {
            let query_len = Self::encapsulated_len(rest)?;
            require(rest, query_len + 2)?;
            let port = u16::from_be_bytes([rest[query_len], rest[query_len + 1]]);
            let ip = read_address(&rest[query_len + 2..])?;
            (&rest[..query_len], Some(SocketAddr::new(ip, port)))
        } else {
            (rest, None)
        };

        Ok(MembershipQuery {
            limited: flags & 0x02 != 0,
            response_mac,
            nonce,
            query: query.to_vec(),
            gateway,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub response_mac: ResponseMac,
    pub nonce: Nonce,
    /// Encapsulated IGMP/MLD report datagram
    pub report: Vec<u8>,
}

impl MembershipUpdate {
    /// Update asking the relay to forward `group` traffic originating from `source`
    pub fn join(
        response_mac: ResponseMac,
        nonce: Nonce,
        group: Ipv4Addr,
        source: Ipv4Addr,
    ) -> Result<Self, crate::EncodeError> {
        Ok(MembershipUpdate {
            response_mac,
            nonce,
            report: crate::igmp::MembershipReport::include(group, source).encapsulate()?,
        })
    }
}

impl Message for MembershipUpdate {
    const MESSAGE_TYPE: u8 = 5;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        buf.extend_from_slice(&self.response_mac.0);
        buf.extend_from_slice(&self.nonce.0);
        buf.extend_from_slice(&self.report);
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, 1 + MAC_LEN + NONCE_LEN)?;
        Ok(MembershipUpdate {
            response_mac: ResponseMac::read(&body[1..]),
            nonce: Nonce::read(&body[1 + MAC_LEN..]),
            report: body[1 + MAC_LEN + NONCE_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastData {
    /// Encapsulated IP datagram as sent by the multicast source
    pub datagram: Vec<u8>,
}

impl MulticastData {
    pub fn encapsulate(
        source: SocketAddrV4,
        group: SocketAddrV4,
        ttl: u8,
        payload: &[u8],
    ) -> Result<Self, crate::EncodeError> {
        Ok(MulticastData {
            datagram: crate::ipv4::build_udp(source, group, ttl, payload)?,
        })
    }

    pub fn udp_payload(&self) -> Result<&[u8], crate::DecodeError> {
        crate::ipv4::Datagram::parse(&self.datagram)?.udp_payload()
    }

    /// Same as decoding then calling `udp_payload()`, without copying the datagram out of `bytes`
    pub fn udp_payload_from_slice(bytes: &[u8]) -> Result<&[u8], crate::DecodeError> {
        let actual = crate::codec::message_type(bytes)?;
        if actual != Self::MESSAGE_TYPE {
            return Err(crate::DecodeError::UnexpectedMessageType {
                expected: Self::MESSAGE_TYPE,
                actual,
            });
        }
        require(bytes, 2)?;
        crate::ipv4::Datagram::parse(&bytes[2..])?.udp_payload()
    }
}

impl Message for MulticastData {
    const MESSAGE_TYPE: u8 = 6;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        buf.extend_from_slice(&self.datagram);
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        require(body, 1)?;
        Ok(MulticastData {
            datagram: body[1..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub response_mac: ResponseMac,
    pub nonce: Nonce,
    /// The gateway address the relay reported in its query, identifying the tunnel to close
    pub gateway: SocketAddr,
}

impl Message for Teardown {
    const MESSAGE_TYPE: u8 = 7;

    fn encode_body(&self, buf: &mut Vec<u8>) {
        buf.push(0);
        buf.extend_from_slice(&self.response_mac.0);
        buf.extend_from_slice(&self.nonce.0);
        write_gateway(buf, &self.gateway);
    }

    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError> {
        let fixed = 1 + MAC_LEN + NONCE_LEN;
        require(body, fixed + 2 + 16)?;
        let port = u16::from_be_bytes([body[fixed], body[fixed + 1]]);
        Ok(Teardown {
            response_mac: ResponseMac::read(&body[1..]),
            nonce: Nonce::read(&body[1 + MAC_LEN..]),
            gateway: SocketAddr::new(read_address(&body[fixed + 2..fixed + 2 + 16])?, port),
        })
    }
}
