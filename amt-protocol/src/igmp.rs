//! IGMPv3 membership reports (RFC 3376 §4.2), the payload of an AMT Membership Update.
use std::net::Ipv4Addr;

use crate::ipv4::{self, require};

pub const MEMBERSHIP_REPORT_V3: u8 = 0x22;

/// All IGMPv3-capable multicast routers
pub const REPORT_DESTINATION: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

const ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
// Internetwork control precedence, as recommended for IGMPv3 reports
const REPORT_TOS: u8 = 0xC0;
const REPORT_HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 8;

pub const MODE_IS_INCLUDE: u8 = 1;
pub const MODE_IS_EXCLUDE: u8 = 2;
pub const CHANGE_TO_INCLUDE_MODE: u8 = 3;
pub const CHANGE_TO_EXCLUDE_MODE: u8 = 4;
pub const ALLOW_NEW_SOURCES: u8 = 5;
pub const BLOCK_OLD_SOURCES: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: u8,
    pub group: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipReport {
    pub records: Vec<GroupRecord>,
}

impl MembershipReport {
    /// Report asking for traffic sent to `group` by `source` only
    pub fn include(group: Ipv4Addr, source: Ipv4Addr) -> Self {
        MembershipReport {
            records: vec![GroupRecord {
                record_type: MODE_IS_INCLUDE,
                group,
                sources: vec![source],
            }],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![MEMBERSHIP_REPORT_V3, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&(self.records.len() as u16).to_be_bytes());

        for record in &self.records {
            bytes.push(record.record_type);
            bytes.push(0); // aux data len
            bytes.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
            bytes.extend_from_slice(&record.group.octets());
            for source in &record.sources {
                bytes.extend_from_slice(&source.octets());
            }
        }

        let checksum = ipv4::checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::DecodeError> {
        require(bytes, REPORT_HEADER_LEN)?;
        if bytes[0] != MEMBERSHIP_REPORT_V3 {
            return Err(crate::DecodeError::UnexpectedIgmpType(bytes[0]));
        }
        if ipv4::checksum(bytes) != 0 {
            return Err(crate::DecodeError::ChecksumMismatch);
        }

        let record_count = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        let mut records = Vec::with_capacity(record_count);
        let mut offset = REPORT_HEADER_LEN;

        for _ in 0..record_count {
            let record = &bytes[offset..];
            require(record, RECORD_HEADER_LEN)?;

            let aux_len = record[1] as usize * 4;
            let source_count = u16::from_be_bytes([record[2], record[3]]) as usize;
            let record_len = RECORD_HEADER_LEN + source_count * 4 + aux_len;
            require(record, record_len)?;

            let sources = record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + source_count * 4]
                .chunks_exact(4)
                .map(|octets| Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
                .collect();

            records.push(GroupRecord {
                record_type: record[0],
                group: Ipv4Addr::new(record[4], record[5], record[6], record[7]),
                sources,
            });
            offset += record_len;
        }

        Ok(MembershipReport { records })
    }

    /// The report as the IPv4 datagram a host would send: unspecified source, TTL 1, Router Alert.
    pub fn encapsulate(&self) -> Result<Vec<u8>, crate::EncodeError> {
        ipv4::Header {
            tos: REPORT_TOS,
            ttl: 1,
            protocol: ipv4::PROTOCOL_IGMP,
            source: Ipv4Addr::UNSPECIFIED,
            destination: REPORT_DESTINATION,
            options: ROUTER_ALERT.to_vec(),
        }
        .build(&self.to_bytes())
    }

    pub fn decapsulate(datagram: &[u8]) -> Result<Self, crate::DecodeError> {
        let datagram = ipv4::Datagram::parse(datagram)?;
        if datagram.protocol != ipv4::PROTOCOL_IGMP {
            return Err(crate::DecodeError::NotIgmp(datagram.protocol));
        }
        Self::from_bytes(datagram.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_report_layout() {
        let group = Ipv4Addr::new(232, 162, 250, 140);
        let source = Ipv4Addr::new(162, 250, 138, 201);
        let bytes = MembershipReport::include(group, source).to_bytes();

        assert_eq!(bytes.len(), 8 + 8 + 4);
        assert_eq!(bytes[0], MEMBERSHIP_REPORT_V3);
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(bytes[8], MODE_IS_INCLUDE);
        assert_eq!(&bytes[10..12], &[0, 1]);
        assert_eq!(&bytes[12..16], &group.octets());
        assert_eq!(&bytes[16..20], &source.octets());
        assert_eq!(ipv4::checksum(&bytes), 0);
    }

    #[test]
    fn encapsulated_report_can_be_read_back() {
        let report = MembershipReport::include(Ipv4Addr::new(232, 0, 0, 9), Ipv4Addr::new(198, 51, 100, 7));
        let datagram = report.encapsulate().unwrap();

        let parsed = ipv4::Datagram::parse(&datagram).unwrap();
        assert_eq!(parsed.ttl, 1);
        assert_eq!(parsed.destination, REPORT_DESTINATION);
        assert_eq!(parsed.source, Ipv4Addr::UNSPECIFIED);
        assert_eq!(parsed.options, &ROUTER_ALERT);

        assert_eq!(MembershipReport::decapsulate(&datagram).unwrap(), report);
    }

    #[test]
    fn corrupted_report_fails_checksum() {
        let mut bytes = MembershipReport::include(Ipv4Addr::new(232, 0, 0, 9), Ipv4Addr::new(198, 51, 100, 7))
            .to_bytes();
        bytes[13] ^= 0xFF;

        assert_eq!(
            MembershipReport::from_bytes(&bytes).unwrap_err(),
            crate::DecodeError::ChecksumMismatch
        );
    }

    #[test]
    fn record_with_missing_sources_is_truncated() {
        let mut bytes = MembershipReport::include(Ipv4Addr::new(232, 0, 0, 9), Ipv4Addr::new(198, 51, 100, 7))
            .to_bytes();
        // Claim three sources but only carry one, then fix up the checksum
        bytes[11] = 3;
        bytes[2..4].copy_from_slice(&[0, 0]);
        let checksum = ipv4::checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());

        assert!(matches!(
            MembershipReport::from_bytes(&bytes),
            Err(crate::DecodeError::Truncated { .. })
        ));
    }
}
