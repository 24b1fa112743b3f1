use crate::messages::{
    MembershipQuery, MembershipUpdate, MulticastData, RelayAdvertisement, RelayDiscovery, RelayRequest, Teardown,
};

pub const VERSION: u8 = 0;

/// Reads the type nibble of an AMT message, rejecting anything that is not version 0
pub fn message_type(bytes: &[u8]) -> Result<u8, crate::DecodeError> {
    crate::ipv4::require(bytes, 1)?;
    let version = bytes[0] >> 4;
    if version != VERSION {
        return Err(crate::DecodeError::UnsupportedVersion(version));
    }
    Ok(bytes[0] & 0x0F)
}

pub trait Message: Sized {
    const MESSAGE_TYPE: u8;

    /// Writes everything after the version/type octet
    fn encode_body(&self, buf: &mut Vec<u8>);

    /// Parses everything after the version/type octet
    fn decode_body(body: &[u8]) -> Result<Self, crate::DecodeError>;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push((VERSION << 4) | Self::MESSAGE_TYPE);
        self.encode_body(&mut buf);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, crate::DecodeError> {
        let actual = message_type(bytes)?;
        if actual != Self::MESSAGE_TYPE {
            return Err(crate::DecodeError::UnexpectedMessageType {
                expected: Self::MESSAGE_TYPE,
                actual,
            });
        }
        Self::decode_body(&bytes[1..])
    }
}

/// Any AMT message, for call sites that cannot know in advance what the relay sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmtMessage {
    RelayDiscovery(RelayDiscovery),
    RelayAdvertisement(RelayAdvertisement),
    RelayRequest(RelayRequest),
    MembershipQuery(MembershipQuery),
    MembershipUpdate(MembershipUpdate),
    MulticastData(MulticastData),
    Teardown(Teardown),
}

impl AmtMessage {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, crate::DecodeError> {
        Ok(match message_type(bytes)? {
            RelayDiscovery::MESSAGE_TYPE => AmtMessage::RelayDiscovery(RelayDiscovery::decode(bytes)?),
            RelayAdvertisement::MESSAGE_TYPE => AmtMessage::RelayAdvertisement(RelayAdvertisement::decode(bytes)?),
            RelayRequest::MESSAGE_TYPE => AmtMessage::RelayRequest(RelayRequest::decode(bytes)?),
            MembershipQuery::MESSAGE_TYPE => AmtMessage::MembershipQuery(MembershipQuery::decode(bytes)?),
            MembershipUpdate::MESSAGE_TYPE => AmtMessage::MembershipUpdate(MembershipUpdate::decode(bytes)?),
            MulticastData::MESSAGE_TYPE => AmtMessage::MulticastData(MulticastData::decode(bytes)?),
            Teardown::MESSAGE_TYPE => AmtMessage::Teardown(Teardown::decode(bytes)?),
            unknown => return Err(crate::DecodeError::UnknownMessageType(unknown)),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AmtMessage::RelayDiscovery(msg) => msg.encode(),
            AmtMessage::RelayAdvertisement(msg) => msg.encode(),
            AmtMessage::RelayRequest(msg) => msg.encode(),
            AmtMessage::MembershipQuery(msg) => msg.encode(),
            AmtMessage::MembershipUpdate(msg) => msg.encode(),
            AmtMessage::MulticastData(msg) => msg.encode(),
            AmtMessage::Teardown(msg) => msg.encode(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AmtMessage::RelayDiscovery(_) => "RelayDiscovery",
            AmtMessage::RelayAdvertisement(_) => "RelayAdvertisement",
            AmtMessage::RelayRequest(_) => "RelayRequest",
            AmtMessage::MembershipQuery(_) => "MembershipQuery",
            AmtMessage::MembershipUpdate(_) => "MembershipUpdate",
            AmtMessage::MulticastData(_) => "MulticastData",
            AmtMessage::Teardown(_) => "Teardown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Nonce;

    #[test]
    fn dispatches_on_type_nibble() {
        let bytes = RelayDiscovery {
            nonce: Nonce([9, 8, 7, 6]),
        }
        .encode();

        match AmtMessage::from_slice(&bytes).unwrap() {
            AmtMessage::RelayDiscovery(discovery) => assert_eq!(discovery.nonce, Nonce([9, 8, 7, 6])),
            other => panic!("decoded as {}", other.name()),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            AmtMessage::from_slice(&[0x0F, 0, 0, 0]).unwrap_err(),
            crate::DecodeError::UnknownMessageType(0x0F)
        );
    }

    #[test]
    fn rejects_other_versions() {
        assert_eq!(
            AmtMessage::from_slice(&[0x11, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            crate::DecodeError::UnsupportedVersion(1)
        );
    }

    #[test]
    fn typed_decode_checks_type() {
        let bytes = RelayRequest {
            nonce: Nonce([0; 4]),
            mld: false,
        }
        .encode();

        assert_eq!(
            RelayDiscovery::decode(&bytes).unwrap_err(),
            crate::DecodeError::UnexpectedMessageType { expected: 1, actual: 3 }
        );
    }

    #[test]
    fn empty_datagram_is_truncated() {
        assert_eq!(
            AmtMessage::from_slice(&[]).unwrap_err(),
            crate::DecodeError::Truncated { expected: 1, actual: 0 }
        );
    }
}
