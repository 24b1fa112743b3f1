pub mod codec;
pub mod igmp;
pub mod ipv4;
pub mod messages;

pub use codec::{AmtMessage, Message};
pub use messages::{Nonce, ResponseMac};

/// UDP port relays listen on for AMT traffic (RFC 7450).
pub const AMT_PORT: u16 = 2268;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodeError),
    #[error("Decoding error: {0}")]
    Decoding(#[from] DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Payload of {0} bytes does not fit in a single IPv4 datagram")]
    PayloadTooLarge(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated message: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unsupported AMT version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: u8, actual: u8 },
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("Unsupported IP version in encapsulated datagram: {0}")]
    UnsupportedIpVersion(u8),
    #[error("Encapsulated datagram carries protocol {0}, expected UDP")]
    NotUdp(u8),
    #[error("Encapsulated datagram carries protocol {0}, expected IGMP")]
    NotIgmp(u8),
    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(usize),
    #[error("Invalid address length: {0}")]
    InvalidAddressLength(usize),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Unexpected IGMP message type: {0:#04x}")]
    UnexpectedIgmpType(u8),
}
