use std::net::Ipv4Addr;

pub mod gate;
pub mod relay;
pub mod session;
pub mod tunnel;

#[cfg(test)]
mod fake_relay;

pub use relay::RelayPool;
pub use session::{AmtSession, SessionState};
pub use tunnel::Tunnel;

/// The (source, group) subscription a gateway carries and the local ports it uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    // Local port the AMT socket binds; 0 picks an ephemeral one
    pub amt_port: u16,
    // Loopback port decapsulated payload is delivered to
    pub udp_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Unable to resolve relay {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("Relay {0} has no IPv4 addresses")]
    NoRelayAddresses(String),
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Malformed message from relay: {0}")]
    Decode(#[from] amt_protocol::DecodeError),
    #[error("Unable to build message: {0}")]
    Encode(#[from] amt_protocol::EncodeError),
    #[error("Unable to forward payload to {destination}: {source}")]
    Forward {
        destination: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("Failed to send heartbeat: {0}")]
    Heartbeat(std::io::Error),
    #[error("Failed to reconnect after {0} attempts")]
    BudgetExhausted(u32),
}
