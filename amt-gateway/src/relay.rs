use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use crate::TunnelError;

/// The addresses a logical relay name stands for, with a cursor that moves on every failover
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayPool {
    name: String,
    addresses: Vec<Ipv4Addr>,
    cursor: usize,
}

impl RelayPool {
    pub fn new(name: impl Into<String>, addresses: Vec<Ipv4Addr>) -> Result<Self, TunnelError> {
        let name = name.into();
        if addresses.is_empty() {
            return Err(TunnelError::NoRelayAddresses(name));
        }
        Ok(RelayPool {
            name,
            addresses,
            cursor: 0,
        })
    }

    /// Literal addresses stand alone, known names come from `catalogue` and anything else is
    /// looked up in DNS
    pub async fn resolve(name: &str, catalogue: &BTreeMap<String, Vec<Ipv4Addr>>) -> Result<Self, TunnelError> {
        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            return RelayPool::new(name, vec![ip]);
        }
        if let Some(addresses) = catalogue.get(name) {
            return RelayPool::new(name, addresses.clone());
        }

        let mut addresses = Vec::new();
        for addr in tokio::net::lookup_host((name, amt_protocol::AMT_PORT))
            .await
            .map_err(|e| TunnelError::Resolve(name.to_string(), e))?
        {
            if let IpAddr::V4(ip) = addr.ip() {
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }

        tracing::info!("Resolved relay {} to {:?}", name, addresses);
        RelayPool::new(name, addresses)
    }

    pub fn starting_at(mut self, index: usize) -> Self {
        self.cursor = index % self.addresses.len();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn current(&self) -> Ipv4Addr {
        self.addresses[self.cursor]
    }

    /// Moves on to the next address, wrapping around, and returns it
    pub fn rotate(&mut self) -> Ipv4Addr {
        self.cursor = (self.cursor + 1) % self.addresses.len();
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> BTreeMap<String, Vec<Ipv4Addr>> {
        mcast_config::TunnelConfig::default().relays
    }

    #[tokio::test]
    async fn known_relay_expands_to_catalogue_addresses() {
        let pool = RelayPool::resolve(mcast_config::DEFAULT_RELAY, &catalogue()).await.unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.current(), mcast_config::DEFAULT_RELAY_IPS[0]);
    }

    #[tokio::test]
    async fn literal_address_is_a_pool_of_one() {
        let mut pool = RelayPool::resolve("192.0.2.7", &catalogue()).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.current(), Ipv4Addr::new(192, 0, 2, 7));
        assert_eq!(pool.rotate(), Ipv4Addr::new(192, 0, 2, 7));
    }

    #[tokio::test]
    async fn localhost_resolves_through_dns() {
        let pool = RelayPool::resolve("localhost", &BTreeMap::new()).await.unwrap();
        assert_eq!(pool.current(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn rotation_wraps_around() {
        let mut pool = RelayPool::new("relay", mcast_config::DEFAULT_RELAY_IPS.to_vec()).unwrap();
        assert_eq!(pool.rotate(), mcast_config::DEFAULT_RELAY_IPS[1]);
        assert_eq!(pool.rotate(), mcast_config::DEFAULT_RELAY_IPS[2]);
        assert_eq!(pool.rotate(), mcast_config::DEFAULT_RELAY_IPS[0]);
    }

    #[test]
    fn starting_index_wraps() {
        let pool = RelayPool::new("relay", mcast_config::DEFAULT_RELAY_IPS.to_vec())
            .unwrap()
            .starting_at(4);
        assert_eq!(pool.current(), mcast_config::DEFAULT_RELAY_IPS[1]);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            RelayPool::new("nowhere", Vec::new()),
            Err(TunnelError::NoRelayAddresses(_))
        ));
    }
}
