use std::net::Ipv4Addr;

/// A CIDR block that multicast groups are allocated from. Index 0 is the network address and
/// index `size() - 1` the broadcast address; neither is ever handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    network: ipnet::Ipv4Net,
}

impl AddressSpace {
    pub fn new(network: ipnet::Ipv4Net) -> Result<Self, crate::ConfigError> {
        if network.prefix_len() >= 31 {
            return Err(crate::ConfigError::NoHostAddresses(network));
        }
        Ok(AddressSpace {
            network: network.trunc(),
        })
    }

    pub fn network(&self) -> ipnet::Ipv4Net {
        self.network
    }

    /// Total number of addresses in the block, including network and broadcast
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.network.prefix_len())
    }

    /// Number of addresses that can be allocated
    pub fn usable(&self) -> u64 {
        self.size() - 2
    }

    /// The address at `index` within the block; `index` must be below `size()`
    pub fn nth(&self, index: u64) -> Ipv4Addr {
        debug_assert!(index < self.size());
        Ipv4Addr::from(u32::from(self.network.network()) + index as u32)
    }

    pub fn index_of(&self, address: Ipv4Addr) -> Option<u64> {
        self.network
            .contains(&address)
            .then(|| (u32::from(address) - u32::from(self.network.network())) as u64)
    }

    pub fn is_multicast(&self) -> bool {
        self.network.network().is_multicast() && self.network.broadcast().is_multicast()
    }
}

impl std::fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.network)
    }
}

impl std::str::FromStr for AddressSpace {
    type Err = crate::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let network = s
            .parse::<ipnet::Ipv4Net>()
            .map_err(|e| crate::ConfigError::InvalidAddressSpace(s.to_string(), e))?;
        AddressSpace::new(network)
    }
}
