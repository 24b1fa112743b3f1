use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod address_space;
mod serdes;

pub use address_space::AddressSpace;

pub const DEFAULT_UNICAST_PORT: u16 = 9001;
pub const DEFAULT_MULTICAST_PORT: u16 = 9002;
pub const DEFAULT_MULTICAST_ADDRESS_SPACE: &str = "232.0.0.0/8";
pub const DEFAULT_DIRECTORY_ADD_URL: &str = "https://menu.treedn.net/api/add/";
pub const DEFAULT_RELAY: &str = "amt-relay.m2icast.net";
pub const DEFAULT_RELAY_IPS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(162, 250, 137, 254),
    Ipv4Addr::new(162, 250, 136, 101),
    Ipv4Addr::new(164, 113, 199, 110),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The address space {0} only contains a network address and a broadcast address, but no host addresses")]
    NoHostAddresses(ipnet::Ipv4Net),
    #[error("Invalid address space '{0}': {1}")]
    InvalidAddressSpace(String, ipnet::AddrParseError),
    #[error("Unable to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Reads a TOML configuration file; missing fields take their defaults
pub fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub unicast: UnicastConfig,
    pub multicast: MulticastConfig,
    pub allocation: AllocationConfig,
    pub registration: RegistrationConfig,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UnicastConfig {
    // If unset, the address of the interface holding the default route is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_ip: Option<Ipv4Addr>,
    pub port: u16,
    pub read_buffer_size: usize,
    // Lower values make termination more responsive at the cost of more idle wake-ups
    #[serde(
        serialize_with = "serdes::serialize_duration",
        deserialize_with = "serdes::deserialize_duration"
    )]
    pub read_timeout: Duration,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        UnicastConfig {
            listen_ip: None,
            port: DEFAULT_UNICAST_PORT,
            read_buffer_size: 1514,
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    #[serde(
        serialize_with = "serdes::serialize_address_space",
        deserialize_with = "serdes::deserialize_address_space"
    )]
    pub address_space: AddressSpace,
    // Every group uses the same destination port; a stream is identified by its group alone
    pub port: u16,
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            address_space: AddressSpace::new(ipnet::Ipv4Net::new(Ipv4Addr::new(232, 0, 0, 0), 8).expect("valid prefix"))
                .expect("default address space has host addresses"),
            port: DEFAULT_MULTICAST_PORT,
            ttl: 32,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    // Random draws before falling back to linear probing
    pub random_attempts: usize,
    // Clients idle for this long lose their group; never expire when unset
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serdes::serialize_optional_duration",
        deserialize_with = "serdes::deserialize_optional_duration"
    )]
    pub idle_timeout: Option<Duration>,
    #[serde(
        serialize_with = "serdes::serialize_duration",
        deserialize_with = "serdes::deserialize_nonzero_duration"
    )]
    pub sweep_interval: Duration,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            random_attempts: 10,
            idle_timeout: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub enabled: bool,
    pub add_url: String,
    // Contact address submitted with every stream
    pub contact: String,
    pub workers: usize,
    #[serde(
        serialize_with = "serdes::serialize_duration",
        deserialize_with = "serdes::deserialize_duration"
    )]
    pub request_timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        RegistrationConfig {
            enabled: true,
            add_url: DEFAULT_DIRECTORY_ADD_URL.to_string(),
            contact: String::new(),
            workers: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub relay_port: u16,
    // Applies to every handshake read and to each idle wait while relaying
    #[serde(
        serialize_with = "serdes::serialize_duration",
        deserialize_with = "serdes::deserialize_duration"
    )]
    pub socket_timeout: Duration,
    #[serde(
        serialize_with = "serdes::serialize_duration",
        deserialize_with = "serdes::deserialize_duration"
    )]
    pub heartbeat_after: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: BackoffConfig,
    pub read_buffer_size: usize,
    pub local_loopback: Ipv4Addr,
    pub join_local_group: bool,
    // Log a progress line every this many forwarded packets
    pub progress_log_interval: u64,
    // Logical relay names and the addresses they rotate through
    pub relays: BTreeMap<String, Vec<Ipv4Addr>>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            relay_port: amt_protocol::AMT_PORT,
            socket_timeout: Duration::from_secs(60),
            heartbeat_after: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_backoff: BackoffConfig::default(),
            read_buffer_size: 65536,
            local_loopback: Ipv4Addr::LOCALHOST,
            join_local_group: true,
            progress_log_interval: 1000,
            relays: BTreeMap::from([(DEFAULT_RELAY.to_string(), DEFAULT_RELAY_IPS.to_vec())]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        #[serde(
            serialize_with = "serdes::serialize_duration",
            deserialize_with = "serdes::deserialize_duration"
        )]
        delay: Duration,
    },
    Exponential {
        #[serde(
            serialize_with = "serdes::serialize_duration",
            deserialize_with = "serdes::deserialize_duration"
        )]
        initial_delay: Duration,
        #[serde(
            serialize_with = "serdes::serialize_duration",
            deserialize_with = "serdes::deserialize_duration"
        )]
        max_delay: Duration,
        // Fraction of the delay added or removed at random, 0.0 to 1.0
        jitter: f64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed {
            delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translator_defaults() {
        let config = TranslatorConfig::default();
        assert_eq!(config.unicast.port, 9001);
        assert_eq!(config.unicast.listen_ip, None);
        assert_eq!(config.unicast.read_timeout, Duration::from_secs(5));
        assert_eq!(config.multicast.port, 9002);
        assert_eq!(config.multicast.ttl, 32);
        assert_eq!(config.multicast.address_space.to_string(), DEFAULT_MULTICAST_ADDRESS_SPACE);
        assert_eq!(config.allocation.random_attempts, 10);
        assert_eq!(config.allocation.idle_timeout, None);
        assert_eq!(config.registration.workers, 10);
    }

    #[test]
    fn tunnel_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.relay_port, 2268);
        assert_eq!(config.socket_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_after, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(
            config.reconnect_backoff,
            BackoffConfig::Fixed {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(config.relays[DEFAULT_RELAY], DEFAULT_RELAY_IPS.to_vec());
    }

    #[test]
    fn partial_translator_file() {
        let config: TranslatorConfig = toml::from_str(
            r#"
            [unicast]
            listen_ip = "10.1.2.3"
            read_timeout = 0.5

            [multicast]
            address_space = "232.10.0.0/16"

            [allocation]
            idle_timeout = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.unicast.listen_ip, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(config.unicast.port, 9001);
        assert_eq!(config.unicast.read_timeout, Duration::from_millis(500));
        assert_eq!(config.multicast.address_space.usable(), 65534);
        assert_eq!(config.multicast.port, 9002);
        assert_eq!(config.allocation.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn address_space_without_hosts_fails_to_load() {
        let result: Result<TranslatorConfig, _> = toml::from_str(
            r#"
            [multicast]
            address_space = "232.0.0.0/31"
            "#,
        );
        let error = result.unwrap_err().to_string();
        assert!(error.contains("no host addresses"), "{error}");
    }

    #[test]
    fn negative_duration_fails_to_load() {
        let result: Result<TunnelConfig, _> = toml::from_str("socket_timeout = -1.0");
        assert!(result.is_err());
    }

    #[test]
    fn zero_sweep_interval_fails_to_load() {
        let result: Result<TranslatorConfig, _> = toml::from_str(
            r#"
            [allocation]
            idle_timeout = 300
            sweep_interval = 0
            "#,
        );
        let error = result.unwrap_err().to_string();
        assert!(error.contains("greater than zero"), "{error}");
    }

    #[test]
    fn exponential_backoff_and_custom_relays() {
        let config: TunnelConfig = toml::from_str(
            r#"
            [reconnect_backoff]
            kind = "exponential"
            initial_delay = 1
            max_delay = 30
            jitter = 0.25

            [relays]
            "relay.example.net" = ["192.0.2.1", "192.0.2.2"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.reconnect_backoff,
            BackoffConfig::Exponential {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: 0.25,
            }
        );
        assert_eq!(config.relays.len(), 1);
        assert_eq!(config.relays["relay.example.net"].len(), 2);
    }

    #[test]
    fn defaults_survive_serialization() {
        let text = toml::to_string(&TranslatorConfig::default()).unwrap();
        let config: TranslatorConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.multicast.address_space, MulticastConfig::default().address_space);

        let text = toml::to_string(&TunnelConfig::default()).unwrap();
        let config: TunnelConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.relays, TunnelConfig::default().relays);
    }

    #[test]
    fn missing_file_reports_path() {
        let error = load::<TranslatorConfig>(Path::new("/nonexistent/translator.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
        assert!(error.to_string().contains("/nonexistent/translator.toml"));
    }
}
