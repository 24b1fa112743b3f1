use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::fib::{Fib, Resolution};
use crate::registration::{Directory, MulticastMenu, Registrar, RegistrationError, RegistrationJob};

#[derive(Debug, thiserror::Error)]
pub enum TranslatorError {
    #[error("The translator can only be started once")]
    AlreadyStarted,
    #[error("Unable to bind unicast socket on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        source: std::io::Error,
    },
    #[error("Unable to create multicast socket on {source_ip}: {source}")]
    MulticastSocket {
        source_ip: Ipv4Addr,
        source: std::io::Error,
    },
    #[error("Unable to spawn {0}: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Receives unicast streams and republishes each client's packets on a multicast group of
/// its own.
pub struct Translator {
    config: mcast_config::TranslatorConfig,
    listen_ip: Ipv4Addr,
    // Interface multicast leaves from and the source announced to the directory
    source_ip: Ipv4Addr,
    fib: Arc<Fib>,
    directory: Option<Arc<dyn Directory>>,
    local_addr: OnceLock<SocketAddr>,
    terminate: watch::Sender<bool>,
    // Taken by the first successful start
    terminated_notifier: Mutex<Option<watch::Sender<bool>>>,
    terminated: watch::Receiver<bool>,
}

impl Translator {
    pub fn new(config: mcast_config::TranslatorConfig) -> Result<Self, TranslatorError> {
        let directory: Option<Arc<dyn Directory>> = if config.registration.enabled {
            Some(Arc::new(MulticastMenu::new(&config.registration)?))
        } else {
            None
        };
        Ok(Self::with_directory(config, directory))
    }

    pub fn with_directory(config: mcast_config::TranslatorConfig, directory: Option<Arc<dyn Directory>>) -> Self {
        let listen_ip = config
            .unicast
            .listen_ip
            .unwrap_or_else(|| crate::interface::resolve_egress_ipv4(crate::interface::DEFAULT_PROBE_DESTINATION));
        let source_ip = crate::interface::resolve_egress_ipv4(config.multicast.address_space.nth(1));

        if !config.multicast.address_space.is_multicast() {
            tracing::warn!(
                "Address space {} is not multicast; packets will be sent as unicast",
                config.multicast.address_space
            );
        }

        let fib = Arc::new(Fib::new(
            config.multicast.address_space,
            config.allocation.random_attempts,
        ));
        let (terminate, _) = watch::channel(false);
        let (terminated_notifier, terminated) = watch::channel(false);

        Translator {
            config,
            listen_ip,
            source_ip,
            fib,
            directory,
            local_addr: OnceLock::new(),
            terminate,
            terminated_notifier: Mutex::new(Some(terminated_notifier)),
            terminated,
        }
    }

    pub fn listen_ip(&self) -> Ipv4Addr {
        self.listen_ip
    }

    pub fn source_ip(&self) -> Ipv4Addr {
        self.source_ip
    }

    /// Address of the unicast socket once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn fib(&self) -> &Fib {
        &self.fib
    }

    /// Binds both sockets and spawns the forwarding task. Returns as soon as the task is running.
    pub fn start(&self) -> Result<(), TranslatorError> {
        let mut terminated_notifier = self.terminated_notifier.lock().unwrap_or_else(PoisonError::into_inner);
        if terminated_notifier.is_none() {
            return Err(TranslatorError::AlreadyStarted);
        }

        // Nothing is consumed until the sockets are bound, so a failed start can be retried
        let forwarding = self.open()?;
        let terminated_notifier = terminated_notifier.take().ok_or(TranslatorError::AlreadyStarted)?;

        tokio::task::Builder::new()
            .name("translator forwarding")
            .spawn(forwarding.run(self.terminate.subscribe(), terminated_notifier))
            .map_err(|e| TranslatorError::Spawn("forwarding task", e))?;

        if let Some(idle_timeout) = self.config.allocation.idle_timeout {
            let sweep = tokio::task::Builder::new().name("translator idle sweep").spawn(sweep_idle_clients(
                self.fib.clone(),
                idle_timeout,
                self.config.allocation.sweep_interval,
                self.terminate.subscribe(),
            ));
            if let Err(e) = sweep {
                tracing::warn!("Idle client eviction disabled: {}", e);
            }
        }

        Ok(())
    }

    fn open(&self) -> Result<Forwarding, TranslatorError> {
        let bind_addr = SocketAddrV4::new(self.listen_ip, self.config.unicast.port);
        let unicast = crate::interface::bind_unicast_socket(bind_addr)
            .map_err(|source| TranslatorError::Bind { addr: bind_addr, source })?;
        let multicast = crate::interface::multicast_socket(self.source_ip, self.config.multicast.ttl).map_err(
            |source| TranslatorError::MulticastSocket {
                source_ip: self.source_ip,
                source,
            },
        )?;

        let registrar = self
            .directory
            .clone()
            .map(|directory| Registrar::new(directory, self.config.registration.workers))
            .transpose()
            .map_err(|e| TranslatorError::Spawn("registration workers", e))?;

        if let Ok(local_addr) = unicast.local_addr() {
            let _ = self.local_addr.set(local_addr);
        }

        tracing::info!(
            "Translating unicast on {} to multicast {} port {} (ttl {})",
            self.local_addr().map_or_else(|| bind_addr.to_string(), |addr| addr.to_string()),
            self.config.multicast.address_space,
            self.config.multicast.port,
            self.config.multicast.ttl
        );

        Ok(Forwarding {
            unicast,
            multicast,
            fib: self.fib.clone(),
            registrar,
            source_ip: self.source_ip,
            multicast_port: self.config.multicast.port,
            read_timeout: self.config.unicast.read_timeout,
            buffer_size: self.config.unicast.read_buffer_size,
        })
    }

    /// Signals the forwarding task to stop. With `blocking` set, waits (up to `timeout`, if
    /// given) until it has released its sockets. Returns whether termination completed.
    pub async fn terminate(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        self.terminate.send_replace(true);

        // Never started: nothing to wait for, and it must not start afterwards
        if let Some(terminated_notifier) = self
            .terminated_notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            terminated_notifier.send_replace(true);
        }

        if !blocking {
            return *self.terminated.borrow();
        }

        let mut terminated = self.terminated.clone();
        let wait = async move { terminated.wait_for(|terminated| *terminated).await.is_ok() };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }
}

struct Forwarding {
    unicast: tokio::net::UdpSocket,
    multicast: tokio::net::UdpSocket,
    fib: Arc<Fib>,
    registrar: Option<Registrar>,
    source_ip: Ipv4Addr,
    multicast_port: u16,
    read_timeout: Duration,
    buffer_size: usize,
}

impl Forwarding {
    async fn run(self, mut terminate: watch::Receiver<bool>, terminated_notifier: watch::Sender<bool>) {
        let mut buf = vec![0u8; self.buffer_size];
        let mut forwarded: u64 = 0;

        loop {
            let received = tokio::select! {
                biased;
                _ = terminate.wait_for(|terminate| *terminate) => break,
                received = tokio::time::timeout(self.read_timeout, self.unicast.recv_from(&mut buf)) => received,
            };

            let (size, from) = match received {
                // Idle; loop around to check for termination
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::event!(tracing::Level::WARN, error = %e, "UNICAST_RECV_ERROR");
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let client = match from {
                SocketAddr::V4(client) => client,
                SocketAddr::V6(client) => {
                    tracing::event!(tracing::Level::DEBUG, client = %client, "NON_IPV4_CLIENT_IGNORED");
                    continue;
                }
            };

            if self.forward(client, &buf[..size]).await {
                forwarded += 1;
            }
        }

        let Forwarding {
            unicast,
            multicast,
            fib,
            registrar,
            ..
        } = self;
        drop(unicast);
        drop(multicast);

        if let Some(registrar) = registrar {
            registrar.shutdown().await;
        }

        tracing::info!(
            "Translator terminated after forwarding {} packets for {} clients",
            forwarded,
            fib.len()
        );
        terminated_notifier.send_replace(true);
    }

    async fn forward(&self, client: SocketAddrV4, payload: &[u8]) -> bool {
        let group = match self.fib.resolve(client, Instant::now()) {
            Resolution::Existing(group) => group,
            Resolution::Allocated(group) => {
                tracing::event!(tracing::Level::INFO, client = %client, group = %group, "GROUP_ALLOCATED");
                if let Some(registrar) = &self.registrar {
                    let job = RegistrationJob::translated(group, self.source_ip, self.multicast_port, *client.ip());
                    if !registrar.submit(job) {
                        tracing::event!(tracing::Level::DEBUG, group = %group, "REGISTRATION_SKIPPED");
                    }
                }
                group
            }
            Resolution::Exhausted => {
                tracing::event!(
                    tracing::Level::WARN,
                    client = %client,
                    size = payload.len(),
                    "PACKET_DROPPED_ADDRESS_SPACE_EXHAUSTED"
                );
                return false;
            }
        };

        let destination = SocketAddrV4::new(group, self.multicast_port);
        match self.multicast.send_to(payload, destination).await {
            Ok(sent) if sent == payload.len() => true,
            Ok(sent) => {
                tracing::event!(
                    tracing::Level::WARN,
                    group = %group,
                    sent,
                    size = payload.len(),
                    "MULTICAST_PARTIAL_SEND"
                );
                false
            }
            Err(e) => {
                tracing::event!(tracing::Level::WARN, group = %group, error = %e, "MULTICAST_SEND_FAILED");
                false
            }
        }
    }
}

async fn sweep_idle_clients(
    fib: Arc<Fib>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    mut terminate: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = terminate.wait_for(|terminate| *terminate) => return,
            _ = interval.tick() => {}
        }

        for (client, group) in fib.evict_idle(Instant::now(), idle_timeout) {
            tracing::event!(tracing::Level::INFO, client = %client, group = %group, "CLIENT_EVICTED");
        }
    }
}
