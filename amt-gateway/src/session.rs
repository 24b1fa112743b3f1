use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use amt_protocol::messages::{
    MembershipQuery, MembershipUpdate, MulticastData, RelayAdvertisement, RelayDiscovery, RelayRequest, Teardown,
};
use amt_protocol::{Message, Nonce, ResponseMac};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::gate::LocalGate;
use crate::{Stream, TunnelError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Requesting,
    AwaitingQuery,
    Joined,
    Relaying,
    Reconnecting,
    Terminated,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Discovering => "DISCOVERING",
            SessionState::Requesting => "REQUESTING",
            SessionState::AwaitingQuery => "AWAITING_QUERY",
            SessionState::Joined => "JOINED",
            SessionState::Relaying => "RELAYING",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Terminated => "TERMINATED",
        };
        write!(f, "{name}")
    }
}

/// One tunnel to one relay. A reconnect always builds a new session.
pub struct AmtSession {
    relay: SocketAddrV4,
    socket: tokio::net::UdpSocket,
    stream: Stream,
    nonce: Nonce,
    response_mac: ResponseMac,
    // Our address as the relay sees it, if it told us
    gateway: Option<SocketAddr>,
    packets: u64,
    last_packet: Instant,
    state: SessionState,
    socket_timeout: Duration,
    heartbeat_after: Duration,
    progress_log_interval: u64,
    read_buffer_size: usize,
    join_local_group: bool,
}

fn bind_amt_socket(port: u16) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_socket)
}

pub(crate) fn log_transition(relay: SocketAddrV4, from: SessionState, to: SessionState) {
    tracing::event!(
        tracing::Level::INFO,
        relay = %relay,
        from = %from,
        to = %to,
        "SESSION_STATE"
    );
}

impl AmtSession {
    /// Runs the handshake with `relay_ip` up to the point where the membership update is sent
    pub async fn establish(
        relay_ip: Ipv4Addr,
        stream: Stream,
        config: &mcast_config::TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let socket = bind_amt_socket(stream.amt_port)?;

        let mut session = AmtSession {
            relay: SocketAddrV4::new(relay_ip, config.relay_port),
            socket,
            stream,
            nonce: Nonce::random(),
            response_mac: ResponseMac::default(),
            gateway: None,
            packets: 0,
            last_packet: Instant::now(),
            state: SessionState::Discovering,
            socket_timeout: config.socket_timeout,
            heartbeat_after: config.heartbeat_after,
            progress_log_interval: config.progress_log_interval.max(1),
            read_buffer_size: config.read_buffer_size,
            join_local_group: config.join_local_group,
        };

        tracing::info!(
            "Attempting to set up AMT tunnel with relay {} from {}",
            session.relay,
            session.local_addr()?
        );

        if let Err(e) = session.handshake().await {
            session.transition(SessionState::Reconnecting);
            return Err(e);
        }
        Ok(session)
    }

    async fn handshake(&mut self) -> Result<(), TunnelError> {
        self.discover().await?;
        self.request().await?;
        self.join().await
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn relay_addr(&self) -> SocketAddrV4 {
        self.relay
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn response_mac(&self) -> ResponseMac {
        self.response_mac
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub(crate) fn transition(&mut self, to: SessionState) {
        log_transition(self.relay, self.state, to);
        self.state = to;
    }

    async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(bytes, self.relay).await?;
        Ok(())
    }

    /// Waits until `deadline` for a `T` that `accept` approves of, skipping anything else
    async fn receive<T: Message>(
        &self,
        deadline: Instant,
        expecting: &'static str,
        accept: impl Fn(&T) -> bool,
    ) -> Result<T, TunnelError> {
        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            let (size, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| TunnelError::Timeout(expecting))??;

            match T::decode(&buf[..size]) {
                Ok(message) if accept(&message) => return Ok(message),
                Ok(_) => {
                    tracing::event!(tracing::Level::DEBUG, from = %from, expecting, "NONCE_MISMATCH_IGNORED");
                }
                Err(e) => {
                    tracing::event!(
                        tracing::Level::DEBUG,
                        from = %from,
                        expecting,
                        error = %e,
                        "UNEXPECTED_DATAGRAM_IGNORED"
                    );
                }
            }
        }
    }

    async fn discover(&mut self) -> Result<(), TunnelError> {
        self.send(&RelayDiscovery { nonce: self.nonce }.encode()).await?;
        tracing::info!("Sent AMT relay discovery to {} with nonce {}", self.relay, self.nonce);

        let nonce = self.nonce;
        let advertisement: RelayAdvertisement = self
            .receive(
                Instant::now() + self.socket_timeout,
                "relay advertisement",
                |advertisement: &RelayAdvertisement| advertisement.nonce == nonce,
            )
            .await?;

        match advertisement.relay_address {
            IpAddr::V4(ip) => {
                tracing::info!("Relay {} advertised {}", self.relay, ip);
                self.relay.set_ip(ip);
            }
            IpAddr::V6(ip) => {
                tracing::warn!("Relay {} advertised IPv6 address {}; keeping the discovered one", self.relay, ip);
            }
        }
        Ok(())
    }

    async fn request(&mut self) -> Result<(), TunnelError> {
        self.transition(SessionState::Requesting);
        self.send(
            &RelayRequest {
                nonce: self.nonce,
                mld: false,
            }
            .encode(),
        )
        .await?;
        tracing::info!("Sent AMT relay request to {} with nonce {}", self.relay, self.nonce);

        self.transition(SessionState::AwaitingQuery);
        let nonce = self.nonce;
        let query: MembershipQuery = self
            .receive(
                Instant::now() + self.socket_timeout,
                "membership query",
                |query: &MembershipQuery| query.nonce == nonce,
            )
            .await?;

        tracing::info!(
            "Received AMT membership query from {} with response MAC {}",
            self.relay,
            query.response_mac
        );
        self.response_mac = query.response_mac;
        self.gateway = query.gateway;
        Ok(())
    }

    async fn join(&mut self) -> Result<(), TunnelError> {
        if self.join_local_group {
            if let Err(e) = self.socket.join_multicast_v4(self.stream.group, Ipv4Addr::UNSPECIFIED) {
                tracing::event!(
                    tracing::Level::WARN,
                    group = %self.stream.group,
                    error = %e,
                    "LOCAL_JOIN_FAILED"
                );
            }
        }

        self.send(&self.membership_update()?).await?;
        tracing::info!(
            "Sent AMT membership update to {} for group {} from source {}",
            self.relay,
            self.stream.group,
            self.stream.source
        );
        self.transition(SessionState::Joined);
        Ok(())
    }

    fn membership_update(&self) -> Result<Vec<u8>, TunnelError> {
        Ok(MembershipUpdate::join(self.response_mac, self.nonce, self.stream.group, self.stream.source)?.encode())
    }

    /// Forwards multicast data to `gate` until `stop` is raised. Any error means the tunnel is
    /// no longer usable.
    pub async fn relay(&mut self, gate: &LocalGate, stop: &mut watch::Receiver<bool>) -> Result<(), TunnelError> {
        self.transition(SessionState::Relaying);
        self.last_packet = Instant::now();
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                received = tokio::time::timeout(self.socket_timeout, self.socket.recv_from(&mut buf)) => received,
            };

            let (size, from) = match received {
                Err(_) => {
                    self.check_heartbeat().await?;
                    continue;
                }
                Ok(received) => received?,
            };

            if from.ip() != IpAddr::V4(*self.relay.ip()) {
                tracing::event!(tracing::Level::DEBUG, from = %from, "FOREIGN_DATAGRAM_IGNORED");
                continue;
            }

            let bytes = &buf[..size];
            match amt_protocol::codec::message_type(bytes)? {
                MulticastData::MESSAGE_TYPE => {
                    let payload = MulticastData::udp_payload_from_slice(bytes)?;
                    gate.send_to_application(payload)
                        .await
                        .map_err(|source| TunnelError::Forward {
                            destination: gate.destination(),
                            source,
                        })?;

                    self.packets += 1;
                    self.last_packet = Instant::now();
                    if self.packets % self.progress_log_interval == 0 {
                        tracing::info!("Received and forwarded {} packets", self.packets);
                    }
                }
                MembershipQuery::MESSAGE_TYPE => {
                    let query = MembershipQuery::decode(bytes)?;
                    self.response_mac = query.response_mac;
                    if query.gateway.is_some() {
                        self.gateway = query.gateway;
                    }
                    self.send(&self.membership_update()?).await?;
                    tracing::event!(
                        tracing::Level::INFO,
                        relay = %self.relay,
                        response_mac = %self.response_mac,
                        "MEMBERSHIP_REFRESHED"
                    );
                }
                other => {
                    tracing::event!(tracing::Level::DEBUG, message_type = other, "UNEXPECTED_MESSAGE_IGNORED");
                }
            }
        }
    }

    async fn check_heartbeat(&mut self) -> Result<(), TunnelError> {
        let idle = self.last_packet.elapsed();
        if idle < self.heartbeat_after {
            return Ok(());
        }

        tracing::warn!("No data received for {} seconds, sending heartbeat", idle.as_secs());
        let update = self.membership_update()?;
        self.send(&update).await.map_err(|e| {
            tracing::error!("Failed to send heartbeat: {}", e);
            TunnelError::Heartbeat(e)
        })
    }

    /// Asks the relay to stop forwarding. Best effort: the session is finished either way.
    pub async fn teardown(&mut self) {
        let gateway = match self.gateway {
            Some(gateway) => Some(gateway),
            None => self.local_addr().ok(),
        };

        if let Some(gateway) = gateway {
            let teardown = Teardown {
                response_mac: self.response_mac,
                nonce: self.nonce,
                gateway,
            };
            match self.send(&teardown.encode()).await {
                Ok(()) => tracing::info!("Sent AMT teardown to {}", self.relay),
                Err(e) => tracing::warn!("Failed to send AMT teardown to {}: {}", self.relay, e),
            }
        }

        self.transition(SessionState::Terminated);
    }
}
