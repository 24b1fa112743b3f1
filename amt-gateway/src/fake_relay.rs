use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use amt_protocol::messages::{MembershipQuery, MembershipUpdate, MulticastData, RelayAdvertisement, Teardown};
use amt_protocol::{AmtMessage, Message, Nonce, ResponseMac};
use tokio::sync::mpsc;

pub(crate) const RELAY_MAC: ResponseMac = ResponseMac([0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6]);

/// A relay on loopback that answers discoveries and requests on its own and reports every
/// message it receives
pub(crate) struct FakeRelay {
    socket: Arc<tokio::net::UdpSocket>,
    received: mpsc::UnboundedReceiver<(AmtMessage, SocketAddr)>,
    discoveries: Arc<std::sync::atomic::AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

fn general_query() -> Vec<u8> {
    // IGMPv3 general query: type, max resp code, checksum, group, S/QRV, QQIC, source count
    let igmp = [0x11, 100, 0, 0, 0, 0, 0, 0, 0x02, 125, 0, 0];
    amt_protocol::ipv4::Header {
        tos: 0xc0,
        ttl: 1,
        protocol: amt_protocol::ipv4::PROTOCOL_IGMP,
        source: Ipv4Addr::LOCALHOST,
        destination: Ipv4Addr::new(224, 0, 0, 1),
        options: vec![0x94, 0x04, 0x00, 0x00],
    }
    .build(&igmp)
    .unwrap()
}

impl FakeRelay {
    pub(crate) async fn spawn() -> FakeRelay {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let discoveries = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (reports, received) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let socket = socket.clone();
            let discoveries = discoveries.clone();
            async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    let Ok((size, from)) = socket.recv_from(&mut buf).await else {
                        return;
                    };
                    let Ok(message) = AmtMessage::from_slice(&buf[..size]) else {
                        continue;
                    };

                    let reply = match &message {
                        AmtMessage::RelayDiscovery(discovery) => {
                            discoveries.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            Some(
                                RelayAdvertisement {
                                    nonce: discovery.nonce,
                                    relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                                }
                                .encode(),
                            )
                        }
                        AmtMessage::RelayRequest(request) => Some(
                            MembershipQuery {
                                limited: false,
                                response_mac: RELAY_MAC,
                                nonce: request.nonce,
                                query: general_query(),
                                gateway: Some(from),
                            }
                            .encode(),
                        ),
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        let _ = socket.send_to(&reply, from).await;
                    }

                    let _ = reports.send((message, from));
                }
            }
        });

        FakeRelay {
            socket,
            received,
            discoveries,
            task,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    pub(crate) fn discoveries(&self) -> usize {
        self.discoveries.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub(crate) async fn next(&mut self) -> (AmtMessage, SocketAddr) {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("relay received nothing")
            .expect("relay stopped")
    }

    pub(crate) async fn next_update(&mut self) -> (MembershipUpdate, SocketAddr) {
        loop {
            if let (AmtMessage::MembershipUpdate(update), from) = self.next().await {
                return (update, from);
            }
        }
    }

    pub(crate) async fn next_teardown(&mut self) -> Teardown {
        loop {
            if let (AmtMessage::Teardown(teardown), _) = self.next().await {
                return teardown;
            }
        }
    }

    /// Drains everything received so far and counts the membership updates among it
    pub(crate) fn pending_updates(&mut self) -> usize {
        let mut updates = 0;
        while let Ok((message, _)) = self.received.try_recv() {
            if matches!(message, AmtMessage::MembershipUpdate(_)) {
                updates += 1;
            }
        }
        updates
    }

    pub(crate) async fn send_raw(&self, to: SocketAddr, bytes: &[u8]) {
        self.socket.send_to(bytes, to).await.unwrap();
    }

    pub(crate) async fn send_data(&self, to: SocketAddr, payload: &[u8]) {
        let data = MulticastData::encapsulate(
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 5000),
            SocketAddrV4::new(Ipv4Addr::new(232, 1, 1, 1), 9002),
            64,
            payload,
        )
        .unwrap();
        self.send_raw(to, &data.encode()).await;
    }

    pub(crate) async fn send_query(&self, to: SocketAddr, response_mac: ResponseMac, nonce: Nonce) {
        let query = MembershipQuery {
            limited: false,
            response_mac,
            nonce,
            query: general_query(),
            gateway: Some(to),
        };
        self.send_raw(to, &query.encode()).await;
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
