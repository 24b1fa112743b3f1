use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Hands decapsulated payloads to the local consumer listening on a fixed loopback port
pub struct LocalGate {
    socket: tokio::net::UdpSocket,
    destination: SocketAddr,
}

impl LocalGate {
    pub fn new(loopback: Ipv4Addr, udp_port: u16) -> std::io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(SocketAddrV4::new(loopback, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(std_socket)?;
        let destination = SocketAddr::V4(SocketAddrV4::new(loopback, udp_port));

        tracing::info!("Forwarding decapsulated payload to {}", destination);

        Ok(LocalGate { socket, destination })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub async fn send_to_application(&self, data: &[u8]) -> std::io::Result<()> {
        let sent = self.socket.send_to(data, self.destination).await?;

        if sent != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("Partial send: {} of {} bytes", sent, data.len()),
            ));
        }

        Ok(())
    }
}
