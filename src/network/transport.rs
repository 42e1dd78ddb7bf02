//! UDP transport layer

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::error::NetworkError;

/// Receive buffer size; larger than any datagram the protocol produces
pub const RECV_BUFFER_SIZE: usize = 2048;

/// UDP socket bound locally and connected to one voice server
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl UdpTransport {
    /// Resolve `host:port`, preferring an address family matching `bind_addr`
    pub async fn resolve(
        host: &str,
        port: u16,
        bind_addr: &str,
    ) -> Result<SocketAddr, NetworkError> {
        let bind: SocketAddr = bind_addr.parse()?;
        let mut candidates: Vec<SocketAddr> =
            tokio::net::lookup_host((host, port)).await?.collect();
        candidates.sort_by_key(|addr| addr.is_ipv4() != bind.is_ipv4());
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| NetworkError::Resolve(format!("{}:{}", host, port)))
    }

    /// Bind to `bind_addr` with SO_REUSEADDR and connect to `remote_addr`
    pub async fn connect(bind_addr: &str, remote_addr: SocketAddr) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = bind_addr.parse()?;

        let domain = if parsed_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Enable SO_REUSEADDR to allow quick rebind after a call ends
        socket.set_reuse_address(true)?;

        // Set non-blocking mode for async operation
        socket.set_nonblocking(true)?;

        socket.bind(&parsed_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        socket.connect(remote_addr).await?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport {} -> {}", local_addr, remote_addr);

        Ok(Self {
            socket,
            local_addr,
            remote_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send one datagram to the server
    pub async fn send(&self, data: &[u8]) -> Result<(), NetworkError> {
        self.socket.send(data).await?;
        trace!("Sent {} bytes to {}", data.len(), self.remote_addr);
        Ok(())
    }

    /// Receive one datagram from the server
    pub async fn recv(&self) -> Result<Vec<u8>, NetworkError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        trace!("Received {} bytes from {}", len, self.remote_addr);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_send_receive() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let transport = UdpTransport::connect("127.0.0.1:0", server_addr)
            .await
            .unwrap();
        assert!(transport.local_addr().port() > 0);
        assert_eq!(transport.remote_addr(), server_addr);

        transport.send(&[1, 2, 3, 4]).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3, 4]);
        assert_eq!(from, transport.local_addr());

        server.send_to(&[9, 8], from).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), vec![9, 8]);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = UdpTransport::resolve("127.0.0.1", 5000, "0.0.0.0:0")
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
    }

    /// SO_REUSEADDR allows rebinding to the same port after drop
    #[tokio::test]
    async fn test_transport_port_reuse() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let transport = UdpTransport::connect("127.0.0.1:0", server_addr)
            .await
            .unwrap();
        let port = transport.local_addr().port();
        drop(transport);

        let again = UdpTransport::connect(&format!("127.0.0.1:{}", port), server_addr).await;
        assert!(again.is_ok(), "Should be able to rebind to same port");
        assert_eq!(again.unwrap().local_addr().port(), port);
    }
}
