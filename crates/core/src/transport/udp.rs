use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::Result;

/// The server's RTP socket, shared by every UDP session.
///
/// Sessions never bind their own ports; the port of this socket is what
/// SETUP advertises as `server_port`.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket on `ip`.
    pub fn bind(ip: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))?;
        let port = socket.local_addr()?.port();
        tracing::debug!(%ip, port, "RTP socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            port,
        })
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
