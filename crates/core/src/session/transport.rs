use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

/// Client-requested transport from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001
/// Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportHeader {
    /// Parse a `Transport` header value.
    ///
    /// Clients may offer several comma-separated alternatives; the first
    /// supported one wins. Returns `None` when nothing offered is supported
    /// (multicast, unknown profile, missing ports), which maps to
    /// `461 Unsupported Transport`.
    ///
    /// ```
    /// use camcast::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th, TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 });
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;multicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        header.split(',').find_map(Self::parse_one)
    }

    fn parse_one(spec: &str) -> Option<Self> {
        let mut parts = spec.split(';').map(str::trim);
        let profile = parts.next()?.to_ascii_uppercase();
        let tcp = match profile.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return None,
        };

        let mut client_port = None;
        let mut interleaved = None;
        for part in parts {
            if part.eq_ignore_ascii_case("multicast") {
                return None;
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                client_port = Some(parse_pair::<u16>(ports)?);
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                interleaved = Some(parse_pair::<u8>(channels)?);
            }
        }

        if tcp {
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            Some(Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            })
        } else {
            let (client_rtp_port, client_rtcp_port) = client_port?;
            if client_rtp_port == 0 {
                return None;
            }
            Some(Self::Udp {
                client_rtp_port,
                client_rtcp_port,
            })
        }
    }
}

/// `a-b`, or a single `a` meaning `a-(a+1)`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32> + Into<u32>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(a.into() + 1).ok()?;
            Some((a, b))
        }
    }
}

/// Negotiated transport for a session, as echoed back in the SETUP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp {
        /// `client_ip:client_rtp_port`, where RTP is sent.
        client_addr: SocketAddr,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl Transport {
    /// Resolve a request against the client's address and the server's
    /// RTP port.
    pub fn negotiate(request: TransportHeader, client_ip: SocketAddr, server_rtp_port: u16) -> Self {
        match request {
            TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => Self::Udp {
                client_addr: SocketAddr::new(client_ip.ip(), client_rtp_port),
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port: server_rtp_port.wrapping_add(1),
            },
            TransportHeader::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            },
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Self::Udp { .. })
    }

    /// Value of the `Transport` response header.
    pub fn response_header(&self) -> String {
        match self {
            Self::Udp {
                client_addr,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                client_addr.port(),
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"),
        }
    }
}

/// Writer for one session's RTP packets.
#[derive(Debug, Clone)]
pub enum MediaSink {
    /// Datagrams from the server's shared RTP socket.
    Udp {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
    /// `$` framing on the RTSP control connection (RFC 2326 §10.12). The
    /// writer is shared with the connection's response path.
    Interleaved {
        writer: Arc<Mutex<TcpStream>>,
        channel: u8,
    },
}

impl MediaSink {
    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp { socket, addr } => socket.send_to(packet, addr).map(|_| ()),
            Self::Interleaved { writer, channel } => {
                let len = u16::try_from(packet.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "RTP packet too large"))?;
                let mut frame = Vec::with_capacity(4 + packet.len());
                frame.push(b'$');
                frame.push(*channel);
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(packet);
                writer.lock().write_all(&frame)
            }
        }
    }

    /// Whether a write error means the client is gone for good.
    pub fn is_fatal(&self, error: &io::Error) -> bool {
        match self {
            Self::Udp { .. } => false,
            Self::Interleaved { .. } => error.kind() != io::ErrorKind::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp() {
        assert_eq!(
            TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001"),
            Some(TransportHeader::Udp {
                client_rtp_port: 5000,
                client_rtcp_port: 5001
            })
        );
        assert_eq!(
            TransportHeader::parse("RTP/AVP/UDP;unicast;client_port=6000"),
            Some(TransportHeader::Udp {
                client_rtp_port: 6000,
                client_rtcp_port: 6001
            })
        );
    }

    #[test]
    fn parse_interleaved() {
        assert_eq!(
            TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3"),
            Some(TransportHeader::Interleaved {
                rtp_channel: 2,
                rtcp_channel: 3
            })
        );
        assert_eq!(
            TransportHeader::parse("RTP/AVP/TCP;unicast"),
            Some(TransportHeader::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1
            })
        );
    }

    #[test]
    fn unsupported_transports() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
        assert!(TransportHeader::parse("RTP/AVP;multicast;client_port=5000-5001").is_none());
        assert!(TransportHeader::parse("RAW/RAW/UDP;unicast;client_port=1-2").is_none());
        assert!(TransportHeader::parse("RTP/AVP;unicast;client_port=x-y").is_none());
    }

    #[test]
    fn first_supported_alternative_wins() {
        assert_eq!(
            TransportHeader::parse(
                "RTP/AVP;multicast,RTP/AVP/TCP;unicast;interleaved=0-1,RTP/AVP;unicast;client_port=1-2"
            ),
            Some(TransportHeader::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1
            })
        );
    }

    #[test]
    fn negotiated_response_headers() {
        let peer: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let udp = Transport::negotiate(
            TransportHeader::Udp {
                client_rtp_port: 8000,
                client_rtcp_port: 8001,
            },
            peer,
            5004,
        );
        assert_eq!(
            udp.response_header(),
            "RTP/AVP;unicast;client_port=8000-8001;server_port=5004-5005"
        );
        assert!(matches!(udp, Transport::Udp { client_addr, .. } if client_addr == "10.0.0.2:8000".parse().unwrap()));

        let tcp = Transport::negotiate(
            TransportHeader::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1,
            },
            peer,
            5004,
        );
        assert!(!tcp.is_udp());
        assert_eq!(tcp.response_header(), "RTP/AVP/TCP;unicast;interleaved=0-1");
    }

    #[test]
    fn udp_sink_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let sink = MediaSink::Udp {
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            addr: receiver.local_addr().unwrap(),
        };
        sink.send(&[0x80, 96, 0, 1]).unwrap();
        let mut buf = [0u8; 16];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 96, 0, 1]);
    }
}
