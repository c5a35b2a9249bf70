use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RtspError;
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::{self, SdpOrigin};
use crate::server::ServerConfig;
use crate::session::{
    ClientLink, MediaSink, Session, SessionRegistry, TeardownReason, Transport, TransportHeader,
};

const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

/// Where a control connection is in the RTSP exchange.
///
/// ```text
/// Connected --DESCRIBE--> Described --SETUP--> SetUp --PLAY--> Playing
///                                                ^               |
///                                                +----PAUSE------+
/// SetUp | Playing --TEARDOWN--> TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Described,
    SetUp,
    Playing,
    TornDown,
}

impl ConnectionState {
    /// Whether `method` may be sent in this state. Methods not listed here
    /// are answered 501 regardless of state.
    pub fn permits(self, method: &Method) -> bool {
        use ConnectionState::*;
        match method {
            Method::Options | Method::GetParameter | Method::SetParameter => self != TornDown,
            Method::Describe => matches!(self, Connected | Described),
            Method::Setup => self == Described,
            Method::Play => self == SetUp,
            Method::Pause => self == Playing,
            Method::Teardown => matches!(self, SetUp | Playing),
            Method::Other(_) => true,
        }
    }
}

/// A response plus whether the connection must close after sending it.
#[derive(Debug)]
pub struct Reply {
    pub response: RtspResponse,
    pub close: bool,
}

impl Reply {
    fn keep(response: RtspResponse) -> Self {
        Self {
            response,
            close: false,
        }
    }

    fn close(response: RtspResponse) -> Self {
        Self {
            response,
            close: true,
        }
    }
}

/// Media paths available to sessions created on one control connection.
pub struct PeerLink {
    pub addr: SocketAddr,
    /// Shared server RTP socket and the port it is bound to.
    pub udp: Arc<UdpSocket>,
    pub udp_port: u16,
    /// Writer for responses and interleaved RTP.
    pub writer: Arc<Mutex<TcpStream>>,
    /// Handle used to drop the connection when the server ends a session.
    pub control: Arc<TcpStream>,
}

/// Handles RTSP method requests for a single TCP connection.
///
/// Owns at most one session: one connection serves one client watching one
/// mount.
pub struct MethodHandler {
    registry: SessionRegistry,
    config: Arc<ServerConfig>,
    peer: PeerLink,
    state: ConnectionState,
    session: Option<Arc<Session>>,
}

impl MethodHandler {
    pub fn new(registry: SessionRegistry, config: Arc<ServerConfig>, peer: PeerLink) -> Self {
        MethodHandler {
            registry,
            config,
            peer,
            state: ConnectionState::Connected,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn handle(&mut self, request: &RtspRequest) -> Reply {
        let cseq = request.cseq().unwrap_or("0");

        if let Method::Other(name) = &request.method {
            tracing::warn!(peer = %self.peer.addr, method = %name, %cseq, "unsupported RTSP method");
            return Reply::keep(RtspResponse::not_implemented().add_header("CSeq", cseq));
        }

        if !self.state.permits(&request.method) {
            tracing::warn!(
                peer = %self.peer.addr,
                method = %request.method,
                state = ?self.state,
                "method not valid in this state, closing connection"
            );
            return Reply::close(
                RtspResponse::method_not_valid()
                    .add_header("CSeq", cseq)
                    .add_header("Allow", &self.allowed_methods()),
            );
        }

        if let Some(session) = &self.session {
            session.touch();
        }

        match request.method {
            Method::Options => Reply::keep(self.handle_options(cseq)),
            Method::Describe => Reply::keep(self.handle_describe(cseq, &request.uri)),
            Method::Setup => self.handle_setup(cseq, request),
            Method::Play => Reply::keep(self.handle_play(cseq, request)),
            Method::Pause => Reply::keep(self.handle_pause(cseq, request)),
            Method::Teardown => self.handle_teardown(cseq, request),
            Method::GetParameter | Method::SetParameter => {
                Reply::keep(self.handle_parameter(cseq, request))
            }
            Method::Other(_) => Reply::keep(RtspResponse::not_implemented().add_header("CSeq", cseq)),
        }
    }

    /// Tear down this connection's session, if it still has one.
    pub fn finish(&mut self, reason: TeardownReason) {
        if let Some(session) = self.session.take()
            && self.registry.close(session.id(), reason)
        {
            tracing::info!(peer = %self.peer.addr, session_id = session.id(), %reason, "session closed with connection");
        }
        self.state = ConnectionState::TornDown;
    }

    fn allowed_methods(&self) -> String {
        [
            Method::Options,
            Method::Describe,
            Method::Setup,
            Method::Play,
            Method::Pause,
            Method::Teardown,
            Method::GetParameter,
            Method::SetParameter,
        ]
        .iter()
        .filter(|m| self.state.permits(m))
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Host for SDP `o=`/`c=`: configured public host, else the host the
    /// client dialled, else the client's own address.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let host = match authority.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or(""),
                None => authority.split(':').next().unwrap_or(""),
            }
            .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.peer.addr.ip().to_string()
    }

    fn handle_describe(&mut self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let media = match self.registry.describe(uri) {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(uri, error = %e, "DESCRIBE for unknown mount");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let host = self.advertised_host(uri);
        let body = sdp::generate_sdp(
            &media,
            &SdpOrigin {
                address: &host,
                session_id: &self.config.sdp_session_id,
                session_version: &self.config.sdp_session_version,
                username: &self.config.sdp_username,
                session_name: &self.config.sdp_session_name,
            },
        );

        self.state = ConnectionState::Described;
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", uri.trim_end_matches('/')))
            .with_body(body)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> Reply {
        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(peer = %self.peer.addr, %cseq, "SETUP missing Transport header");
            return Reply::close(RtspResponse::bad_request().add_header("CSeq", cseq));
        };

        let Some(requested) = TransportHeader::parse(transport_header) else {
            tracing::warn!(peer = %self.peer.addr, transport = transport_header, "unsupported transport requested");
            return Reply::keep(
                RtspResponse::unsupported_transport()
                    .add_header("CSeq", cseq)
                    .add_header("Unsupported", "multicast"),
            );
        };

        let transport = Transport::negotiate(requested, self.peer.addr, self.peer.udp_port);
        let sink = match transport {
            Transport::Udp { client_addr, .. } => MediaSink::Udp {
                socket: self.peer.udp.clone(),
                addr: client_addr,
            },
            Transport::Interleaved { rtp_channel, .. } => MediaSink::Interleaved {
                writer: self.peer.writer.clone(),
                channel: rtp_channel,
            },
        };

        let control = self.peer.control.clone();
        let peer = self.peer.addr;
        let link = ClientLink {
            addr: self.peer.addr,
            transport,
            sink,
            on_close: Some(Box::new(move |reason: TeardownReason| {
                tracing::info!(%peer, %reason, "closing client connection");
                let _ = control.shutdown(Shutdown::Both);
            })),
        };

        let session = match self.registry.open(&request.uri, link) {
            Ok(session) => session,
            Err(e) => {
                let response = match e {
                    RtspError::MountNotFound(_) => RtspResponse::not_found(),
                    RtspError::Start { .. }
                    | RtspError::SetupTimeout { .. }
                    | RtspError::ShuttingDown => RtspResponse::service_unavailable(),
                    _ => RtspResponse::internal_error(),
                };
                tracing::warn!(peer = %self.peer.addr, uri = %request.uri, error = %e, status = response.status_code, "SETUP failed");
                return Reply::keep(response.add_header("CSeq", cseq));
            }
        };

        tracing::info!(
            session_id = session.id(),
            mount = session.mount(),
            uri = %request.uri,
            transport = %transport.response_header(),
            "session created via SETUP"
        );

        let response = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport.response_header())
            .add_header("Session", &session.session_header_value());
        self.session = Some(session);
        self.state = ConnectionState::SetUp;
        Reply::keep(response)
    }

    /// This connection's session, if the request names it.
    fn own_session(&self, request: &RtspRequest) -> Option<Arc<Session>> {
        let session = self.session.as_ref()?;
        match request.session_id() {
            Some(id) if id == session.id() => Some(session.clone()),
            _ => None,
        }
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.own_session(request) else {
            tracing::warn!(peer = %self.peer.addr, session = ?request.session_id(), "PLAY for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let (seq, rtptime) = session.instance().rtp_position();
        if let Err(e) = session.play() {
            tracing::warn!(session_id = session.id(), error = %e, "PLAY on closed session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        self.state = ConnectionState::Playing;
        tracing::info!(session_id = session.id(), "session started playing");

        let rtp_info = format!(
            "url={}/track1;seq={};rtptime={}",
            session.uri().trim_end_matches('/').trim_end_matches("/track1"),
            seq,
            rtptime
        );
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=now-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.own_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };
        if session.pause().is_err() {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }
        self.state = ConnectionState::SetUp;
        tracing::info!(session_id = session.id(), "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> Reply {
        let Some(session) = self.own_session(request) else {
            tracing::warn!(peer = %self.peer.addr, session = ?request.session_id(), "TEARDOWN for unknown session");
            return Reply::keep(RtspResponse::session_not_found().add_header("CSeq", cseq));
        };

        self.registry.close(session.id(), TeardownReason::ClientRequest);
        self.session = None;
        self.state = ConnectionState::TornDown;
        tracing::info!(session_id = session.id(), "session terminated via TEARDOWN");
        Reply::close(RtspResponse::ok().add_header("CSeq", cseq))
    }

    /// GET_PARAMETER / SET_PARAMETER: used by clients as keepalives
    /// (RFC 2326 §10.8). No parameters are exposed.
    fn handle_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, method = %request.method, "parameter keepalive");

        let mut response = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(id) = request.session_id() {
            if self.registry.touch(id) {
                response = response.add_header("Session", id);
            } else {
                return RtspResponse::session_not_found().add_header("CSeq", cseq);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn state_table() {
        let allowed = |state: ConnectionState| -> Vec<&'static str> {
            [
                Method::Describe,
                Method::Setup,
                Method::Play,
                Method::Pause,
                Method::Teardown,
            ]
            .into_iter()
            .filter(|m| state.permits(m))
            .map(|m| match m {
                Method::Describe => "DESCRIBE",
                Method::Setup => "SETUP",
                Method::Play => "PLAY",
                Method::Pause => "PAUSE",
                _ => "TEARDOWN",
            })
            .collect()
        };

        assert_eq!(allowed(Connected), ["DESCRIBE"]);
        assert_eq!(allowed(Described), ["DESCRIBE", "SETUP"]);
        assert_eq!(allowed(SetUp), ["PLAY", "TEARDOWN"]);
        assert_eq!(allowed(Playing), ["PAUSE", "TEARDOWN"]);
        assert!(allowed(TornDown).is_empty());
    }

    #[test]
    fn keepalives_valid_until_teardown() {
        for state in [Connected, Described, SetUp, Playing] {
            assert!(state.permits(&Method::Options));
            assert!(state.permits(&Method::GetParameter));
            assert!(state.permits(&Method::SetParameter));
        }
        assert!(!TornDown.permits(&Method::Options));
    }

    #[test]
    fn unknown_methods_bypass_state_check() {
        assert!(Connected.permits(&Method::Other("RECORD".into())));
    }
}
