//! Integration tests: real RTSP clients over loopback TCP/UDP against a
//! server backed by the synthetic engine.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camcast::pipeline::synthetic::frame_index;
use camcast::{
    MountPoint, MountTable, PipelineDescriptor, Server, ServerConfig, Stage, SyntheticEngine,
};

const TIMEOUT: Duration = Duration::from_secs(3);

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn session_id(&self) -> String {
        self.header("Session")
            .and_then(|v| v.split(';').next())
            .expect("Session header")
            .to_string()
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    cseq: u32,
    url: String,
}

impl Client {
    fn connect(addr: SocketAddr, path: &str) -> Self {
        let stream = TcpStream::connect_timeout(&addr, TIMEOUT).expect("connect to server");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.set_write_timeout(Some(TIMEOUT)).unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
            url: format!("rtsp://{addr}{path}"),
        }
    }

    fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut raw = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        self.send_raw(raw.as_bytes());
        let response = self.read_response();
        assert_eq!(
            response.header("CSeq"),
            Some(self.cseq.to_string().as_str()),
            "{method}: CSeq must be echoed"
        );
        response
    }

    fn send_raw(&mut self, raw: &[u8]) {
        self.writer.write_all(raw).unwrap();
        self.writer.flush().unwrap();
    }

    /// Next response, skipping interleaved packets in front of it.
    fn read_response(&mut self) -> Response {
        while self.reader.fill_buf().unwrap().first() == Some(&b'$') {
            self.read_interleaved().unwrap();
        }

        let mut head = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).unwrap() == 0 {
                panic!("connection closed while reading response");
            }
            if line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }

        let mut lines = head.lines();
        let status = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .expect("status line");
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        let mut response = Response {
            status,
            headers,
            body: String::new(),
        };
        if let Some(len) = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).unwrap();
            response.body = String::from_utf8(body).unwrap();
        }
        response
    }

    fn read_interleaved(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        assert_eq!(header[0], b'$', "interleaved frame marker");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut packet = vec![0u8; len];
        self.reader.read_exact(&mut packet)?;
        Ok((header[1], packet))
    }

    /// Whether the server closed the connection, draining any media first.
    fn closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }

    fn describe(&mut self) -> Response {
        let url = self.url.clone();
        self.request("DESCRIBE", &url, &[("Accept", "application/sdp")])
    }

    /// DESCRIBE, SETUP over UDP, PLAY. Returns the RTP socket and session.
    fn play_udp(&mut self) -> (UdpSocket, String) {
        assert_eq!(self.describe().status, 200);

        let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        rtp.set_read_timeout(Some(TIMEOUT)).unwrap();
        let port = rtp.local_addr().unwrap().port();
        let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
        let setup_url = format!("{}/track1", self.url);
        let setup = self.request("SETUP", &setup_url, &[("Transport", &transport)]);
        assert_eq!(setup.status, 200, "SETUP failed");
        let session = setup.session_id();

        let url = self.url.clone();
        let play = self.request("PLAY", &url, &[("Session", &session)]);
        assert_eq!(play.status, 200, "PLAY failed");
        (rtp, session)
    }
}

/// Frame indices of the next `count` frames arriving on `socket`.
fn recv_frames(socket: &UdpSocket, count: usize) -> Vec<u64> {
    let mut buf = [0u8; 2048];
    let mut frames = Vec::new();
    while frames.len() < count {
        let n = socket.recv(&mut buf).expect("RTP packet");
        if let Some(index) = frame_index(&buf[..n]) {
            frames.push(index);
        }
    }
    frames
}

fn descriptor() -> PipelineDescriptor {
    PipelineDescriptor::new(vec![
        Stage::new("videotestsrc"),
        Stage::new("x264enc"),
        Stage::new("rtph264pay").param("pt", 96),
    ])
    .unwrap()
}

fn fast_engine() -> SyntheticEngine {
    SyntheticEngine::new().with_frame_interval(Duration::from_millis(5))
}

fn start_server(engine: &SyntheticEngine, setup_timeout: Duration) -> Server {
    let mounts = MountTable::builder()
        .mount(MountPoint::new("/stream", descriptor(), true).unwrap())
        .mount(MountPoint::new("/private", descriptor(), false).unwrap())
        .build();
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        setup_timeout,
        ..ServerConfig::default()
    };
    let mut server = Server::new(config, mounts, Arc::new(engine.clone()));
    server.start().expect("server start");
    server
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn full_handshake_over_udp() {
    let engine = fast_engine();
    let mut server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();
    let mut client = Client::connect(addr, "/stream");

    let url = client.url.clone();
    let options = client.request("OPTIONS", &url, &[]);
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("DESCRIBE"));
    assert!(options.header("Server").unwrap().starts_with("camcast/"));

    let describe = client.describe();
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    assert_eq!(describe.header("Content-Base"), Some(format!("{url}/").as_str()));
    assert!(describe.body.starts_with("v=0\r\n"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96\r\n"));
    assert!(describe.body.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(describe.body.contains("a=control:track1\r\n"));

    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
    let setup = client.request("SETUP", &format!("{url}/track1"), &[("Transport", &transport)]);
    assert_eq!(setup.status, 200);
    let echoed = setup.header("Transport").unwrap();
    assert!(echoed.starts_with(&format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1)));
    assert!(echoed.contains(";server_port="));
    assert!(setup.header("Session").unwrap().ends_with(";timeout=60"));
    let session = setup.session_id();

    let play = client.request("PLAY", &url, &[("Session", &session)]);
    assert_eq!(play.status, 200);
    assert!(play.header("RTP-Info").unwrap().contains("seq="));
    assert_eq!(play.header("Range"), Some("npt=now-"));

    let frames = recv_frames(&rtp, 10);
    assert_eq!(frames[0], 1, "first subscriber of a fresh instance sees frame 1");
    assert!(
        frames.windows(2).all(|w| w[1] == w[0] + 1),
        "frames arrive in order: {frames:?}"
    );

    let keepalive = client.request("GET_PARAMETER", &url, &[("Session", &session)]);
    assert_eq!(keepalive.status, 200);

    let teardown = client.request("TEARDOWN", &url, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
    assert!(client.closed_by_server());

    wait_until("pipeline release", || engine.active() == 0);
    assert!(server.registry().is_empty());
    server.stop();
}

#[test]
fn setup_before_describe_closes_only_that_connection() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();

    let mut good = Client::connect(addr, "/stream");
    let (rtp, _) = good.play_udp();
    recv_frames(&rtp, 3);

    let mut bad = Client::connect(addr, "/stream");
    let url = bad.url.clone();
    let response = bad.request(
        "SETUP",
        &url,
        &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")],
    );
    assert_eq!(response.status, 455);
    assert!(bad.closed_by_server());

    let frames = recv_frames(&rtp, 5);
    assert!(frames.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(server.registry().len(), 1);
}

#[test]
fn play_before_setup_is_rejected() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    client.describe();
    let url = client.url.clone();
    let response = client.request("PLAY", &url, &[("Session", "0000000000000000")]);
    assert_eq!(response.status, 455);
    assert!(response.header("Allow").unwrap().contains("SETUP"));
    assert!(client.closed_by_server());
    assert_eq!(engine.launches(), 0);
}

#[test]
fn shared_mount_late_joiner_sees_live_frames() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();

    let mut first = Client::connect(addr, "/stream");
    let (rtp_a, _) = first.play_udp();
    let seen = recv_frames(&rtp_a, 20);
    let k = *seen.last().unwrap();

    let mut late = Client::connect(addr, "/stream");
    let (rtp_b, _) = late.play_udp();
    let joined = recv_frames(&rtp_b, 5);
    assert!(joined[0] > k, "late joiner starts at the live frame, got {joined:?} after {k}");

    assert_eq!(engine.launches(), 1, "one instance serves both clients");
    assert_eq!(server.registry().supervisor().active_count(), 1);
    assert_eq!(server.registry().sessions_on("/stream"), 2);
}

#[test]
fn private_mount_starts_each_client_at_frame_one() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();

    let mut first = Client::connect(addr, "/private");
    let (rtp_a, _) = first.play_udp();
    recv_frames(&rtp_a, 20);

    let mut second = Client::connect(addr, "/private");
    let (rtp_b, _) = second.play_udp();
    assert_eq!(recv_frames(&rtp_b, 1), [1]);

    assert_eq!(engine.launches(), 2);
    assert_eq!(engine.active(), 2);
}

#[test]
fn interleaved_tcp_delivery() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    let url = client.url.clone();

    assert_eq!(client.describe().status, 200);
    let setup = client.request(
        "SETUP",
        &format!("{url}/track1"),
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    );
    assert_eq!(setup.status, 200);
    assert_eq!(
        setup.header("Transport"),
        Some("RTP/AVP/TCP;unicast;interleaved=0-1")
    );
    let session = setup.session_id();
    assert_eq!(client.request("PLAY", &url, &[("Session", &session)]).status, 200);

    let mut frames = Vec::new();
    while frames.len() < 5 {
        let (channel, packet) = client.read_interleaved().unwrap();
        assert_eq!(channel, 0);
        if let Some(index) = frame_index(&packet) {
            frames.push(index);
        }
    }
    assert!(frames.windows(2).all(|w| w[1] == w[0] + 1), "{frames:?}");

    // A receiver report from the client is skipped, not parsed as a request.
    client.send_raw(&[b'$', 1, 0, 4, 0x81, 0xC9, 0, 0]);
    let keepalive = client.request("GET_PARAMETER", &url, &[("Session", &session)]);
    assert_eq!(keepalive.status, 200);

    let teardown = client.request("TEARDOWN", &url, &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
    wait_until("pipeline release", || engine.active() == 0);
}

#[test]
fn unknown_mount_is_not_found_and_connection_survives() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();
    let mut client = Client::connect(addr, "/nope");

    assert_eq!(client.describe().status, 404);
    let url = client.url.clone();
    assert_eq!(client.request("OPTIONS", &url, &[]).status, 200);
    assert_eq!(engine.launches(), 0);
}

#[test]
fn multicast_is_unsupported_transport() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    client.describe();
    let url = client.url.clone();
    let response = client.request("SETUP", &url, &[("Transport", "RTP/AVP;multicast")]);
    assert_eq!(response.status, 461);
    assert_eq!(engine.launches(), 0);
}

#[test]
fn missing_cseq_is_bad_request_and_closes() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    client.send_raw(b"OPTIONS rtsp://127.0.0.1/stream RTSP/1.0\r\n\r\n");
    let response = client.read_response();
    assert_eq!(response.status, 400);
    assert!(client.closed_by_server());
}

#[test]
fn unterminated_oversized_head_is_bad_request_and_closes() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");

    // 64 KiB + 1 with no line terminator.
    let mut flood = b"OPTIONS rtsp://127.0.0.1/".to_vec();
    flood.resize(64 * 1024 + 1, b'a');
    client.send_raw(&flood);

    let response = client.read_response();
    assert_eq!(response.status, 400);
    assert!(client.closed_by_server());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn pipeline_failure_disconnects_every_client() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<Client> = (0..3).map(|_| Client::connect(addr, "/stream")).collect();
    let sockets: Vec<UdpSocket> = clients.iter_mut().map(|c| c.play_udp().0).collect();
    for rtp in &sockets {
        recv_frames(rtp, 2);
    }
    assert_eq!(server.registry().len(), 3);

    let failed_at = Instant::now();
    engine.fail_running();
    for client in &mut clients {
        assert!(client.closed_by_server(), "client notified of teardown");
    }
    assert!(failed_at.elapsed() < TIMEOUT);

    wait_until("sessions removed", || server.registry().is_empty());
    assert_eq!(engine.active(), 0);
}

#[test]
fn unavailable_device_answers_service_unavailable() {
    let engine = fast_engine();
    let server = start_server(&engine, TIMEOUT);
    engine.set_available(false);

    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    client.describe();
    let url = client.url.clone();
    let response = client.request(
        "SETUP",
        &url,
        &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")],
    );
    assert_eq!(response.status, 503);
    assert!(server.registry().is_empty());
    assert_eq!(engine.active(), 0);
}

#[test]
fn slow_pipeline_is_setup_timeout() {
    let engine = fast_engine().with_startup_delay(Duration::from_secs(30));
    let server = start_server(&engine, Duration::from_millis(100));

    let mut client = Client::connect(server.local_addr().unwrap(), "/stream");
    client.describe();
    let url = client.url.clone();
    let response = client.request(
        "SETUP",
        &url,
        &[("Transport", "RTP/AVP;unicast;client_port=5000-5001")],
    );
    assert_eq!(response.status, 503);
    assert!(server.registry().is_empty());
    wait_until("pipeline release", || engine.active() == 0);
}

#[test]
fn stop_tears_down_sessions_and_connections() {
    let engine = fast_engine();
    let mut server = start_server(&engine, TIMEOUT);
    let addr = server.local_addr().unwrap();

    let mut playing = Client::connect(addr, "/stream");
    let (rtp, _) = playing.play_udp();
    recv_frames(&rtp, 2);
    let mut idle = Client::connect(addr, "/stream");
    let url = idle.url.clone();
    assert_eq!(idle.request("OPTIONS", &url, &[]).status, 200);
    assert_eq!(server.connection_count(), 2);

    server.stop();
    assert_eq!(server.connection_count(), 0);
    assert!(playing.closed_by_server());
    assert!(idle.closed_by_server());
    assert!(server.registry().is_empty());
    assert_eq!(engine.active(), 0);
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
}
