use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{ConnectionState, MethodHandler, PeerLink, RtspRequest, RtspResponse};
use crate::server::ServerConfig;
use crate::session::{SessionRegistry, TeardownReason};

/// Largest request head accepted before the connection is dropped.
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Bounds how long a stalled client can hold a writer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection thread needs, shared by the accept loop.
pub(crate) struct ConnectionContext {
    pub registry: SessionRegistry,
    pub config: Arc<ServerConfig>,
    pub udp: Arc<UdpSocket>,
    pub udp_port: u16,
    pub running: Arc<AtomicBool>,
    pub connections: ConnectionSet,
}

/// Live control connections, so shutdown can unblock their readers.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Arc<TcpStream>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSet {
    fn register(&self, stream: Arc<TcpStream>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(id, stream);
        id
    }

    fn unregister(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.retain(|t| !t.is_finished());
        threads.push(handle);
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Shut every connection down and wait for its thread.
    pub fn close_all(&self) {
        for stream in self.live.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("connection thread panicked");
            }
        }
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub(crate) fn accept_loop(listener: TcpListener, ctx: Arc<ConnectionContext>) {
    while ctx.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let c = ctx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("rtsp-{peer}"))
                    .spawn(move || Connection::handle(stream, peer, &c));
                match spawned {
                    Ok(handle) => ctx.connections.track(handle),
                    Err(e) => tracing::error!(%peer, error = %e, "failed to spawn connection thread"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if ctx.running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// One unit read from the control connection.
enum Incoming {
    Request(String),
    /// `$`-framed packet from the client (RTCP receiver report), skipped.
    Interleaved { channel: u8, len: usize },
    Closed,
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: Arc<Mutex<TcpStream>>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, peer_addr: SocketAddr, ctx: &ConnectionContext) {
        tracing::info!(%peer_addr, "client connected");

        let _ = stream.set_nodelay(true);
        if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
            tracing::warn!(%peer_addr, error = %e, "failed to set write timeout");
        }
        let (reader_stream, writer_stream) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(r), Ok(w)) => (r, w),
            _ => return,
        };

        let control = Arc::new(stream);
        let conn_id = ctx.connections.register(control.clone());
        let writer = Arc::new(Mutex::new(writer_stream));

        let handler = MethodHandler::new(
            ctx.registry.clone(),
            ctx.config.clone(),
            PeerLink {
                addr: peer_addr,
                udp: ctx.udp.clone(),
                udp_port: ctx.udp_port,
                writer: writer.clone(),
                control: control.clone(),
            },
        );

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(&ctx.running);
        if let Some(session_id) = conn.handler.session_id() {
            tracing::debug!(%peer_addr, session_id, %reason, "connection ending with live session");
        }
        conn.handler.finish(reason);
        ctx.connections.unregister(conn_id);
        let _ = control.shutdown(Shutdown::Both);

        tracing::info!(%peer_addr, %reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns why the connection ended.
    fn run(&mut self, running: &AtomicBool) -> TeardownReason {
        while running.load(Ordering::SeqCst) {
            let request_text = match self.read_incoming() {
                Ok(Incoming::Request(text)) => text,
                Ok(Incoming::Interleaved { channel, len }) => {
                    tracing::trace!(peer = %self.peer_addr, channel, len, "skipped interleaved packet from client");
                    continue;
                }
                Ok(Incoming::Closed) => return TeardownReason::ClientDisconnected,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "unreadable request");
                    let _ = self.send(&RtspResponse::bad_request());
                    return TeardownReason::ProtocolViolation;
                }
                Err(_) => return TeardownReason::ClientDisconnected,
            };

            let request = match RtspRequest::parse(&request_text) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error, closing connection");
                    let mut response = RtspResponse::bad_request();
                    if let Some(cseq) = cseq_of(&request_text) {
                        response = response.add_header("CSeq", cseq);
                    }
                    let _ = self.send(&response);
                    return TeardownReason::ProtocolViolation;
                }
            };

            if self.skip_body(request.content_length()).is_err() {
                return TeardownReason::ClientDisconnected;
            }

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                cseq = request.cseq().unwrap_or(""),
                "request"
            );

            let reply = self.handler.handle(&request);

            tracing::debug!(
                peer = %self.peer_addr,
                status = reply.response.status_code,
                "response"
            );

            if self.send(&reply.response).is_err() {
                return TeardownReason::ClientDisconnected;
            }
            if reply.close {
                return if self.handler.state() == ConnectionState::TornDown {
                    TeardownReason::ClientRequest
                } else {
                    TeardownReason::ProtocolViolation
                };
            }
        }

        TeardownReason::ServerShutdown
    }

    fn send(&self, response: &RtspResponse) -> io::Result<()> {
        self.writer
            .lock()
            .write_all(response.serialize().as_bytes())
    }

    /// Read the next request head or interleaved packet.
    fn read_incoming(&mut self) -> io::Result<Incoming> {
        let mut head = String::new();
        loop {
            if head.is_empty() {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Ok(Incoming::Closed);
                }
                if buf[0] == b'$' {
                    return self.skip_interleaved();
                }
            }

            // One byte past the budget, so an unterminated line is detected
            // without buffering more than the cap.
            let budget = (MAX_HEAD_BYTES + 1).saturating_sub(head.len()) as u64;
            let mut line = String::new();
            if (&mut self.reader).take(budget).read_line(&mut line)? == 0 {
                return Ok(Incoming::Closed);
            }
            if !line.ends_with('\n') && head.len() + line.len() > MAX_HEAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            if line.trim().is_empty() {
                if head.is_empty() {
                    continue;
                }
                head.push_str(&line);
                return Ok(Incoming::Request(head));
            }
            head.push_str(&line);
            if head.len() > MAX_HEAD_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
        }
    }

    fn skip_interleaved(&mut self) -> io::Result<Incoming> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header)?;
        let channel = header[1];
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
        Ok(Incoming::Interleaved { channel, len })
    }

    fn skip_body(&mut self, len: usize) -> io::Result<()> {
        if len > 0 {
            let skipped = io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
            tracing::trace!(peer = %self.peer_addr, skipped, "request body skipped");
        }
        Ok(())
    }
}

/// Best-effort CSeq from a request that failed to parse.
fn cseq_of(raw: &str) -> Option<&str> {
    raw.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("CSeq")
            .then(|| value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cseq_recovered_from_bad_request() {
        assert_eq!(cseq_of("BROKEN\r\nCSeq: 7\r\n\r\n"), Some("7"));
        assert_eq!(cseq_of("OPTIONS * RTSP/1.0\r\n\r\n"), None);
    }
}
