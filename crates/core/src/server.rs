use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtspError};
use crate::mount::MountTable;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, PipelineEngine, PipelineSupervisor};
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, RegistryConfig, SessionRegistry};
use crate::transport::UdpTransport;
use crate::transport::tcp::{self, ConnectionContext, ConnectionSet};

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address, e.g. `0.0.0.0:8554`.
    pub bind_addr: String,
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// How long SETUP waits for a pipeline's first frame.
    pub setup_timeout: Duration,
    /// Idle timeout for UDP sessions, also advertised in the `Session` header.
    pub session_timeout: Duration,
    /// Frames buffered per session before the oldest are dropped.
    pub frame_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "camcast".to_string(),
            setup_timeout: Duration::from_millis(5000),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            frame_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Wakes the reaper early on shutdown.
#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct Running {
    ctx: Arc<ConnectionContext>,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
    reaper: JoinHandle<()>,
    reaper_stop: Arc<StopFlag>,
}

/// RTSP server: mount table, session registry, TCP control and UDP media.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    running: Arc<AtomicBool>,
    state: Option<Running>,
}

impl Server {
    pub fn new(config: ServerConfig, mounts: MountTable, engine: Arc<dyn PipelineEngine>) -> Self {
        let supervisor = PipelineSupervisor::with_queue_capacity(engine, config.frame_queue_capacity);
        let registry = SessionRegistry::new(
            mounts,
            supervisor,
            RegistryConfig {
                setup_timeout: config.setup_timeout,
                session_timeout: config.session_timeout,
            },
        );
        Self {
            config: Arc::new(config),
            registry,
            running: Arc::new(AtomicBool::new(false)),
            state: None,
        }
    }

    /// Bind the RTSP listener and the RTP socket and start serving.
    pub fn start(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let udp = UdpTransport::bind(local_addr.ip())?;

        self.running.store(true, Ordering::SeqCst);

        let ctx = Arc::new(ConnectionContext {
            registry: self.registry.clone(),
            config: self.config.clone(),
            udp: udp.socket().clone(),
            udp_port: udp.port(),
            running: self.running.clone(),
            connections: ConnectionSet::default(),
        });

        let accept = {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name("rtsp-accept".to_string())
                .spawn(move || tcp::accept_loop(listener, ctx))?
        };

        let reaper_stop = Arc::new(StopFlag::default());
        let reaper = {
            let registry = self.registry.clone();
            let stop = reaper_stop.clone();
            let interval = (self.config.session_timeout / 4).clamp(
                Duration::from_millis(10),
                Duration::from_secs(5),
            );
            thread::Builder::new()
                .name("session-reaper".to_string())
                .spawn(move || reap_loop(&registry, &stop, interval))?
        };

        tracing::info!(addr = %local_addr, rtp_port = udp.port(), mounts = self.registry.mounts().len(), "RTSP server listening");

        self.state = Some(Running {
            ctx,
            local_addr,
            accept,
            reaper,
            reaper_stop,
        });
        Ok(())
    }

    /// Ordered shutdown: stop accepting, close sessions, stop pipelines,
    /// drop connections, join every thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        tracing::info!("server stopping");

        self.running.store(false, Ordering::SeqCst);
        if state.accept.join().is_err() {
            tracing::error!("accept loop panicked");
        }

        self.registry.shutdown();
        state.ctx.connections.close_all();

        *state.reaper_stop.stopped.lock() = true;
        state.reaper_stop.wake.notify_all();
        if state.reaper.join().is_err() {
            tracing::error!("session reaper panicked");
        }

        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Address the RTSP listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.state
            .as_ref()
            .map(|s| s.local_addr)
            .ok_or(RtspError::NotStarted)
    }

    /// Open control connections.
    pub fn connection_count(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |s| s.ctx.connections.len())
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap_loop(registry: &SessionRegistry, stop: &StopFlag, interval: Duration) {
    loop {
        {
            let mut stopped = stop.stopped.lock();
            if !*stopped {
                stop.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        let reaped = registry.reap_expired();
        if reaped > 0 {
            tracing::info!(reaped, "expired sessions closed");
        }
    }
    tracing::debug!("session reaper exited");
}
