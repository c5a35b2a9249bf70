//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session binds one client transport to one pipeline instance. It is
//! created by SETUP through the [`SessionRegistry`] and removed exactly once,
//! with exactly one [`TeardownReason`].
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP                  -> Negotiating (subscribed, not yet delivering)
//! PLAY                   -> Playing     (delivery thread running)
//! PAUSE                  -> Paused      (frames discarded)
//! PLAY                   -> Playing
//! any teardown reason    -> TornDown    (terminal)
//! ```

pub mod registry;
pub mod transport;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, RtspError};
use crate::pipeline::PipelineInstance;
use crate::pipeline::fanout::Subscription;
use crate::transport::delivery;
pub use registry::{MediaDescription, RegistryConfig, SessionRegistry};
pub use transport::{MediaSink, Transport, TransportHeader};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Set up and subscribed; media is not delivered yet.
    Negotiating,
    Playing,
    Paused,
    TornDown,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ClientRequest,
    ClientDisconnected,
    PipelineFailed,
    SetupTimeout,
    SessionTimeout,
    ProtocolViolation,
    ServerShutdown,
}

impl TeardownReason {
    /// Teardowns the client did not ask for and must be told about.
    pub fn is_server_initiated(self) -> bool {
        matches!(
            self,
            Self::PipelineFailed | Self::SessionTimeout | Self::ServerShutdown
        )
    }
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientRequest => "client request",
            Self::ClientDisconnected => "client disconnected",
            Self::PipelineFailed => "pipeline failed",
            Self::SetupTimeout => "setup timeout",
            Self::SessionTimeout => "session timeout",
            Self::ProtocolViolation => "protocol violation",
            Self::ServerShutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Called once when the server tears a session down on its own, including
/// when delivery finds the client transport broken.
pub type CloseHook = Box<dyn Fn(TeardownReason) + Send + Sync>;

/// What the RTSP endpoint knows about a client at SETUP time.
pub struct ClientLink {
    pub addr: SocketAddr,
    pub transport: Transport,
    pub sink: MediaSink,
    pub on_close: Option<CloseHook>,
}

/// A single RTSP session.
pub struct Session {
    id: String,
    uri: String,
    mount: String,
    client_addr: SocketAddr,
    transport: Transport,
    instance: Arc<PipelineInstance>,
    subscription: Subscription,
    sink: MediaSink,
    on_close: Option<CloseHook>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    teardown_reason: Mutex<Option<TeardownReason>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    /// Set when delivery found the client transport broken.
    lost: AtomicBool,
    timeout_secs: u64,
}

impl Session {
    pub(crate) fn new(
        uri: &str,
        mount: &str,
        link: ClientLink,
        instance: Arc<PipelineInstance>,
        subscription: Subscription,
        timeout_secs: u64,
    ) -> Self {
        Self {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            mount: mount.to_string(),
            client_addr: link.addr,
            transport: link.transport,
            instance,
            subscription,
            sink: link.sink,
            on_close: link.on_close,
            state: Mutex::new(SessionState::Negotiating),
            last_activity: Mutex::new(Instant::now()),
            teardown_reason: Mutex::new(None),
            delivery: Mutex::new(None),
            lost: AtomicBool::new(false),
            timeout_secs,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn instance(&self) -> &Arc<PipelineInstance> {
        &self.instance
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        *self.teardown_reason.lock()
    }

    /// Whether delivery gave up on a broken client transport. Such a
    /// session is already torn down but still registered.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Frames this session lost to a full queue.
    pub fn frames_dropped(&self) -> u64 {
        self.subscription.dropped()
    }

    /// `Session` response header value, e.g. `0123456789ABCDEF;timeout=60`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Start (or resume) delivery.
    pub fn play(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::TornDown => return Err(RtspError::SessionNotFound(self.id.clone())),
            SessionState::Playing => return Ok(()),
            SessionState::Negotiating | SessionState::Paused => {}
        }

        let mut slot = self.delivery.lock();
        if slot.is_none() {
            let session = self.clone();
            let handle = thread::Builder::new()
                .name(format!("deliver-{}", &self.id[..8]))
                .spawn(move || delivery::run(&session))?;
            *slot = Some(handle);
        }
        drop(slot);

        tracing::debug!(session_id = %self.id, from = ?*state, "session playing");
        *state = SessionState::Playing;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::TornDown => Err(RtspError::SessionNotFound(self.id.clone())),
            _ => {
                *state = SessionState::Paused;
                tracing::debug!(session_id = %self.id, "session paused");
                Ok(())
            }
        }
    }

    pub(crate) fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub(crate) fn sink(&self) -> &MediaSink {
        &self.sink
    }

    /// Lock the session state. Delivery holds this across each write.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Move to `TornDown`. Returns `false` if already torn down.
    ///
    /// Waits for any in-flight write, so nothing is sent after this
    /// returns. The delivery thread is joined even when it tore the
    /// session down itself.
    pub(crate) fn terminate(&self, reason: TeardownReason) -> bool {
        let newly = {
            let mut state = self.state.lock();
            if *state == SessionState::TornDown {
                false
            } else {
                *state = SessionState::TornDown;
                *self.teardown_reason.lock() = Some(reason);
                true
            }
        };

        self.subscription.close();
        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery
            && delivery.thread().id() != thread::current().id()
            && delivery.join().is_err()
        {
            tracing::error!(session_id = %self.id, "delivery thread panicked");
        }
        if !newly {
            return false;
        }

        if reason.is_server_initiated()
            && let Some(hook) = &self.on_close
        {
            hook(reason);
        }

        tracing::info!(
            session_id = %self.id,
            mount = %self.mount,
            client = %self.client_addr,
            %reason,
            dropped = self.frames_dropped(),
            "session torn down"
        );
        true
    }

    /// Called by the delivery thread when a write to the client failed for
    /// good. Takes the state guard held across that write.
    ///
    /// The session becomes `TornDown` with `ClientDisconnected` and the close
    /// hook drops the control connection, whose thread then removes the
    /// session from the registry. Without a hook the reaper removes it.
    pub(crate) fn transport_lost(&self, mut state: MutexGuard<'_, SessionState>, error: &io::Error) {
        if *state == SessionState::TornDown {
            return;
        }
        *state = SessionState::TornDown;
        *self.teardown_reason.lock() = Some(TeardownReason::ClientDisconnected);
        self.lost.store(true, Ordering::SeqCst);
        drop(state);

        self.subscription.close();
        tracing::warn!(
            session_id = %self.id,
            client = %self.client_addr,
            error = %error,
            dropped = self.frames_dropped(),
            "client transport broken, session torn down"
        );
        if let Some(hook) = &self.on_close {
            hook(TeardownReason::ClientDisconnected);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mount", &self.mount)
            .field("client_addr", &self.client_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
