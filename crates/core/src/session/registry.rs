use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::mount::{MountPoint, MountTable};
use crate::pipeline::{PipelineInstance, PipelineState, PipelineSupervisor};
use crate::session::{ClientLink, DEFAULT_SESSION_TIMEOUT_SECS, Session, TeardownReason};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long `open` waits for a pipeline to produce its first frame.
    pub setup_timeout: Duration,
    /// Idle time after which a UDP session is reaped.
    pub session_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_millis(5000),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
        }
    }
}

/// What DESCRIBE needs to build an SDP body.
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub mount: Arc<MountPoint>,
    pub payload_type: u8,
    pub attributes: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    /// Live instance per shared mount path.
    shared: HashMap<String, Arc<PipelineInstance>>,
}

struct RegistryInner {
    mounts: MountTable,
    supervisor: PipelineSupervisor,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    /// Serializes instance launch per shared mount. Taken before `state`.
    start_locks: HashMap<String, Mutex<()>>,
    accepting: AtomicBool,
}

/// Every live session and the instance backing it.
///
/// All changes to the session set go through one mutex. Launching an
/// instance, waiting for preroll, instance stop and session teardown
/// happen outside it.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(mounts: MountTable, supervisor: PipelineSupervisor, config: RegistryConfig) -> Self {
        let start_locks = mounts
            .iter()
            .filter(|m| m.is_shared())
            .map(|m| (m.path().to_string(), Mutex::new(())))
            .collect();
        let inner = Arc::new(RegistryInner {
            mounts,
            supervisor,
            config,
            state: Mutex::new(RegistryState::default()),
            start_locks,
            accepting: AtomicBool::new(true),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        inner
            .supervisor
            .set_failure_listener(Arc::new(move |instance: &Arc<PipelineInstance>| {
                if let Some(inner) = weak.upgrade() {
                    SessionRegistry { inner }.instance_failed(instance);
                }
            }));

        Self { inner }
    }

    pub fn mounts(&self) -> &MountTable {
        &self.inner.mounts
    }

    pub fn supervisor(&self) -> &PipelineSupervisor {
        &self.inner.supervisor
    }

    /// Create a session on the mount `uri` addresses.
    ///
    /// Blocks until the backing instance produces its first frame, at most
    /// for the setup timeout.
    pub fn open(&self, uri: &str, link: ClientLink) -> Result<Arc<Session>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(RtspError::ShuttingDown);
        }
        let mount = self.inner.mounts.resolve(uri)?;
        let timeout_secs = self.inner.config.session_timeout.as_secs();

        // Concurrent opens of one shared mount launch a single instance.
        let start_guard = self
            .inner
            .start_locks
            .get(mount.path())
            .map(|lock| lock.lock());

        let live = if mount.is_shared() {
            self.inner
                .state
                .lock()
                .shared
                .get(mount.path())
                .filter(|i| !matches!(i.state(), PipelineState::Failed | PipelineState::Stopped))
                .cloned()
        } else {
            None
        };
        let (instance, fresh) = match live {
            Some(instance) => (instance, false),
            None => (
                self.inner
                    .supervisor
                    .start(mount.path(), mount.descriptor().clone())?,
                true,
            ),
        };

        // Subscribe before the producer runs so a fresh instance's first
        // subscriber sees frame 1.
        let subscription = instance.subscribe();
        let session = Arc::new(Session::new(
            uri,
            mount.path(),
            link,
            instance.clone(),
            subscription,
            timeout_secs,
        ));

        {
            let mut state = self.inner.state.lock();
            if !self.inner.accepting.load(Ordering::SeqCst) {
                drop(state);
                if fresh {
                    self.inner.supervisor.stop(&instance);
                }
                return Err(RtspError::ShuttingDown);
            }
            if fresh && mount.is_shared() {
                state.shared.insert(mount.path().to_string(), instance.clone());
            }
            state.sessions.insert(session.id().to_string(), session.clone());
        }
        drop(start_guard);

        tracing::info!(
            session_id = session.id(),
            mount = mount.path(),
            client = %session.client_addr(),
            instance = session.instance().id(),
            reused = !fresh,
            "session opened"
        );

        if fresh && let Err(e) = self.inner.supervisor.run(&instance) {
            self.close(session.id(), TeardownReason::PipelineFailed);
            return Err(e);
        }

        match instance.wait_running(self.inner.config.setup_timeout) {
            PipelineState::Running => Ok(session),
            PipelineState::Created => {
                tracing::warn!(session_id = session.id(), mount = mount.path(), "pipeline did not start in time");
                self.close(session.id(), TeardownReason::SetupTimeout);
                Err(RtspError::SetupTimeout {
                    mount: mount.path().to_string(),
                    waited_ms: self.inner.config.setup_timeout.as_millis() as u64,
                })
            }
            PipelineState::Failed | PipelineState::Stopped => {
                self.close(session.id(), TeardownReason::PipelineFailed);
                Err(RtspError::start(
                    instance
                        .failure()
                        .unwrap_or_else(|| "pipeline stopped during setup".to_string()),
                ))
            }
        }
    }

    /// Remove a session. Idempotent: returns `false` if it was already gone.
    pub fn close(&self, id: &str, reason: TeardownReason) -> bool {
        let (session, orphaned) = {
            let mut state = self.inner.state.lock();
            let Some(session) = state.sessions.remove(id) else {
                return false;
            };
            let instance = session.instance().clone();
            let last = !state
                .sessions
                .values()
                .any(|s| s.instance().id() == instance.id());
            if last
                && state
                    .shared
                    .get(session.mount())
                    .is_some_and(|i| i.id() == instance.id())
            {
                state.shared.remove(session.mount());
            }
            (session, last.then_some(instance))
        };

        session.terminate(reason);
        if let Some(instance) = orphaned {
            self.inner.supervisor.stop(&instance);
        }
        true
    }

    /// SDP attributes for the mount `uri` addresses.
    ///
    /// Taken from the live shared instance when there is one, so parameter
    /// sets already seen on the wire are advertised.
    pub fn describe(&self, uri: &str) -> Result<MediaDescription> {
        let mount = self.inner.mounts.resolve(uri)?;
        let live = if mount.is_shared() {
            self.inner.state.lock().shared.get(mount.path()).cloned()
        } else {
            None
        };

        let (payload_type, attributes) = match live {
            Some(instance) => (instance.payload_type(), instance.sdp_attributes()),
            None => {
                let packetizer = mount.descriptor().payload().packetizer();
                (packetizer.payload_type(), packetizer.sdp_attributes())
            }
        };

        Ok(MediaDescription {
            mount,
            payload_type,
            attributes,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.state.lock().sessions.get(id).cloned()
    }

    /// Record client activity. Returns `false` for unknown sessions.
    pub fn touch(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sessions on a mount path.
    pub fn sessions_on(&self, mount: &str) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| s.mount() == mount)
            .count()
    }

    /// Close UDP sessions idle for longer than the session timeout, and
    /// sessions whose client transport broke during delivery.
    ///
    /// Interleaved sessions otherwise live as long as their control
    /// connection.
    pub fn reap_expired(&self) -> usize {
        let timeout = self.inner.config.session_timeout;
        let expired: Vec<(String, TeardownReason)> = self
            .inner
            .state
            .lock()
            .sessions
            .values()
            .filter_map(|s| {
                if s.is_lost() {
                    Some((s.id().to_string(), TeardownReason::ClientDisconnected))
                } else if s.transport().is_udp() && s.idle_for() > timeout {
                    Some((s.id().to_string(), TeardownReason::SessionTimeout))
                } else {
                    None
                }
            })
            .collect();

        expired
            .iter()
            .filter(|(id, reason)| self.close(id, *reason))
            .count()
    }

    /// Refuse new sessions, close every session and stop every instance.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.inner.state.lock().sessions.keys().cloned().collect();
        let closed = ids
            .iter()
            .filter(|id| self.close(id, TeardownReason::ServerShutdown))
            .count();
        self.inner.state.lock().shared.clear();
        self.inner.supervisor.stop_all();
        tracing::info!(closed, "session registry shut down");
    }

    fn instance_failed(&self, instance: &Arc<PipelineInstance>) {
        let dependents: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.shared.retain(|_, i| i.id() != instance.id());
            state
                .sessions
                .values()
                .filter(|s| s.instance().id() == instance.id())
                .map(|s| s.id().to_string())
                .collect()
        };

        tracing::warn!(
            instance = instance.id(),
            mount = instance.mount(),
            sessions = dependents.len(),
            "tearing down sessions of failed pipeline"
        );
        for id in dependents {
            self.close(&id, TeardownReason::PipelineFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fanout::{MediaFrame, Recv};
    use crate::pipeline::{PipelineDescriptor, Stage, SyntheticEngine};
    use crate::session::{CloseHook, MediaSink, SessionState, Transport};
    use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn descriptor() -> PipelineDescriptor {
        PipelineDescriptor::new(vec![
            Stage::new("videotestsrc"),
            Stage::new("x264enc"),
            Stage::new("rtph264pay").param("pt", 96),
        ])
        .unwrap()
    }

    fn registry_with(engine: &SyntheticEngine, config: RegistryConfig) -> SessionRegistry {
        let mounts = MountTable::builder()
            .mount(MountPoint::new("/shared", descriptor(), true).unwrap())
            .mount(MountPoint::new("/private", descriptor(), false).unwrap())
            .build();
        SessionRegistry::new(
            mounts,
            PipelineSupervisor::new(Arc::new(engine.clone())),
            config,
        )
    }

    fn registry(engine: &SyntheticEngine) -> SessionRegistry {
        registry_with(engine, RegistryConfig::default())
    }

    fn link(on_close: Option<mpsc::Sender<TeardownReason>>) -> ClientLink {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        ClientLink {
            addr,
            transport: Transport::Udp {
                client_addr: addr,
                client_rtcp_port: 10,
                server_rtp_port: 5000,
                server_rtcp_port: 5001,
            },
            sink: MediaSink::Udp { socket, addr },
            on_close: on_close.map(hook),
        }
    }

    fn hook(tx: mpsc::Sender<TeardownReason>) -> CloseHook {
        let tx = Mutex::new(tx);
        Box::new(move |reason: TeardownReason| {
            let _ = tx.lock().send(reason);
        })
    }

    fn next_frame(session: &Session) -> Arc<MediaFrame> {
        match session.subscription().recv_timeout(Duration::from_secs(2)) {
            Recv::Frame(frame) => frame,
            other => panic!("session {} got no frame: {other:?}", session.id()),
        }
    }

    fn engine() -> SyntheticEngine {
        SyntheticEngine::new().with_frame_interval(Duration::from_millis(5))
    }

    #[test]
    fn shared_mount_reuses_one_instance() {
        let engine = engine();
        let registry = registry(&engine);

        let sessions: Vec<_> = (0..3)
            .map(|_| registry.open("rtsp://h/shared", link(None)).unwrap())
            .collect();
        assert_eq!(engine.launches(), 1);
        assert_eq!(registry.supervisor().active_count(), 1);
        assert_eq!(registry.sessions_on("/shared"), 3);
        let first = sessions[0].instance().id();
        assert!(sessions.iter().all(|s| s.instance().id() == first));

        for s in &sessions[..2] {
            assert!(registry.close(s.id(), TeardownReason::ClientRequest));
        }
        assert_eq!(engine.active(), 1, "instance kept while a session remains");
        registry.close(sessions[2].id(), TeardownReason::ClientRequest);
        assert_eq!(engine.active(), 0);
        assert_eq!(registry.supervisor().active_count(), 0);
    }

    #[test]
    fn private_mount_starts_instance_per_session() {
        let engine = engine();
        let registry = registry(&engine);

        let sessions: Vec<_> = (0..3)
            .map(|_| registry.open("rtsp://h/private", link(None)).unwrap())
            .collect();
        assert_eq!(engine.launches(), 3);
        assert_eq!(engine.active(), 3);

        for s in &sessions {
            registry.close(s.id(), TeardownReason::ClientRequest);
        }
        assert_eq!(engine.active(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let engine = engine();
        let registry = registry(&engine);
        let session = registry.open("rtsp://h/shared", link(None)).unwrap();

        assert!(registry.close(session.id(), TeardownReason::ClientRequest));
        assert!(!registry.close(session.id(), TeardownReason::ClientDisconnected));
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(session.teardown_reason(), Some(TeardownReason::ClientRequest));
        assert!(registry.get(session.id()).is_none());
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn pipeline_failure_tears_down_dependents_and_notifies() {
        let engine = engine();
        let registry = registry(&engine);
        let (tx, rx) = mpsc::channel();

        let sessions: Vec<_> = (0..3)
            .map(|_| {
                let s = registry
                    .open("rtsp://h/shared", link(Some(tx.clone())))
                    .unwrap();
                s.play().unwrap();
                s
            })
            .collect();

        let started = Instant::now();
        engine.fail_running();
        for _ in 0..3 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                TeardownReason::PipelineFailed
            );
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        for s in &sessions {
            assert_eq!(s.state(), SessionState::TornDown);
            assert_eq!(s.teardown_reason(), Some(TeardownReason::PipelineFailed));
        }
        assert!(registry.is_empty());
        assert_eq!(engine.active(), 0);

        // The next open starts a fresh instance.
        let again = registry.open("rtsp://h/shared", link(None)).unwrap();
        assert_eq!(engine.launches(), 2);
        registry.close(again.id(), TeardownReason::ClientRequest);
    }

    #[test]
    fn client_teardown_does_not_fire_close_hook() {
        let engine = engine();
        let registry = registry(&engine);
        let (tx, rx) = mpsc::channel();
        let session = registry.open("rtsp://h/shared", link(Some(tx))).unwrap();
        registry.close(session.id(), TeardownReason::ClientRequest);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn slow_preroll_is_setup_timeout() {
        let engine = engine().with_startup_delay(Duration::from_secs(30));
        let registry = registry_with(
            &engine,
            RegistryConfig {
                setup_timeout: Duration::from_millis(50),
                ..RegistryConfig::default()
            },
        );

        let err = registry.open("rtsp://h/shared", link(None)).unwrap_err();
        assert!(matches!(err, RtspError::SetupTimeout { ref mount, .. } if mount == "/shared"));
        assert!(registry.is_empty());
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn unknown_mount_and_unavailable_device() {
        let engine = engine();
        let registry = registry(&engine);
        assert!(matches!(
            registry.open("rtsp://h/nope", link(None)),
            Err(RtspError::MountNotFound(_))
        ));

        engine.set_available(false);
        assert!(matches!(
            registry.open("rtsp://h/shared", link(None)),
            Err(RtspError::Start { .. })
        ));
        assert!(registry.is_empty());
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn describe_prefers_live_parameter_sets() {
        let engine = engine();
        let registry = registry(&engine);

        let cold = registry.describe("rtsp://h/shared").unwrap();
        assert_eq!(cold.payload_type, 96);
        assert!(!cold.attributes[1].contains("sprop-parameter-sets"));

        let session = registry.open("rtsp://h/shared", link(None)).unwrap();
        let warm = registry.describe("rtsp://h/shared/track1").unwrap();
        assert!(warm.attributes[1].contains("sprop-parameter-sets"));
        assert_eq!(warm.mount.path(), "/shared");
        registry.close(session.id(), TeardownReason::ClientRequest);
    }

    #[test]
    fn reaper_closes_idle_udp_sessions() {
        let engine = engine();
        let registry = registry_with(
            &engine,
            RegistryConfig {
                session_timeout: Duration::from_millis(20),
                ..RegistryConfig::default()
            },
        );
        let idle = registry.open("rtsp://h/shared", link(None)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.reap_expired(), 1);
        assert_eq!(idle.teardown_reason(), Some(TeardownReason::SessionTimeout));
        assert_eq!(registry.reap_expired(), 0);
    }

    #[test]
    fn shutdown_refuses_new_sessions() {
        let engine = engine();
        let registry = registry(&engine);
        let session = registry.open("rtsp://h/private", link(None)).unwrap();
        registry.shutdown();

        assert_eq!(session.teardown_reason(), Some(TeardownReason::ServerShutdown));
        assert!(matches!(
            registry.open("rtsp://h/shared", link(None)),
            Err(RtspError::ShuttingDown)
        ));
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn concurrent_shared_opens_see_one_frame_sequence() {
        let engine = engine();
        let registry = registry(&engine);

        let sessions: Vec<Arc<Session>> = thread::scope(|scope| {
            let opens: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| registry.open("rtsp://h/shared", link(None)).unwrap()))
                .collect();
            opens.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(engine.launches(), 1);
        assert_eq!(registry.sessions_on("/shared"), 4);
        let first = sessions[0].instance().id();
        assert!(sessions.iter().all(|s| s.instance().id() == first));

        // Round-robin so no queue fills up while another is drained.
        let mut received: Vec<Vec<Arc<MediaFrame>>> = vec![Vec::new(); sessions.len()];
        for _ in 0..20 {
            for (s, frames) in sessions.iter().zip(&mut received) {
                frames.push(next_frame(s));
            }
        }

        for frames in &received {
            assert!(frames.windows(2).all(|w| w[1].index == w[0].index + 1));
        }
        let common = received.iter().map(|f| f[0].index).max().unwrap();
        let reference: Vec<_> = received[0].iter().filter(|f| f.index >= common).collect();
        assert!(!reference.is_empty());
        for frames in &received[1..] {
            let from_common: Vec<_> = frames.iter().filter(|f| f.index >= common).collect();
            for (a, b) in reference.iter().zip(&from_common) {
                assert!(Arc::ptr_eq(*a, *b), "frame {} differs between sessions", a.index);
            }
        }
        assert!(sessions.iter().all(|s| s.frames_dropped() == 0));

        for s in &sessions {
            registry.close(s.id(), TeardownReason::ClientRequest);
        }
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn concurrent_private_opens_start_one_instance_each() {
        let engine = engine();
        let registry = registry(&engine);

        let sessions: Vec<Arc<Session>> = thread::scope(|scope| {
            let opens: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| registry.open("rtsp://h/private", link(None)).unwrap()))
                .collect();
            opens.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(engine.launches(), 4);
        assert_eq!(engine.active(), 4);
        let mut ids: Vec<u64> = sessions.iter().map(|s| s.instance().id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        registry.shutdown();
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn slow_launch_does_not_hold_the_registry() {
        let engine = engine().with_launch_delay(Duration::from_millis(500));
        let registry = registry(&engine);

        thread::scope(|scope| {
            let slow = scope.spawn(|| registry.open("rtsp://h/private", link(None)).unwrap());
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            assert!(registry.is_empty());
            assert!(registry.get("0000000000000000").is_none());
            assert!(registry.describe("rtsp://h/shared").is_ok());
            assert!(started.elapsed() < Duration::from_millis(200));

            let session = slow.join().unwrap();
            assert_eq!(registry.len(), 1);
            registry.close(session.id(), TeardownReason::ClientRequest);
        });
        assert_eq!(engine.active(), 0);
    }

    #[test]
    fn broken_interleaved_sink_tears_session_down() {
        let engine = engine();
        let registry = registry(&engine);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        let (tx, rx) = mpsc::channel();

        let link = ClientLink {
            addr: client.local_addr().unwrap(),
            transport: Transport::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1,
            },
            sink: MediaSink::Interleaved {
                writer: Arc::new(Mutex::new(server_side.try_clone().unwrap())),
                channel: 0,
            },
            on_close: Some(hook(tx)),
        };
        let session = registry.open("rtsp://h/shared", link).unwrap();
        session.play().unwrap();

        // The client stays connected; only the media path breaks.
        server_side.shutdown(Shutdown::Write).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            TeardownReason::ClientDisconnected
        );
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(session.teardown_reason(), Some(TeardownReason::ClientDisconnected));
        assert!(session.is_lost());
        assert!(session.play().is_err());

        assert_eq!(registry.reap_expired(), 1);
        assert!(registry.is_empty());
        assert_eq!(engine.active(), 0);
        assert_eq!(session.teardown_reason(), Some(TeardownReason::ClientDisconnected));
        assert!(rx.try_recv().is_err(), "close hook fires once");
        drop(client);
    }
}
