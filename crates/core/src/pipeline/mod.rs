//! Pipeline descriptors and the supervisor that runs them.
//!
//! ## Instance lifecycle
//!
//! ```text
//! start()                     -> Created   (engine launched, resources held)
//! run()  + first access unit  -> Running
//! source error / end of stream -> Failed    (resources released, listener notified)
//! stop()                      -> Stopped   (resources released, producer joined)
//! ```
//!
//! Each instance owns one producer thread. It pulls access units from the
//! engine, packetizes them once with the instance's RTP state, and publishes
//! the packets on the instance's [`FrameBus`]. All sessions subscribed to
//! the bus therefore share one media timeline.

pub mod descriptor;
pub mod engine;
pub mod fanout;
pub mod process;
pub mod synthetic;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtspError};
use crate::media::Packetizer;
pub use descriptor::{Framerate, PayloadFormat, PipelineDescriptor, Stage};
pub use engine::{AccessUnitSource, LaunchedPipeline, PipelineEngine, PipelineHandle};
use fanout::{FrameBus, MediaFrame, Subscription};
pub use process::ProcessEngine;
pub use synthetic::SyntheticEngine;

/// Frames buffered per subscriber before the oldest are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Failed,
    Stopped,
}

impl PipelineState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

struct Status {
    state: PipelineState,
    failure: Option<String>,
}

/// A running realisation of a [`PipelineDescriptor`].
pub struct PipelineInstance {
    id: u64,
    mount: String,
    descriptor: Arc<PipelineDescriptor>,
    status: Mutex<Status>,
    status_changed: Condvar,
    bus: FrameBus,
    packetizer: Mutex<Box<dyn Packetizer>>,
    handle: Box<dyn PipelineHandle>,
    source: Mutex<Option<Box<dyn AccessUnitSource>>>,
    producer: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    frames: AtomicU64,
}

impl PipelineInstance {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mount path this instance serves.
    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn descriptor(&self) -> &PipelineDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> PipelineState {
        self.status.lock().state
    }

    /// Failure reason once the instance is [`PipelineState::Failed`].
    pub fn failure(&self) -> Option<String> {
        self.status.lock().failure.clone()
    }

    /// Access units produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Attach a subscriber to this instance's output.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// SDP media attributes from the live packetizer (includes
    /// `sprop-parameter-sets` once SPS/PPS have been seen).
    pub fn sdp_attributes(&self) -> Vec<String> {
        self.packetizer.lock().sdp_attributes()
    }

    pub fn payload_type(&self) -> u8 {
        self.packetizer.lock().payload_type()
    }

    /// `(sequence, rtptime)` the next frame will start at, for `RTP-Info`.
    pub fn rtp_position(&self) -> (u16, u32) {
        let packetizer = self.packetizer.lock();
        (packetizer.next_sequence(), packetizer.next_rtp_timestamp())
    }

    /// Block until the instance leaves `Created` or `timeout` elapses.
    ///
    /// Returns the state observed last.
    pub fn wait_running(&self, timeout: Duration) -> PipelineState {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while status.state == PipelineState::Created {
            if self
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        status.state
    }

    /// Move to `next` unless already terminal. Returns whether it moved.
    fn transition(&self, next: PipelineState, failure: Option<String>) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() || status.state == next {
            return false;
        }
        tracing::debug!(instance = self.id, mount = %self.mount, from = ?status.state, to = ?next, "pipeline state transition");
        status.state = next;
        status.failure = failure;
        drop(status);
        self.status_changed.notify_all();
        true
    }
}

/// Callback invoked on the producer thread when an instance fails.
pub type FailureListener = Arc<dyn Fn(&Arc<PipelineInstance>) + Send + Sync>;

struct SupervisorInner {
    engine: Arc<dyn PipelineEngine>,
    instances: Mutex<HashMap<u64, Arc<PipelineInstance>>>,
    listener: Mutex<Option<FailureListener>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// Owns every pipeline instance: start, monitor, stop.
///
/// Resource errors are reported to the caller, never retried here.
#[derive(Clone)]
pub struct PipelineSupervisor {
    inner: Arc<SupervisorInner>,
}

impl PipelineSupervisor {
    pub fn new(engine: Arc<dyn PipelineEngine>) -> Self {
        Self::with_queue_capacity(engine, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(engine: Arc<dyn PipelineEngine>, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                engine,
                instances: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                next_id: AtomicU64::new(1),
                queue_capacity,
            }),
        }
    }

    /// Register the callback told about instances that fail on their own.
    pub fn set_failure_listener(&self, listener: FailureListener) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Check a descriptor's resources without acquiring them.
    pub fn probe(&self, descriptor: &PipelineDescriptor) -> Result<()> {
        self.inner.engine.probe(descriptor)
    }

    /// Launch a descriptor. The instance stays `Created` until [`run`](Self::run).
    pub fn start(
        &self,
        mount: &str,
        descriptor: Arc<PipelineDescriptor>,
    ) -> Result<Arc<PipelineInstance>> {
        let launched = self.inner.engine.launch(&descriptor).inspect_err(|e| {
            tracing::error!(mount, engine = self.inner.engine.name(), error = %e, "pipeline start failed");
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(PipelineInstance {
            id,
            mount: mount.to_string(),
            packetizer: Mutex::new(descriptor.payload().packetizer()),
            descriptor,
            status: Mutex::new(Status {
                state: PipelineState::Created,
                failure: None,
            }),
            status_changed: Condvar::new(),
            bus: FrameBus::new(self.inner.queue_capacity),
            handle: launched.handle,
            source: Mutex::new(Some(launched.source)),
            producer: Mutex::new(None),
            stopping: AtomicBool::new(false),
            frames: AtomicU64::new(0),
        });

        self.inner.instances.lock().insert(id, instance.clone());
        tracing::info!(instance = id, mount, engine = self.inner.engine.name(), "pipeline instance started");
        Ok(instance)
    }

    /// Spawn the producer thread. Idempotent.
    pub fn run(&self, instance: &Arc<PipelineInstance>) -> Result<()> {
        let Some(source) = instance.source.lock().take() else {
            return Ok(());
        };

        let inner = self.inner.clone();
        let worker = instance.clone();
        let spawned = thread::Builder::new()
            .name(format!("pipeline-{}", instance.id))
            .spawn(move || produce(inner, worker, source));

        match spawned {
            Ok(handle) => {
                *instance.producer.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.stop(instance);
                Err(RtspError::start(format!("failed to spawn producer: {e}")))
            }
        }
    }

    /// Release everything the instance holds. Idempotent, callable from any
    /// thread including the instance's own producer.
    pub fn stop(&self, instance: &PipelineInstance) {
        instance.stopping.store(true, Ordering::SeqCst);
        instance.handle.release();
        instance.bus.close();
        instance.source.lock().take();

        let producer = instance.producer.lock().take();
        if let Some(producer) = producer
            && producer.thread().id() != thread::current().id()
            && producer.join().is_err()
        {
            tracing::error!(instance = instance.id, "pipeline producer panicked");
        }

        if instance.transition(PipelineState::Stopped, None) {
            tracing::info!(instance = instance.id, mount = %instance.mount, frames = instance.frames_produced(), "pipeline instance stopped");
        }
        self.inner.instances.lock().remove(&instance.id);
    }

    /// Current health of an instance.
    pub fn health(&self, instance: &PipelineInstance) -> PipelineState {
        instance.state()
    }

    /// Instances holding resources right now.
    pub fn active_count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    pub fn stop_all(&self) {
        let instances: Vec<_> = self.inner.instances.lock().values().cloned().collect();
        for instance in instances {
            self.stop(&instance);
        }
    }
}

fn produce(
    inner: Arc<SupervisorInner>,
    instance: Arc<PipelineInstance>,
    mut source: Box<dyn AccessUnitSource>,
) {
    let increment = instance
        .descriptor
        .framerate()
        .timestamp_increment(instance.descriptor.payload().clock_rate());

    let failure = loop {
        match source.next_access_unit() {
            Ok(Some(access_unit)) => {
                let packets = instance.packetizer.lock().packetize(&access_unit, increment);
                let index = instance.frames.fetch_add(1, Ordering::SeqCst) + 1;
                if index == 1 && instance.transition(PipelineState::Running, None) {
                    tracing::info!(instance = instance.id, mount = %instance.mount, "pipeline running");
                }
                instance
                    .bus
                    .publish(Arc::new(MediaFrame { index, packets }));
            }
            Ok(None) => break "pipeline reached end of stream".to_string(),
            Err(e) => break format!("pipeline source error: {e}"),
        }
        if instance.stopping.load(Ordering::SeqCst) {
            return;
        }
    };

    if instance.stopping.load(Ordering::SeqCst) {
        return;
    }

    tracing::error!(instance = instance.id, mount = %instance.mount, reason = %failure, "pipeline failed");
    instance.handle.release();
    instance.bus.close();
    instance.transition(PipelineState::Failed, Some(failure));
    inner.instances.lock().remove(&instance.id);

    let listener = inner.listener.lock().clone();
    if let Some(listener) = listener {
        listener(&instance);
    }
}
