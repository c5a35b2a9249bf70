//! In-process engine that fabricates an H.264-shaped stream.
//!
//! Every access unit carries its 1-based frame number as ASCII digits in
//! the slice payload, so receivers can check ordering and continuity with
//! [`frame_index`]. The engine also counts launches and live resources and
//! can inject the failures a real capture device produces (missing device,
//! slow preroll, device loss).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtspError};
use crate::media::rtp::RTP_HEADER_LEN;
use crate::pipeline::descriptor::PipelineDescriptor;
use crate::pipeline::engine::{AccessUnitSource, LaunchedPipeline, PipelineEngine, PipelineHandle};

const SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF];
const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];
const GOP: u64 = 30;
const INDEX_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
struct Settings {
    frame_interval: Option<Duration>,
    startup_delay: Duration,
    launch_delay: Duration,
    fail_after: Option<u64>,
}

struct EngineState {
    available: AtomicBool,
    settings: Settings,
    fail_epoch: AtomicU64,
    launches: AtomicUsize,
    active: AtomicUsize,
}

/// Synthetic [`PipelineEngine`]. Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct SyntheticEngine {
    state: Arc<EngineState>,
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self::build(Settings::default())
    }

    fn build(settings: Settings) -> Self {
        Self {
            state: Arc::new(EngineState {
                available: AtomicBool::new(true),
                settings,
                fail_epoch: AtomicU64::new(0),
                launches: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Pace frames at `interval` instead of the descriptor's frame rate.
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        Self::build(Settings {
            frame_interval: Some(interval),
            ..self.state.settings
        })
    }

    /// Delay the first frame, as a slow device preroll would.
    pub fn with_startup_delay(self, delay: Duration) -> Self {
        Self::build(Settings {
            startup_delay: delay,
            ..self.state.settings
        })
    }

    /// Block inside `launch`, as a slow device open would.
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        Self::build(Settings {
            launch_delay: delay,
            ..self.state.settings
        })
    }

    /// Every launched source fails after producing `frames` frames.
    pub fn with_fail_after(self, frames: u64) -> Self {
        Self::build(Settings {
            fail_after: Some(frames),
            ..self.state.settings
        })
    }

    /// Make the simulated device present or absent for future probes/launches.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Make every currently running source fail on its next frame.
    pub fn fail_running(&self) {
        self.state.fail_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Total successful launches so far.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Launched pipelines whose resources have not been released yet.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn probe(&self, descriptor: &PipelineDescriptor) -> Result<()> {
        if self.state.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RtspError::start(format!(
                "capture device {} is not available",
                descriptor.device().unwrap_or("synthetic")
            )))
        }
    }

    fn launch(&self, descriptor: &PipelineDescriptor) -> Result<LaunchedPipeline> {
        self.probe(descriptor)?;
        if !self.state.settings.launch_delay.is_zero() {
            std::thread::sleep(self.state.settings.launch_delay);
        }

        let stop = Arc::new(StopSignal::default());
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        self.state.active.fetch_add(1, Ordering::SeqCst);

        let interval = self
            .state
            .settings
            .frame_interval
            .unwrap_or_else(|| descriptor.framerate().frame_duration());

        let source = SyntheticSource {
            state: self.state.clone(),
            stop: stop.clone(),
            interval,
            epoch: self.state.fail_epoch.load(Ordering::SeqCst),
            produced: 0,
            next_due: Instant::now() + self.state.settings.startup_delay,
        };
        let handle = SyntheticHandle {
            state: self.state.clone(),
            stop,
            released: AtomicBool::new(false),
        };

        Ok(LaunchedPipeline {
            source: Box::new(source),
            handle: Box::new(handle),
        })
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep until `deadline`. Returns `true` if stopped meanwhile.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped && Instant::now() < deadline {
            self.wake.wait_until(&mut stopped, deadline);
        }
        *stopped
    }
}

struct SyntheticSource {
    state: Arc<EngineState>,
    stop: Arc<StopSignal>,
    interval: Duration,
    epoch: u64,
    produced: u64,
    next_due: Instant,
}

impl AccessUnitSource for SyntheticSource {
    fn next_access_unit(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.stop.sleep_until(self.next_due) {
            return Ok(None);
        }
        self.next_due += self.interval;

        let lost = self.state.fail_epoch.load(Ordering::SeqCst) != self.epoch
            || self.state.settings.fail_after.is_some_and(|n| self.produced >= n);
        if lost {
            return Err(io::Error::other("synthetic capture device lost"));
        }

        self.produced += 1;
        Ok(Some(access_unit(self.produced)))
    }
}

struct SyntheticHandle {
    state: Arc<EngineState>,
    stop: Arc<StopSignal>,
    released: AtomicBool,
}

impl PipelineHandle for SyntheticHandle {
    fn release(&self) {
        self.stop.stop();
        if !self.released.swap(true, Ordering::SeqCst) {
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn access_unit(index: u64) -> Vec<u8> {
    let digits = format!("{:0width$}", index, width = INDEX_DIGITS);
    let keyframe = (index - 1) % GOP == 0;

    let mut au = Vec::with_capacity(32);
    if keyframe {
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(&SPS);
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(&PPS);
        au.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);
    } else {
        au.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9A]);
    }
    au.extend_from_slice(digits.as_bytes());
    au
}

/// Frame number carried by a synthetic slice inside an RTP packet.
///
/// Returns `None` for parameter sets and for anything not produced by
/// [`SyntheticEngine`].
pub fn frame_index(rtp_packet: &[u8]) -> Option<u64> {
    let nal = rtp_packet.get(RTP_HEADER_LEN..)?;
    let nal_type = nal.first()? & 0x1f;
    if nal_type != 1 && nal_type != 5 {
        return None;
    }
    let digits = nal.get(2..2 + INDEX_DIGITS)?;
    std::str::from_utf8(digits).ok()?.parse().ok()
}
