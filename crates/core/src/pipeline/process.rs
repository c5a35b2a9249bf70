use std::env;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::media::h264::AccessUnitReader;
use crate::pipeline::descriptor::PipelineDescriptor;
use crate::pipeline::engine::{AccessUnitSource, LaunchedPipeline, PipelineEngine, PipelineHandle};

pub const DEFAULT_LAUNCHER: &str = "gst-launch-1.0";

/// Runs the processing stages of a descriptor in an external launcher
/// process and reads its H.264 elementary stream from stdout.
///
/// The argv is built token by token from the typed stages, never through a
/// shell. The payloader stage is not passed on: RTP payloading happens
/// in-process, so the launcher is asked for an Annex B byte stream instead:
///
/// ```text
/// gst-launch-1.0 -q <stages...> ! video/x-h264,stream-format=byte-stream ! fdsink fd=1
/// ```
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    launcher: PathBuf,
}

impl ProcessEngine {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
        }
    }

    /// Full argv (after the program name) for a descriptor.
    pub fn launch_args(descriptor: &PipelineDescriptor) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        for (i, stage) in descriptor.processing_stages().iter().enumerate() {
            if i > 0 {
                args.push("!".to_string());
            }
            args.extend(stage.launch_tokens());
        }
        args.extend(
            [
                "!",
                "video/x-h264,stream-format=byte-stream",
                "!",
                "fdsink",
                "fd=1",
            ]
            .map(String::from),
        );
        args
    }

    fn launcher_available(&self) -> bool {
        if self.launcher.components().count() > 1 {
            return self.launcher.is_file();
        }
        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| dir.join(&self.launcher).is_file()))
            .unwrap_or(false)
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LAUNCHER)
    }
}

impl PipelineEngine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    fn probe(&self, descriptor: &PipelineDescriptor) -> Result<()> {
        if let Some(device) = descriptor.device()
            && !Path::new(device).exists()
        {
            return Err(RtspError::start(format!(
                "capture device {device} is not available"
            )));
        }
        if !self.launcher_available() {
            return Err(RtspError::start(format!(
                "pipeline launcher {} not found",
                self.launcher.display()
            )));
        }
        Ok(())
    }

    fn launch(&self, descriptor: &PipelineDescriptor) -> Result<LaunchedPipeline> {
        self.probe(descriptor)?;

        let args = Self::launch_args(descriptor);
        tracing::debug!(launcher = %self.launcher.display(), args = %args.join(" "), "spawning pipeline");

        let mut child = Command::new(&self.launcher)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RtspError::start(format!("failed to spawn {}: {e}", self.launcher.display()))
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // From here on the child is owned by the handle, so it is killed on
        // every exit path including the error below.
        let handle = ProcessHandle {
            child: Mutex::new(Some(child)),
            released: AtomicBool::new(false),
        };

        let stdout = stdout.ok_or_else(|| RtspError::start("pipeline stdout not captured"))?;

        if let Some(stderr) = stderr {
            thread::Builder::new()
                .name(format!("pipeline-stderr-{pid}"))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(io::Result::ok) {
                        tracing::warn!(pid, "{}", line);
                    }
                })?;
        }

        tracing::info!(pid, pipeline = %descriptor, "pipeline process started");

        Ok(LaunchedPipeline {
            source: Box::new(ProcessSource {
                reader: AccessUnitReader::new(stdout),
            }),
            handle: Box::new(handle),
        })
    }
}

struct ProcessSource {
    reader: AccessUnitReader<ChildStdout>,
}

impl AccessUnitSource for ProcessSource {
    fn next_access_unit(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.reader.next_access_unit()
    }
}

struct ProcessHandle {
    child: Mutex<Option<Child>>,
    released: AtomicBool,
}

impl PipelineHandle for ProcessHandle {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => tracing::debug!(pid, %status, "pipeline process already exited"),
            _ => {
                if let Err(e) = child.kill() {
                    tracing::warn!(pid, error = %e, "failed to kill pipeline process");
                }
                match child.wait() {
                    Ok(status) => tracing::debug!(pid, %status, "pipeline process reaped"),
                    Err(e) => tracing::warn!(pid, error = %e, "failed to reap pipeline process"),
                }
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.release();
    }
}
