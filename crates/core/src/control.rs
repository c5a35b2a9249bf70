//! Process-level startup and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::{Result, RtspError};
use crate::mount::MountTable;
use crate::pipeline::{PipelineEngine, PipelineSupervisor};
use crate::server::Server;

/// Owns the server for the lifetime of the process.
///
/// Construction validates the configuration and checks that every mount's
/// resources exist, so a bad device or launcher fails before any port is
/// bound.
pub struct ControlLoop {
    config: StreamConfig,
    server: Server,
}

impl ControlLoop {
    pub fn new(config: StreamConfig, engine: Arc<dyn PipelineEngine>) -> Result<Self> {
        let mounts = config.mount_table()?;
        probe_with_retry(&config, &mounts, &engine)?;

        let server = Server::new(config.server_config(), mounts, engine);
        Ok(Self { config, server })
    }

    /// Bind and start serving without waiting for shutdown.
    pub fn start(&mut self) -> Result<SocketAddr> {
        self.server.start()?;
        let addr = self.server.local_addr()?;
        tracing::info!(url = %self.config.stream_url(), shared = self.config.shared, source = %self.config.source, encoder = %self.config.encoder, "stream ready");
        Ok(addr)
    }

    /// Serve until `shutdown` receives a message (or its sender is dropped),
    /// then shut down in order.
    pub fn run(mut self, shutdown: Receiver<()>) -> Result<()> {
        if !self.server.is_running() {
            self.start()?;
        }
        let _ = shutdown.recv();
        tracing::info!("shutdown requested");
        self.shutdown();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.server.stop();
    }

    pub fn server(&self) -> &Server {
        &self.server
    }
}

/// Probe every mount, retrying with exponential backoff.
fn probe_with_retry(
    config: &StreamConfig,
    mounts: &MountTable,
    engine: &Arc<dyn PipelineEngine>,
) -> Result<()> {
    let supervisor = PipelineSupervisor::new(engine.clone());
    let mut backoff = config.retry_backoff;
    let mut attempt: u32 = 0;

    loop {
        let outcome = mounts
            .iter()
            .try_for_each(|mount| supervisor.probe(mount.descriptor()));
        match outcome {
            Ok(()) => return Ok(()),
            Err(e @ RtspError::Start { .. }) if attempt < config.startup_retries => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt,
                    retries = config.startup_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "pipeline resources unavailable, retrying"
                );
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
            Err(e) => {
                tracing::error!(error = %e, engine = engine.name(), "pipeline resources unavailable");
                return Err(e);
            }
        }
    }
}
