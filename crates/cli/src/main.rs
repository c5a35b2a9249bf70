use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use camcast::pipeline::Framerate;
use camcast::{
    ControlLoop, EncoderKind, PipelineEngine, ProcessEngine, SourceKind, StreamConfig,
    SyntheticEngine,
};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(
    name = "camcast",
    version,
    about = "Publish a capture device as an H.264 RTSP stream"
)]
struct Args {
    /// Capture device
    #[arg(long, env = "CAMCAST_DEVICE", default_value = "/dev/video0")]
    device: String,

    /// Capture width in pixels
    #[arg(long, env = "CAMCAST_WIDTH", default_value_t = 1920)]
    width: u32,

    /// Capture height in pixels
    #[arg(long, env = "CAMCAST_HEIGHT", default_value_t = 1080)]
    height: u32,

    /// Frame rate as N/D or N
    #[arg(long, env = "CAMCAST_FRAMERATE", default_value = "30/1")]
    framerate: Framerate,

    /// RTSP port
    #[arg(long, env = "CAMCAST_PORT", default_value_t = 8554)]
    port: u16,

    /// Address to listen on
    #[arg(long, env = "CAMCAST_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    /// Mount path clients request
    #[arg(long, env = "CAMCAST_MOUNTPOINT", default_value = "/stream")]
    mountpoint: String,

    /// Serve every client from one pipeline (false: one pipeline per client)
    #[arg(long, env = "CAMCAST_SHARED", default_value_t = true, action = clap::ArgAction::Set)]
    shared: bool,

    /// Frame source: v4l2, test-pattern or synthetic
    #[arg(long, env = "CAMCAST_SOURCE", default_value = "v4l2")]
    source: SourceKind,

    /// H.264 encoder: vaapi or x264
    #[arg(long, env = "CAMCAST_ENCODER", default_value = "vaapi")]
    encoder: EncoderKind,

    /// Pipeline launcher executable
    #[arg(long, env = "CAMCAST_LAUNCHER", default_value = "gst-launch-1.0")]
    launcher: String,

    /// Host advertised in SDP instead of the one clients dial
    #[arg(long, env = "CAMCAST_PUBLIC_HOST")]
    public_host: Option<String>,

    /// How long SETUP waits for the first frame
    #[arg(long, env = "CAMCAST_SETUP_TIMEOUT_MS", default_value_t = 5000)]
    setup_timeout_ms: u64,

    /// Idle timeout for UDP sessions
    #[arg(long, env = "CAMCAST_SESSION_TIMEOUT_SECS", default_value_t = 60)]
    session_timeout_secs: u64,

    /// Extra attempts when the device is not available at startup
    #[arg(long, env = "CAMCAST_STARTUP_RETRIES", default_value_t = 0)]
    startup_retries: u32,

    /// Delay before the first startup retry, doubled on each retry
    #[arg(long, env = "CAMCAST_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            bind_address: self.bind_address.clone(),
            port: self.port,
            mountpoint: self.mountpoint.clone(),
            shared: self.shared,
            source: self.source,
            encoder: self.encoder,
            launcher: self.launcher.clone(),
            public_host: self.public_host.clone(),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            startup_retries: self.startup_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = args.stream_config();
    let engine: Arc<dyn PipelineEngine> = match config.source {
        SourceKind::Synthetic => Arc::new(SyntheticEngine::new()),
        SourceKind::V4l2 | SourceKind::TestPattern => Arc::new(ProcessEngine::new(&config.launcher)),
    };

    let (tx, rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    let control = match ControlLoop::new(config, engine) {
        Ok(control) => control,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    match control.run(rx) {
        Ok(()) => {
            tracing::info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
