//! Stream configuration and the descriptors built from it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::mount::{DEFAULT_MOUNT_PATH, MountPoint, MountTable};
use crate::pipeline::process::DEFAULT_LAUNCHER;
use crate::pipeline::{Framerate, PipelineDescriptor, Stage};
use crate::server::ServerConfig;

pub const DEFAULT_DEVICE: &str = "/dev/video0";
pub const DEFAULT_PORT: u16 = 8554;

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// MJPEG from a V4L2 capture device.
    #[default]
    V4l2,
    /// Generated test pattern, no device needed.
    TestPattern,
    /// In-process synthetic stream, no external launcher needed.
    Synthetic,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "v4l2" => Ok(Self::V4l2),
            "test-pattern" => Ok(Self::TestPattern),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(format!("unknown source `{other}`")),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4l2 => "v4l2",
            Self::TestPattern => "test-pattern",
            Self::Synthetic => "synthetic",
        })
    }
}

/// Which H.264 encoder the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderKind {
    /// VA-API hardware decode/scale/encode.
    #[default]
    Vaapi,
    /// Software decode and x264.
    X264,
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vaapi" => Ok(Self::Vaapi),
            "x264" => Ok(Self::X264),
            other => Err(format!("unknown encoder `{other}`")),
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vaapi => "vaapi",
            Self::X264 => "x264",
        })
    }
}

/// Everything needed to publish one camera on one mountpoint.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    pub bind_address: String,
    pub port: u16,
    pub mountpoint: String,
    /// One pipeline for all clients instead of one per client.
    pub shared: bool,
    pub source: SourceKind,
    pub encoder: EncoderKind,
    pub launcher: String,
    pub public_host: Option<String>,
    pub setup_timeout: Duration,
    pub session_timeout: Duration,
    /// Extra probe attempts before startup gives up.
    pub startup_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: 1920,
            height: 1080,
            framerate: Framerate::new(30, 1),
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            mountpoint: DEFAULT_MOUNT_PATH.to_string(),
            shared: true,
            source: SourceKind::default(),
            encoder: EncoderKind::default(),
            launcher: DEFAULT_LAUNCHER.to_string(),
            public_host: None,
            setup_timeout: Duration::from_millis(5000),
            session_timeout: Duration::from_secs(60),
            startup_retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl StreamConfig {
    /// Build the capture/encode/payload chain for this configuration.
    ///
    /// The default (V4L2 + VA-API) yields
    ///
    /// ```text
    /// v4l2src device=/dev/video0 ! image/jpeg,width=1920,height=1080,framerate=30/1 !
    /// jpegparse ! vaapijpegdec ! vaapipostproc ! videoconvert ! queue !
    /// vaapih264enc ! h264parse ! rtph264pay name=pay0 config-interval=1 pt=96
    /// ```
    pub fn descriptor(&self) -> Result<PipelineDescriptor> {
        let mut stages = match self.source {
            SourceKind::V4l2 => vec![
                Stage::new("v4l2src").param("device", &self.device),
                Stage::new("capsfilter")
                    .param("media", "image/jpeg")
                    .param("width", self.width)
                    .param("height", self.height)
                    .param("framerate", self.framerate),
                Stage::new("jpegparse"),
                match self.encoder {
                    EncoderKind::Vaapi => Stage::new("vaapijpegdec"),
                    EncoderKind::X264 => Stage::new("jpegdec"),
                },
            ],
            SourceKind::TestPattern | SourceKind::Synthetic => vec![
                Stage::new("videotestsrc").param("is-live", "true"),
                Stage::new("capsfilter")
                    .param("media", "video/x-raw")
                    .param("width", self.width)
                    .param("height", self.height)
                    .param("framerate", self.framerate),
            ],
        };

        match self.encoder {
            EncoderKind::Vaapi => stages.extend([
                Stage::new("vaapipostproc"),
                Stage::new("videoconvert"),
                Stage::new("queue"),
                Stage::new("vaapih264enc"),
            ]),
            EncoderKind::X264 => stages.extend([
                Stage::new("videoconvert"),
                Stage::new("queue"),
                Stage::new("x264enc")
                    .param("tune", "zerolatency")
                    .param("speed-preset", "ultrafast")
                    .param("key-int-max", (self.framerate.num / self.framerate.den.max(1)).max(1)),
            ]),
        }

        stages.extend([
            Stage::new("h264parse"),
            Stage::new("rtph264pay")
                .param("name", "pay0")
                .param("config-interval", 1)
                .param("pt", 96),
        ]);

        Ok(PipelineDescriptor::new(stages)?)
    }

    /// The single-mount table this configuration publishes.
    pub fn mount_table(&self) -> Result<MountTable> {
        let mount = MountPoint::new(&self.mountpoint, self.descriptor()?, self.shared)?;
        Ok(MountTable::builder().mount(mount).build())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format_bind_addr(&self.bind_address, self.port),
            public_host: self.public_host.clone(),
            setup_timeout: self.setup_timeout,
            session_timeout: self.session_timeout,
            ..ServerConfig::default()
        }
    }

    /// URL clients should open, for logs.
    pub fn stream_url(&self) -> String {
        let host = self.public_host.as_deref().unwrap_or(match self.bind_address.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        });
        format!("rtsp://{}{}", format_bind_addr(host, self.port), self.mountpoint)
    }
}

fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
