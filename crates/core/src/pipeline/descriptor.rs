//! Declarative, statically validated pipeline descriptions.
//!
//! A descriptor is the typed replacement for a launch string such as
//!
//! ```text
//! v4l2src device=/dev/video0 ! image/jpeg,width=1920,height=1080,framerate=30/1 !
//! jpegparse ! vaapijpegdec ! vaapipostproc ! videoconvert ! queue !
//! vaapih264enc ! h264parse ! rtph264pay name=pay0 config-interval=1 pt=96
//! ```
//!
//! Every stage name and parameter is checked against a known catalogue when
//! the descriptor is built, so a malformed configuration is rejected before
//! any device is touched.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DescriptorError;
use crate::media::Packetizer;
use crate::media::h264::{H264_CLOCK_RATE, H264Packetizer};

/// Payload formats the RTSP endpoint knows how to frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// RFC 6184 H.264 payload.
    H264 {
        payload_type: u8,
        config_interval: i32,
    },
}

impl PayloadFormat {
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::H264 { payload_type, .. } => *payload_type,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::H264 { .. } => H264_CLOCK_RATE,
        }
    }

    /// Fresh packetizer with random SSRC, sequence and timestamp origin.
    pub fn packetizer(&self) -> Box<dyn Packetizer> {
        match *self {
            Self::H264 {
                payload_type,
                config_interval,
            } => Box::new(
                H264Packetizer::randomized(payload_type).with_config_interval(config_interval),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageRole {
    Source,
    Filter,
    Payloader,
}

struct StageSpec {
    name: &'static str,
    role: StageRole,
    params: &'static [&'static str],
}

const CATALOGUE: &[StageSpec] = &[
    StageSpec {
        name: "v4l2src",
        role: StageRole::Source,
        params: &["device", "io-mode", "do-timestamp"],
    },
    StageSpec {
        name: "videotestsrc",
        role: StageRole::Source,
        params: &["pattern", "is-live"],
    },
    StageSpec {
        name: "capsfilter",
        role: StageRole::Filter,
        params: &["media", "format", "width", "height", "framerate"],
    },
    StageSpec {
        name: "jpegparse",
        role: StageRole::Filter,
        params: &[],
    },
    StageSpec {
        name: "jpegdec",
        role: StageRole::Filter,
        params: &[],
    },
    StageSpec {
        name: "vaapijpegdec",
        role: StageRole::Filter,
        params: &[],
    },
    StageSpec {
        name: "vaapipostproc",
        role: StageRole::Filter,
        params: &["width", "height"],
    },
    StageSpec {
        name: "videoconvert",
        role: StageRole::Filter,
        params: &[],
    },
    StageSpec {
        name: "videoscale",
        role: StageRole::Filter,
        params: &[],
    },
    StageSpec {
        name: "queue",
        role: StageRole::Filter,
        params: &["max-size-buffers", "leaky"],
    },
    StageSpec {
        name: "vaapih264enc",
        role: StageRole::Filter,
        params: &["bitrate", "keyframe-period"],
    },
    StageSpec {
        name: "x264enc",
        role: StageRole::Filter,
        params: &["bitrate", "tune", "speed-preset", "key-int-max"],
    },
    StageSpec {
        name: "h264parse",
        role: StageRole::Filter,
        params: &["config-interval"],
    },
    StageSpec {
        name: "rtph264pay",
        role: StageRole::Payloader,
        params: &["name", "pt", "config-interval"],
    },
];

fn lookup(name: &str) -> Option<&'static StageSpec> {
    CATALOGUE.iter().find(|spec| spec.name == name)
}

/// One named processing stage with its parameters, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    name: String,
    params: Vec<(String, String)>,
}

impl Stage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    /// Set a parameter, replacing any earlier value for the same key.
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        let value = value.to_string();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Launch-line tokens for this stage.
    ///
    /// A capsfilter renders as a bare caps string, the way it is written
    /// between two `!` in a launch line.
    pub fn launch_tokens(&self) -> Vec<String> {
        if self.name == "capsfilter" {
            let mut caps = self.get("media").unwrap_or("video/x-raw").to_string();
            for (k, v) in self.params.iter().filter(|(k, _)| k != "media") {
                caps.push_str(&format!(",{}={}", k, v));
            }
            return vec![caps];
        }

        let mut tokens = vec![self.name.clone()];
        tokens.extend(self.params.iter().map(|(k, v)| format!("{}={}", k, v)));
        tokens
    }

    fn validate(&self, spec: &StageSpec) -> Result<(), DescriptorError> {
        for (key, value) in &self.params {
            if !spec.params.contains(&key.as_str()) {
                return Err(DescriptorError::UnknownParameter {
                    stage: self.name.clone(),
                    parameter: key.clone(),
                });
            }
            if !value_is_valid(key, value) {
                return Err(self.invalid(key, value));
            }
        }

        if self.name == "capsfilter" && self.get("media").is_none() {
            return Err(self.invalid("media", ""));
        }
        Ok(())
    }

    fn invalid(&self, parameter: &str, value: &str) -> DescriptorError {
        DescriptorError::InvalidParameter {
            stage: self.name.clone(),
            parameter: parameter.to_string(),
            value: value.to_string(),
        }
    }
}

fn value_is_valid(key: &str, value: &str) -> bool {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '!' || c == '"') {
        return false;
    }
    match key {
        "pt" => value.parse::<u8>().is_ok_and(|pt| (96..=127).contains(&pt)),
        "config-interval" => value.parse::<i32>().is_ok_and(|i| i >= -1),
        "width" | "height" => value.parse::<u32>().is_ok_and(|n| n > 0),
        "framerate" => value.parse::<Framerate>().is_ok(),
        "max-size-buffers" | "bitrate" | "keyframe-period" | "key-int-max" => {
            value.parse::<u32>().is_ok()
        }
        _ => true,
    }
}

/// Fastest accepted frame rate, in frames per second.
pub const MAX_FPS: u64 = 240;
/// Longest accepted frame period, in seconds.
pub const MAX_FRAME_PERIOD_SECS: u64 = 3600;

/// Nominal output frame rate as a rational `num/den`.
///
/// Parsing bounds the rate to `1/3600 ..= 240` fps, which keeps the frame
/// period above zero and the RTP timestamp step within `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000u64 * self.den as u64 / self.num as u64)
    }

    /// RTP timestamp ticks per frame for the given media clock.
    pub fn timestamp_increment(&self, clock_rate: u32) -> u32 {
        u32::try_from(clock_rate as u64 * self.den as u64 / self.num as u64).unwrap_or(u32::MAX)
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Framerate {
    type Err = String;

    /// Accepts `"30/1"` or `"30"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = match s.split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s.trim(), "1"),
        };
        let num: u32 = num.parse().map_err(|_| format!("invalid framerate `{s}`"))?;
        let den: u32 = den.parse().map_err(|_| format!("invalid framerate `{s}`"))?;
        if num == 0 || den == 0 {
            return Err(format!("framerate `{s}` must be positive"));
        }
        let (n, d) = (num as u64, den as u64);
        if n > MAX_FPS * d || d > MAX_FRAME_PERIOD_SECS * n {
            return Err(format!(
                "framerate `{s}` outside 1/{MAX_FRAME_PERIOD_SECS}..={MAX_FPS} fps"
            ));
        }
        Ok(Self { num, den })
    }
}

/// An immutable, validated media-processing chain.
///
/// The last stage is the output stage and is always an RTP payloader whose
/// [`PayloadFormat`] the RTSP endpoint can frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    stages: Vec<Stage>,
    payload: PayloadFormat,
    framerate: Framerate,
}

impl PipelineDescriptor {
    pub fn new(stages: Vec<Stage>) -> Result<Self, DescriptorError> {
        let (first, last) = match (stages.first(), stages.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(DescriptorError::EmptyPipeline),
        };

        let mut roles = Vec::with_capacity(stages.len());
        for stage in &stages {
            let spec = lookup(&stage.name).ok_or_else(|| DescriptorError::UnknownStage {
                stage: stage.name.clone(),
            })?;
            stage.validate(spec)?;
            roles.push(spec.role);
        }

        if roles[0] != StageRole::Source {
            return Err(DescriptorError::MissingSource {
                stage: first.name.clone(),
            });
        }
        if let Some(pos) = roles[..roles.len() - 1]
            .iter()
            .position(|r| *r == StageRole::Payloader)
        {
            return Err(DescriptorError::MisplacedPayloader {
                stage: stages[pos].name.clone(),
            });
        }

        let payload = match last.name.as_str() {
            "rtph264pay" => PayloadFormat::H264 {
                payload_type: last.get("pt").and_then(|v| v.parse().ok()).unwrap_or(96),
                config_interval: last
                    .get("config-interval")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            },
            _ => {
                return Err(DescriptorError::UnframeableOutput {
                    stage: last.name.clone(),
                });
            }
        };

        let framerate = stages
            .iter()
            .filter(|s| s.name == "capsfilter")
            .find_map(|s| s.get("framerate"))
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            stages,
            payload,
            framerate,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The source stage (always first).
    pub fn source(&self) -> &Stage {
        &self.stages[0]
    }

    /// The payloader stage (always last).
    pub fn output(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    /// Stages the external engine runs; the payloader is realised in-process.
    pub fn processing_stages(&self) -> &[Stage] {
        &self.stages[..self.stages.len() - 1]
    }

    pub fn payload(&self) -> PayloadFormat {
        self.payload
    }

    pub fn framerate(&self) -> Framerate {
        self.framerate
    }

    /// Capture device named by the source stage, if any.
    pub fn device(&self) -> Option<&str> {
        self.source().get("device")
    }
}

impl fmt::Display for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .stages
            .iter()
            .map(|s| s.launch_tokens().join(" "))
            .collect();
        write!(f, "{}", rendered.join(" ! "))
    }
}
