//! Error types for the camcast library.

use std::fmt;

/// Errors that can occur while configuring or serving a stream.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Configuration**: [`InvalidDescriptor`](Self::InvalidDescriptor),
///   [`InvalidMount`](Self::InvalidMount). Fatal at startup.
/// - **Pipeline**: [`Start`](Self::Start). Fatal to the instance, surfaced
///   to the operator or to the client whose SETUP triggered the start.
/// - **Client-scoped**: [`MountNotFound`](Self::MountNotFound),
///   [`SetupTimeout`](Self::SetupTimeout),
///   [`SessionNotFound`](Self::SessionNotFound), [`Parse`](Self::Parse).
///   Reported to one client, never to the rest of the server.
/// - **Server**: [`Io`](Self::Io), [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`ShuttingDown`](Self::ShuttingDown).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pipeline descriptor failed validation.
    #[error("invalid pipeline descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),

    /// A mountpoint path was malformed.
    #[error("invalid mountpoint: {0}")]
    InvalidMount(String),

    /// A pipeline instance could not acquire a required resource.
    #[error("pipeline failed to start: {reason}")]
    Start { reason: String },

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The backing pipeline did not reach Running within the setup timeout.
    #[error("pipeline for {mount} not ready after {waited_ms} ms")]
    SetupTimeout { mount: String, waited_ms: u64 },

    /// No session with the given ID exists in the registry.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// The registry stopped accepting sessions.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl RtspError {
    pub(crate) fn start(reason: impl Into<String>) -> Self {
        Self::Start {
            reason: reason.into(),
        }
    }
}

/// Validation failures for a [`PipelineDescriptor`](crate::pipeline::PipelineDescriptor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("unknown stage `{stage}`")]
    UnknownStage { stage: String },

    #[error("stage `{stage}` has no parameter `{parameter}`")]
    UnknownParameter { stage: String, parameter: String },

    #[error("stage `{stage}`: invalid value `{value}` for `{parameter}`")]
    InvalidParameter {
        stage: String,
        parameter: String,
        value: String,
    },

    #[error("first stage `{stage}` is not a source")]
    MissingSource { stage: String },

    #[error("payloader `{stage}` must be the last stage")]
    MisplacedPayloader { stage: String },

    #[error("output stage `{stage}` does not produce an RTP payload")]
    UnframeableOutput { stage: String },
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The request carried no CSeq header (RFC 2326 §12.17).
    MissingCSeq,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MissingCSeq => write!(f, "missing CSeq"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
