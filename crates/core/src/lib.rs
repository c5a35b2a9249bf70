pub mod config;
pub mod control;
pub mod error;
pub mod media;
pub mod mount;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{EncoderKind, SourceKind, StreamConfig};
pub use control::ControlLoop;
pub use error::{DescriptorError, Result, RtspError};
pub use media::Packetizer;
pub use mount::{MountPoint, MountTable};
pub use pipeline::{
    PipelineDescriptor, PipelineEngine, PipelineState, PipelineSupervisor, ProcessEngine, Stage,
    SyntheticEngine,
};
pub use server::{Server, ServerConfig};
pub use session::{SessionRegistry, TeardownReason};
