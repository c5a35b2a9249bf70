//! The seam between orchestration and the media engine.
//!
//! Capture, decode, scale and encode are done by an external engine. This
//! crate only needs three things from it: a way to check that a descriptor's
//! resources exist, a blocking source of encoded access units, and a handle
//! that releases everything the running pipeline holds.

use std::io;

use crate::error::Result;
use crate::pipeline::descriptor::PipelineDescriptor;

/// Realises [`PipelineDescriptor`]s into running pipelines.
pub trait PipelineEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Check that the resources a descriptor needs are present without
    /// acquiring them. Returns [`RtspError::Start`](crate::RtspError::Start)
    /// when they are not.
    fn probe(&self, descriptor: &PipelineDescriptor) -> Result<()>;

    /// Acquire resources and start producing media.
    ///
    /// Implementations must not leak on error: anything acquired before the
    /// failure is released before returning.
    fn launch(&self, descriptor: &PipelineDescriptor) -> Result<LaunchedPipeline>;
}

/// A running pipeline as handed back by [`PipelineEngine::launch`].
pub struct LaunchedPipeline {
    pub source: Box<dyn AccessUnitSource>,
    pub handle: Box<dyn PipelineHandle>,
}

/// Blocking producer of encoded access units (Annex B, one frame each).
pub trait AccessUnitSource: Send {
    /// Block until the next access unit. `Ok(None)` means end of stream.
    fn next_access_unit(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Owner of the resources behind a running pipeline.
///
/// `release` must be idempotent, callable from any thread, and must unblock
/// a concurrent [`AccessUnitSource::next_access_unit`]. Implementations also
/// release on `Drop`, which covers panics and early returns.
pub trait PipelineHandle: Send + Sync {
    fn release(&self);
}
