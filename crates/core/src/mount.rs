use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::pipeline::PipelineDescriptor;

pub const DEFAULT_MOUNT_PATH: &str = "/stream";

/// A named stream endpoint (e.g. `/stream`, `/camera1`) and the pipeline
/// that feeds it.
///
/// A shared mount runs one pipeline instance for all of its sessions; a
/// non-shared mount starts a fresh instance per session.
#[derive(Debug, Clone)]
pub struct MountPoint {
    path: String,
    descriptor: Arc<PipelineDescriptor>,
    shared: bool,
}

impl MountPoint {
    pub fn new(path: &str, descriptor: PipelineDescriptor, shared: bool) -> Result<Self> {
        if !path.starts_with('/') || path.contains(char::is_whitespace) || path.contains("/track")
        {
            return Err(RtspError::InvalidMount(path.to_string()));
        }
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        Ok(Self {
            path: path.to_string(),
            descriptor: Arc::new(descriptor),
            shared,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn descriptor(&self) -> &Arc<PipelineDescriptor> {
        &self.descriptor
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

/// Immutable set of mount points, keyed by path.
///
/// Built once before the server starts; lookups never fall back to another
/// mount, so an unknown path is always a 404.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Arc<HashMap<String, Arc<MountPoint>>>,
}

impl MountTable {
    pub fn builder() -> MountTableBuilder {
        MountTableBuilder::default()
    }

    /// Look up a mount by exact path.
    pub fn get(&self, path: &str) -> Option<Arc<MountPoint>> {
        self.mounts.get(path).cloned()
    }

    /// Resolve the mount an RTSP request URI addresses.
    pub fn resolve(&self, uri: &str) -> Result<Arc<MountPoint>> {
        let path = extract_mount_path(uri);
        self.get(path)
            .ok_or_else(|| RtspError::MountNotFound(path.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MountPoint>> {
        self.mounts.values()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MountTableBuilder {
    mounts: HashMap<String, Arc<MountPoint>>,
}

impl MountTableBuilder {
    /// Register a mount point. A later mount at the same path replaces the
    /// earlier one.
    pub fn mount(mut self, mount: MountPoint) -> Self {
        tracing::info!(path = mount.path(), shared = mount.is_shared(), pipeline = %mount.descriptor(), "mount registered");
        self.mounts.insert(mount.path.clone(), Arc::new(mount));
        self
    }

    pub fn build(self) -> MountTable {
        MountTable {
            mounts: Arc::new(self.mounts),
        }
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/stream/track1` → `/stream`
/// `rtsp://host:8554/stream/`       → `/stream`
/// `rtsp://host:8554/stream?x=1`    → `/stream`
/// `rtsp://host:8554`               → `/`
/// `*`                              → `/`
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        "/"
    };

    let path = match path.find(['?', '#']) {
        Some(pos) => &path[..pos],
        None => path,
    };

    // /stream/track1 → /stream
    let path = match path.rfind("/track") {
        Some(pos) => &path[..pos],
        None => path,
    };

    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn descriptor() -> PipelineDescriptor {
        PipelineDescriptor::new(vec![
            Stage::new("videotestsrc"),
            Stage::new("x264enc"),
            Stage::new("rtph264pay"),
        ])
        .unwrap()
    }

    fn table() -> MountTable {
        MountTable::builder()
            .mount(MountPoint::new("/stream", descriptor(), true).unwrap())
            .mount(MountPoint::new("/camera1", descriptor(), false).unwrap())
            .build()
    }

    #[test]
    fn extract_path_variants() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream"), "/stream");
        assert_eq!(
            extract_mount_path("rtsp://localhost:8554/stream/track1"),
            "/stream"
        );
        assert_eq!(extract_mount_path("rtsp://localhost:8554/stream/"), "/stream");
        assert_eq!(
            extract_mount_path("rtsp://10.0.0.1:8554/camera1/track1"),
            "/camera1"
        );
        assert_eq!(extract_mount_path("rtsp://h/stream?token=1"), "/stream");
        assert_eq!(extract_mount_path("/camera1"), "/camera1");
    }

    #[test]
    fn extract_path_without_path_is_root() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554"), "/");
        assert_eq!(extract_mount_path("*"), "/");
    }

    #[test]
    fn resolve_exact_only() {
        let mounts = table();
        let stream = mounts.resolve("rtsp://localhost:8554/stream/track1").unwrap();
        assert_eq!(stream.path(), "/stream");
        assert!(stream.is_shared());
        assert!(!mounts.resolve("rtsp://h/camera1").unwrap().is_shared());

        assert!(matches!(
            mounts.resolve("rtsp://localhost:8554/other"),
            Err(RtspError::MountNotFound(ref p)) if p == "/other"
        ));
        assert!(mounts.resolve("rtsp://localhost:8554").is_err());
        assert_eq!(mounts.len(), 2);
    }

    #[test]
    fn remounting_a_path_replaces_it() {
        let mounts = MountTable::builder()
            .mount(MountPoint::new("/stream", descriptor(), true).unwrap())
            .mount(MountPoint::new("/stream/", descriptor(), false).unwrap())
            .build();
        assert_eq!(mounts.len(), 1);
        assert!(!mounts.get("/stream").unwrap().is_shared());
    }

    #[test]
    fn mount_path_validation() {
        assert!(MountPoint::new("stream", descriptor(), true).is_err());
        assert!(MountPoint::new("/my stream", descriptor(), true).is_err());
        assert!(MountPoint::new("/cam/track1", descriptor(), true).is_err());
        assert_eq!(
            MountPoint::new("/live/", descriptor(), true).unwrap().path(),
            "/live"
        );
        assert_eq!(MountPoint::new("/", descriptor(), true).unwrap().path(), "/");
    }
}
