// ABOUTME: Core data model shared by the Butler, J2K Encoder, and wire protocol
// ABOUTME: Frames are value-like for dispatch but hold Arc'd references to large pixel buffers

use std::sync::Arc;
use std::time::Duration;

/// BOTH for 2D, LEFT/RIGHT for stereoscopic 3D frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Both,
    Left,
    Right,
}

/// Pixel format of a raw video frame. The actual JPEG2000 codec is a
/// black-box (`Codec::encode`, see [`crate::encoder::codec`]); this only
/// carries enough to describe the buffer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgra,
    Yuv420P,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColourRange {
    Full,
    Video,
}

/// Row alignment policy applied when preparing a frame for encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment(pub usize);

/// Raw pixel data for one frame. Cloning a `RawImage` is cheap: the pixel
/// buffer itself is `Arc`-shared, matching the original's `shared_ptr<Image>`
/// semantics without actually sharing mutable access.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub range: ColourRange,
    pub alignment: Alignment,
    pub data: Arc<Vec<u8>>,
}

impl RawImage {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            range: ColourRange::Full,
            alignment: Alignment(1),
            data: Arc::new(data),
        }
    }
}

/// Either a raw pixel buffer awaiting encode, or bytes that arrived already
/// encoded from an upstream source that passes J2K straight through.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Raw(RawImage),
    AlreadyEncoded(Arc<Vec<u8>>),
}

/// A logical video frame carrying everything the encoder needs to dispatch
/// it").
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing within a project; unique per (index, eye).
    pub index: u64,
    pub eye: Eye,
    pub presentation_time: Duration,
    pub payload: FramePayload,
    /// Set when a crop/container-size change invalidates this frame's
    /// cached prepared image without invalidating the frame itself; cleared
    /// once it has been re-prepared.
    pub needs_reprepare: bool,
}

impl Frame {
    pub fn has_j2k(&self) -> bool {
        matches!(self.payload, FramePayload::AlreadyEncoded(_))
    }

    /// Value equality used by the "can_repeat" shortcut:
    /// same eye and same raw bytes (by content, not identity).
    pub fn same_raw_as(&self, other: &Frame) -> bool {
        match (&self.payload, &other.payload) {
            (FramePayload::Raw(a), FramePayload::Raw(b)) => {
                a.width == b.width
                    && a.height == b.height
                    && a.format == b.format
                    && a.data == b.data
            }
            _ => false,
        }
    }
}

/// A blob of J2K codestream bytes produced for one (index, eye) pair. Writing it is idempotent: the writer accepts the
/// first arrival for a given (index, eye) and drops duplicates.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub index: u64,
    pub eye: Eye,
    pub bytes: Arc<Vec<u8>>,
}

/// `(host, worker-thread-count, protocol-version, last-seen timestamp)`. `last_seen` is stored as an `Instant` rather than a
/// wall-clock timestamp since only relative staleness matters.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub host: String,
    pub threads: usize,
    pub protocol_version: i32,
    pub last_seen: std::time::Instant,
}

impl ServerDescription {
    pub fn new(host: String, threads: usize, protocol_version: i32) -> Self {
        Self {
            host,
            threads,
            protocol_version,
            last_seen: std::time::Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = std::time::Instant::now();
    }

    pub fn last_seen_secs(&self) -> u64 {
        self.last_seen.elapsed().as_secs()
    }

    /// Grounded on `encode_server_description.h`'s `current_link_version()`:
    /// a server is only dispatched to if its reported protocol version
    /// matches ours.
    pub fn protocol_matches(&self, local_version: i32) -> bool {
        self.protocol_version == local_version
    }
}

/// A sum type identifying a worker.
#[derive(Debug, Clone)]
pub enum WorkerIdentity {
    Local,
    Gpu,
    Remote {
        server: ServerDescription,
        backoff_secs: u32,
    },
}
