// ABOUTME: Individual encoder worker threads: local CPU, GPU offload, and remote server
// ABOUTME: Each worker is a plain OS thread; network I/O is bridged into it via a tokio runtime handle

use crate::codec::Codec;
use crate::config::SERVER_LINK_VERSION;
use crate::error::{EncodeError, EngineError, ExceptionStore, NetworkError};
use crate::frame::{write_encoding_request, EncodingRequestXml};
use crate::socket::Socket;
use crate::types::{EncodedArtifact, Frame, FramePayload, RawImage, ServerDescription};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifies what a worker thread actually does with a [`Frame`] it pops
/// off the queue.
#[derive(Debug, Clone)]
pub enum WorkerKind {
    Local,
    Gpu,
    Remote(ServerDescription),
}

impl WorkerKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Local => "local",
            WorkerKind::Gpu => "gpu",
            WorkerKind::Remote(_) => "remote",
        }
    }
}

/// A job a worker thread has popped off the shared queue but not yet
/// finished. Dropping it without calling [`JobGuard::defuse`] pushes the
/// frame back to the front of the queue, the Rust shape of the original's
/// "retry unless explicitly cancelled" scope guard in
/// `j2k_sync_encoder_thread.cc`.
pub struct JobGuard<'a> {
    queue: &'a super::SharedQueue,
    frame: Option<Frame>,
}

impl<'a> JobGuard<'a> {
    pub fn new(queue: &'a super::SharedQueue, frame: Frame) -> Self {
        Self {
            queue,
            frame: Some(frame),
        }
    }

    /// Call once the frame has either been written successfully or given up
    /// on for good (GPU exhaustion); suppresses the retry-on-drop behaviour.
    pub fn defuse(mut self) {
        self.frame = None;
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.queue.push_front(frame);
        }
    }
}

fn raw_image_of(frame: &Frame) -> Option<&RawImage> {
    match &frame.payload {
        FramePayload::Raw(image) => Some(image),
        FramePayload::AlreadyEncoded(_) => None,
    }
}

/// Runs a local CPU worker loop until `queue` reports shutdown. Each
/// iteration blocks on the queue, encodes via `codec`, and writes the result
/// through `writer`; a codec failure retries the same frame via [`JobGuard`].
pub fn run_local_worker(
    queue: Arc<super::SharedQueue>,
    codec: Arc<dyn Codec>,
    writer: Arc<dyn super::Writer>,
    exceptions: Arc<ExceptionStore>,
) {
    while let Some(frame) = queue.pop_blocking() {
        let guard = JobGuard::new(&queue, frame.clone());
        match raw_image_of(&frame) {
            Some(image) => match codec.encode(image) {
                Ok(bytes) => {
                    writer.write(EncodedArtifact {
                        index: frame.index,
                        eye: frame.eye,
                        bytes: Arc::new(bytes),
                    });
                    guard.defuse();
                }
                Err(e) => {
                    warn!(index = frame.index, error = %e, "local encode failed, will retry");
                    drop(guard);
                }
            },
            None => {
                // Already-encoded frames shouldn't reach a worker; the
                // scheduler's fake-write shortcut should have handled them.
                exceptions.store(EngineError::Programming(
                    crate::error::ProgrammingError::new(
                        file!(),
                        line!(),
                        "local worker received an already-encoded frame",
                    ),
                ));
                guard.defuse();
            }
        }
    }
}

/// GPU offload worker. Stands in for the real shared-memory messenger
/// handoff (`gpu::Messenger`); three consecutive failures are treated as the
/// decoder being broken and surfaced as [`EncodeError::GpuGaveUp`] rather
/// than retried forever.
pub fn run_gpu_worker(
    queue: Arc<super::SharedQueue>,
    messenger: Arc<dyn crate::gpu::GpuMessenger>,
    writer: Arc<dyn super::Writer>,
    exceptions: Arc<ExceptionStore>,
    give_up_after: u32,
) {
    let mut consecutive_failures = 0u32;
    while let Some(frame) = queue.pop_blocking() {
        let guard = JobGuard::new(&queue, frame.clone());
        let Some(image) = raw_image_of(&frame) else {
            guard.defuse();
            continue;
        };
        match messenger.encode(image) {
            Ok(bytes) => {
                consecutive_failures = 0;
                writer.write(EncodedArtifact {
                    index: frame.index,
                    eye: frame.eye,
                    bytes: Arc::new(bytes),
                });
                guard.defuse();
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(index = frame.index, error = %e, consecutive_failures, "gpu encode failed");
                if consecutive_failures >= give_up_after {
                    exceptions.store(EngineError::Encode(EncodeError::GpuGaveUp));
                    guard.defuse();
                    break;
                }
                drop(guard);
            }
        }
    }
}

/// Remote worker: bridges a blocking thread into async socket I/O via a
/// borrowed tokio runtime handle, since the socket layer is tokio-native but
/// the scheduler core deliberately runs on plain OS threads.
pub fn run_remote_worker(
    queue: Arc<super::SharedQueue>,
    server: ServerDescription,
    writer: Arc<dyn super::Writer>,
    runtime: tokio::runtime::Handle,
) {
    let mut backoff_secs: u32 = 0;
    while let Some(frame) = queue.pop_blocking() {
        let guard = JobGuard::new(&queue, frame.clone());
        let Some(image) = raw_image_of(&frame) else {
            guard.defuse();
            continue;
        };

        let result = runtime.block_on(encode_on_remote(&server, &frame, image));
        match result {
            Ok(bytes) => {
                backoff_secs = 0;
                writer.write(EncodedArtifact {
                    index: frame.index,
                    eye: frame.eye,
                    bytes: Arc::new(bytes),
                });
                guard.defuse();
            }
            Err(e) => {
                // Backoff grows by 10s per consecutive failure, capped at
                // 60s, matching the original remote worker's reconnect pacing.
                backoff_secs = (backoff_secs + 10).min(60);
                warn!(host = %server.host, error = %e, backoff_secs, "remote encode failed");
                drop(guard);
                std::thread::sleep(Duration::from_secs(backoff_secs as u64));
            }
        }
    }
}

async fn encode_on_remote(
    server: &ServerDescription,
    frame: &Frame,
    image: &RawImage,
) -> Result<Vec<u8>, NetworkError> {
    let mut socket = Socket::connect((server.host.as_str(), crate::config::ENCODE_FRAME_PORT)).await?;
    let request = EncodingRequestXml {
        frame_index: frame.index,
        eye: frame.eye.into(),
        width: image.width,
        height: image.height,
        pixel_format: image.format.into(),
        colour_range: image.range.into(),
        server_link_version: SERVER_LINK_VERSION,
    };
    write_encoding_request(&mut socket, &request).await?;
    socket.write_all(&image.data).await?;
    let response = socket.read_framed(crate::socket::MAX_PAYLOAD_SIZE).await?;
    debug!(host = %server.host, index = frame.index, "remote encode succeeded");
    Ok(response)
}
