// ABOUTME: The J2K Encoder worker-pool scheduler
// ABOUTME: Owns the shared job queue and the set of live worker threads, rebuilt as config/servers change

pub mod thread;

use crate::codec::Codec;
use crate::config::{ConfigHandle, SERVER_LINK_VERSION};
use crate::error::{EngineError, ExceptionStore};
use crate::gpu::GpuMessenger;
use crate::types::{EncodedArtifact, Frame, ServerDescription};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Consecutive GPU failures tolerated before the scheduler gives up on GPU
/// offload entirely for the rest of the run.
const GPU_GIVE_UP_AFTER: u32 = 3;

/// The queue shared between `encode()` callers and worker threads. A plain
/// `Mutex<VecDeque>` + `Condvar`, matching the scheduler core's "parallel OS
/// threads throughout" concurrency model rather than an async channel.
pub struct SharedQueue {
    inner: Mutex<VecDeque<Frame>>,
    not_empty: Condvar,
    not_full: Condvar,
    terminating: AtomicBool,
}

impl SharedQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            terminating: AtomicBool::new(false),
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Blocks the caller until the queue has room, matching the scheduler's
    /// back-pressure threshold of `2 * worker_count + 1`.
    fn push_back_blocking(&self, frame: Frame, capacity: usize) {
        let mut queue = self.inner.lock().unwrap();
        while queue.len() >= capacity && !self.terminating.load(Ordering::Relaxed) {
            queue = self.not_full.wait(queue).unwrap();
        }
        queue.push_back(frame);
        self.not_empty.notify_one();
    }

    pub fn push_front(&self, frame: Frame) {
        let mut queue = self.inner.lock().unwrap();
        queue.push_front(frame);
        self.not_empty.notify_one();
    }

    /// Blocks until a frame is available or the queue is told to shut down.
    pub fn pop_blocking(&self) -> Option<Frame> {
        let mut queue = self.inner.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                self.not_full.notify_one();
                return Some(frame);
            }
            if self.terminating.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _timeout) = self
                .not_empty
                .wait_timeout(queue, Duration::from_millis(200))
                .unwrap();
            queue = guard;
        }
    }

    fn shut_down(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Destination for encoded output, and the set of pre-processing shortcuts
/// the scheduler consults before ever touching a worker thread.
pub trait Writer: Send + Sync {
    /// True if `frame` doesn't need encoding at all (e.g. it's a black
    /// frame a player is allowed to substitute on its own).
    fn can_fake_write(&self, frame: &Frame) -> bool;
    fn fake_write(&self, frame: &Frame);

    /// If some earlier frame has identical raw pixels, return its already
    /// written artifact bytes so the scheduler can reuse them without a
    /// second encode.
    fn can_repeat(&self, frame: &Frame) -> Option<Arc<Vec<u8>>>;
    fn repeat(&self, frame: &Frame, bytes: Arc<Vec<u8>>);

    fn write(&self, artifact: EncodedArtifact);
    fn rethrow(&self) -> Result<(), EngineError>;
}

struct WorkerHandle {
    kind: thread::WorkerKind,
    join: std::thread::JoinHandle<()>,
}

/// Desired worker counts, derived from a configuration snapshot and the
/// current server list.
#[derive(Debug, Clone, Default)]
struct DesiredPool {
    cpu: usize,
    gpu: usize,
    remote: Vec<ServerDescription>,
}

fn desired_pool(config: &ConfigHandle, servers: &[ServerDescription]) -> DesiredPool {
    let snapshot = config.current();
    let mut pool = DesiredPool::default();

    if snapshot.gpu_enabled {
        pool.gpu = snapshot.master_encoder_threads;
    } else if !snapshot.only_servers_encode {
        pool.cpu = snapshot.master_encoder_threads;
    }

    pool.remote = servers
        .iter()
        .filter(|s| s.protocol_matches(SERVER_LINK_VERSION))
        .cloned()
        .collect();

    // If nothing else is going to do any work, fall back to a single local
    // thread rather than silently stalling forever.
    if pool.cpu == 0 && pool.gpu == 0 && pool.remote.is_empty() {
        pool.cpu = 1;
    }

    pool
}

pub struct J2kEncoder {
    queue: Arc<SharedQueue>,
    workers: Mutex<Vec<WorkerHandle>>,
    codec: Arc<dyn Codec>,
    gpu_messenger: Arc<dyn GpuMessenger>,
    writer: Arc<dyn Writer>,
    config: ConfigHandle,
    exceptions: Arc<ExceptionStore>,
    runtime: tokio::runtime::Handle,
    gpu_given_up: Arc<AtomicBool>,
}

impl J2kEncoder {
    pub fn new(
        codec: Arc<dyn Codec>,
        gpu_messenger: Arc<dyn GpuMessenger>,
        writer: Arc<dyn Writer>,
        config: ConfigHandle,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            queue: Arc::new(SharedQueue::new()),
            workers: Mutex::new(Vec::new()),
            codec,
            gpu_messenger,
            writer,
            config,
            exceptions: Arc::new(ExceptionStore::new()),
            runtime,
            gpu_given_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn begin(&self, servers: &[ServerDescription]) {
        self.rebuild_workers(servers);
    }

    fn back_pressure_capacity(&self) -> usize {
        2 * self.workers.lock().unwrap().len().max(1) + 1
    }

    /// Submits a frame, applying the pre-processing shortcuts in order
    /// before ever touching the queue:
    /// 0. re-raise anything a worker thread has stashed since the last call;
    /// 1. the writer can fake the output entirely;
    /// 2. the frame already carries J2K bytes (nothing to re-encode);
    /// 3. an earlier frame with identical raw pixels can be repeated;
    /// 4. otherwise, enqueue for a worker, blocking under back-pressure.
    pub fn encode(&self, frame: Frame) -> Result<(), EngineError> {
        self.writer.rethrow()?;
        self.exceptions.rethrow()?;

        if self.writer.can_fake_write(&frame) {
            self.writer.fake_write(&frame);
            return Ok(());
        }
        if frame.has_j2k() {
            if let crate::types::FramePayload::AlreadyEncoded(bytes) = &frame.payload {
                self.writer.write(EncodedArtifact {
                    index: frame.index,
                    eye: frame.eye,
                    bytes: bytes.clone(),
                });
            }
            return Ok(());
        }
        if let Some(bytes) = self.writer.can_repeat(&frame) {
            self.writer.repeat(&frame, bytes);
            return Ok(());
        }
        let capacity = self.back_pressure_capacity();
        self.queue.push_back_blocking(frame, capacity);
        Ok(())
    }

    pub fn rebuild_workers(&self, servers: &[ServerDescription]) {
        if self.gpu_given_up.load(Ordering::Relaxed) {
            // Force a CPU-only pool once GPU offload has been abandoned,
            // regardless of what the config snapshot still says.
            let mut snapshot = self.config.current();
            if snapshot.gpu_enabled {
                snapshot.gpu_enabled = false;
                if snapshot.master_encoder_threads == 0 {
                    snapshot.master_encoder_threads = 1;
                }
                self.config.set(snapshot);
            }
        }

        let desired = desired_pool(&self.config, servers);
        let mut workers = self.workers.lock().unwrap();

        // Stop workers whose kind is no longer desired, and tally what
        // survives so we only start what's missing. Remote workers are
        // wanted per-server, up to that server's own reported thread count,
        // not just one worker per live server.
        let mut kept_cpu = 0;
        let mut kept_gpu = 0;
        let mut kept_remote: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let desired_remote_threads: std::collections::HashMap<&str, usize> = desired
            .remote
            .iter()
            .map(|s| (s.host.as_str(), s.threads))
            .collect();

        workers.retain(|w| match &w.kind {
            thread::WorkerKind::Local if kept_cpu < desired.cpu => {
                kept_cpu += 1;
                true
            }
            thread::WorkerKind::Gpu if kept_gpu < desired.gpu => {
                kept_gpu += 1;
                true
            }
            thread::WorkerKind::Remote(s) => {
                let wanted = desired_remote_threads.get(s.host.as_str()).copied().unwrap_or(0);
                let kept = kept_remote.entry(s.host.clone()).or_insert(0);
                if *kept < wanted {
                    *kept += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        });

        for _ in kept_cpu..desired.cpu {
            self.spawn_worker(&mut workers, thread::WorkerKind::Local);
        }
        for _ in kept_gpu..desired.gpu {
            self.spawn_worker(&mut workers, thread::WorkerKind::Gpu);
        }
        for server in &desired.remote {
            let have = kept_remote.get(&server.host).copied().unwrap_or(0);
            for _ in have..server.threads {
                self.spawn_worker(&mut workers, thread::WorkerKind::Remote(server.clone()));
            }
        }

        info!(
            cpu = desired.cpu,
            gpu = desired.gpu,
            remote = desired.remote.len(),
            "worker pool rebuilt"
        );
    }

    fn spawn_worker(&self, workers: &mut Vec<WorkerHandle>, kind: thread::WorkerKind) {
        let queue = self.queue.clone();
        let writer = self.writer.clone();
        let exceptions = self.exceptions.clone();
        let join = match kind.clone() {
            thread::WorkerKind::Local => {
                let codec = self.codec.clone();
                std::thread::spawn(move || thread::run_local_worker(queue, codec, writer, exceptions))
            }
            thread::WorkerKind::Gpu => {
                let messenger = self.gpu_messenger.clone();
                let gpu_given_up = self.gpu_given_up.clone();
                std::thread::spawn(move || {
                    thread::run_gpu_worker(queue, messenger, writer, exceptions, GPU_GIVE_UP_AFTER);
                    gpu_given_up.store(true, Ordering::SeqCst);
                })
            }
            thread::WorkerKind::Remote(server) => {
                let runtime = self.runtime.clone();
                std::thread::spawn(move || thread::run_remote_worker(queue, server, writer, runtime))
            }
        };
        workers.push(WorkerHandle { kind, join });
    }

    pub fn rethrow(&self) -> Result<(), EngineError> {
        self.exceptions.rethrow()?;
        self.writer.rethrow()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Orderly shutdown: let in-flight work drain, then stop all
    /// worker threads, rethrow any stored error, and finally mop up whatever
    /// is still sitting on the queue synchronously on this thread.
    pub fn end(&self) -> Result<(), EngineError> {
        while self.queue.len() > 0 {
            std::thread::sleep(Duration::from_millis(50));
        }
        self.terminate_threads();
        self.rethrow()?;
        self.mop_up_residual_queue();
        Ok(())
    }

    fn terminate_threads(&self) {
        self.queue.shut_down();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            if worker.join.join().is_err() {
                warn!(kind = worker.kind.label(), "worker thread panicked during shutdown");
            }
        }
    }

    fn mop_up_residual_queue(&self) {
        while let Some(frame) = {
            let mut queue = self.queue.inner.lock().unwrap();
            queue.pop_front()
        } {
            if let crate::types::FramePayload::Raw(image) = &frame.payload {
                if let Ok(bytes) = self.codec.encode(image) {
                    self.writer.write(EncodedArtifact {
                        index: frame.index,
                        eye: frame.eye,
                        bytes: Arc::new(bytes),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeterministicCodec;
    use crate::config::ConfigSnapshot;
    use crate::gpu::UnavailableGpuMessenger;
    use crate::types::{Eye, FramePayload, PixelFormat, RawImage};
    use std::sync::Mutex as StdMutex;

    struct RecordingWriter {
        written: StdMutex<Vec<u64>>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            Self {
                written: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Writer for RecordingWriter {
        fn can_fake_write(&self, _frame: &Frame) -> bool {
            false
        }
        fn fake_write(&self, _frame: &Frame) {}
        fn can_repeat(&self, _frame: &Frame) -> Option<Arc<Vec<u8>>> {
            None
        }
        fn repeat(&self, _frame: &Frame, _bytes: Arc<Vec<u8>>) {}
        fn write(&self, artifact: EncodedArtifact) {
            self.written.lock().unwrap().push(artifact.index);
        }
        fn rethrow(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn raw_frame(index: u64) -> Frame {
        Frame {
            index,
            eye: Eye::Both,
            presentation_time: Duration::from_secs(index),
            payload: FramePayload::Raw(RawImage::new(4, 4, PixelFormat::Rgb24, vec![index as u8; 48])),
            needs_reprepare: false,
        }
    }

    #[test]
    fn encodes_and_drains_a_small_batch() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let writer = Arc::new(RecordingWriter::new());
        let encoder = J2kEncoder::new(
            Arc::new(DeterministicCodec),
            Arc::new(UnavailableGpuMessenger),
            writer.clone(),
            ConfigHandle::new(ConfigSnapshot {
                master_encoder_threads: 2,
                ..ConfigSnapshot::default()
            }),
            rt.handle().clone(),
        );
        encoder.begin(&[]);

        for i in 0..5 {
            encoder.encode(raw_frame(i)).unwrap();
        }

        encoder.end().unwrap();
        let mut written = writer.written.lock().unwrap().clone();
        written.sort();
        assert_eq!(written, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fallback_to_one_cpu_thread_when_pool_would_be_empty() {
        let config = ConfigHandle::new(ConfigSnapshot {
            master_encoder_threads: 0,
            only_servers_encode: true,
            ..ConfigSnapshot::default()
        });
        let pool = desired_pool(&config, &[]);
        assert_eq!(pool.cpu, 1);
        assert_eq!(pool.gpu, 0);
    }

    #[test]
    fn gpu_enabled_uses_master_thread_count_not_a_single_thread() {
        let config = ConfigHandle::new(ConfigSnapshot {
            master_encoder_threads: 4,
            gpu_enabled: true,
            ..ConfigSnapshot::default()
        });
        let pool = desired_pool(&config, &[]);
        assert_eq!(pool.gpu, 4);
        assert_eq!(pool.cpu, 0);
    }

    #[test]
    fn remote_worker_count_tracks_server_reported_threads() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let writer = Arc::new(RecordingWriter::new());
        let encoder = J2kEncoder::new(
            Arc::new(DeterministicCodec),
            Arc::new(UnavailableGpuMessenger),
            writer,
            ConfigHandle::new(ConfigSnapshot {
                master_encoder_threads: 0,
                only_servers_encode: true,
                ..ConfigSnapshot::default()
            }),
            rt.handle().clone(),
        );

        let server = ServerDescription::new("10.0.0.5".to_string(), 6, SERVER_LINK_VERSION);
        encoder.begin(&[server.clone()]);

        let remote_workers = encoder
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| matches!(&w.kind, thread::WorkerKind::Remote(s) if s.host == server.host))
            .count();
        assert_eq!(remote_workers, 6);

        encoder.terminate_threads();
    }
}
