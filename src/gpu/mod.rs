// ABOUTME: GPU offload messenger: POSIX shared memory + semaphore handoff to a co-process
// ABOUTME: Grounded on grok/messenger.h's GRK_MSGR_* control vocabulary and shared ring buffer

use crate::codec::MINIMUM_COMPRESSED_SIZE;
use crate::error::EncodeError;
use crate::types::RawImage;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::collections::HashMap;
use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Control tokens exchanged with the offload co-process over the shared
/// region, ASCII the way `grok/messenger.h` frames its handshake. This
/// messenger only implements the single-slot synchronous subset of that
/// vocabulary (one frame in flight at a time); the full batch grammar
/// (`SUBMIT_UNCOMPRESSED`/`PROCESSED_UNCOMPRESSED`/`SUBMIT_COMPRESSED`/
/// `PROCESSED_COMPRESSED`/`FLUSH`) is not implemented.
pub const GRK_MSGR_INIT: &str = "init";
pub const GRK_MSGR_COMPRESS: &str = "compress";
pub const GRK_MSGR_COMPRESSED: &str = "compressed";
pub const GRK_MSGR_SHUTDOWN: &str = "shutdown";

/// Every region write starts with a zero-padded ASCII command tag so the
/// co-process (and this side, on the way back) knows what the bytes that
/// follow mean.
const COMMAND_HEADER_LEN: usize = 16;

fn encode_command_header(command: &str) -> [u8; COMMAND_HEADER_LEN] {
    let mut header = [0u8; COMMAND_HEADER_LEN];
    let bytes = command.as_bytes();
    let len = bytes.len().min(COMMAND_HEADER_LEN);
    header[..len].copy_from_slice(&bytes[..len]);
    header
}

fn decode_command_header(header: &[u8]) -> &str {
    let len = header.iter().position(|&b| b == 0).unwrap_or(header.len());
    std::str::from_utf8(&header[..len]).unwrap_or("")
}

/// Something that will turn a raw image into compressed bytes without
/// running on this thread. The real implementation talks to a co-process
/// over shared memory; tests use a local stand-in.
pub trait GpuMessenger: Send + Sync {
    fn encode(&self, image: &RawImage) -> Result<Vec<u8>, EncodeError>;
}

struct FrameProxy {
    offset: usize,
    capacity: usize,
}

/// Shared memory region plus the semaphore pair used to hand frames to the
/// offload co-process and get compressed results back. One instance per
/// running encode session.
pub struct SharedMemoryMessenger {
    region: *mut u8,
    region_len: usize,
    sem_sent: NamedSemaphore,
    sem_ready: NamedSemaphore,
    scheduled: Mutex<HashMap<u64, FrameProxy>>,
    next_frame_id: AtomicU64,
    shm_name: String,
}

// The raw pointer only ever points at mmap'd shared memory; access is
// serialized by the semaphore handshake below, not by any Rust-visible lock.
unsafe impl Send for SharedMemoryMessenger {}
unsafe impl Sync for SharedMemoryMessenger {}

impl SharedMemoryMessenger {
    pub fn new(session_id: u64, region_len: usize) -> Result<Self, EncodeError> {
        let shm_name = format!("/dcp-encode-engine-gpu-{session_id}");
        let fd = open_shared_memory(&shm_name, region_len)
            .map_err(|e| EncodeError::CodecRefused {
                index: 0,
                reason: format!("failed to open shared memory: {e}"),
            })?;

        let region = unsafe {
            mmap(
                None,
                NonZeroUsize::new(region_len).expect("region_len must be nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
            .map_err(|e| EncodeError::CodecRefused {
                index: 0,
                reason: format!("mmap failed: {e}"),
            })?
        }
        .as_ptr() as *mut u8;

        let sem_sent = NamedSemaphore::create(&format!("{shm_name}-sent"))?;
        let sem_ready = NamedSemaphore::create(&format!("{shm_name}-ready"))?;

        debug!(shm_name, region_len, "gpu messenger initialised");

        let messenger = Self {
            region,
            region_len,
            sem_sent,
            sem_ready,
            scheduled: Mutex::new(HashMap::new()),
            next_frame_id: AtomicU64::new(0),
            shm_name,
        };
        // Announce the command vocabulary the region will speak; doesn't
        // wait for an ack so construction never blocks on a co-process that
        // hasn't started yet.
        messenger.write_command(GRK_MSGR_INIT, &[]);
        Ok(messenger)
    }

    fn payload_capacity(&self) -> usize {
        self.region_len - COMMAND_HEADER_LEN
    }

    /// Writes a command tag followed by `bytes` into the shared region.
    fn write_command(&self, command: &str, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.payload_capacity(),
            "frame exceeds shared region"
        );
        let header = encode_command_header(command);
        // SAFETY: `region` is a valid mmap'd mapping of `region_len` bytes
        // for the lifetime of `self`, and the semaphore pair below ensures
        // the co-process isn't reading this slot concurrently.
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.region, COMMAND_HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.region.add(COMMAND_HEADER_LEN),
                bytes.len(),
            );
        }
    }

    /// Reads back a command tag and its payload, the inverse of
    /// `write_command`.
    fn read_command(&self, len: usize) -> (String, Vec<u8>) {
        let mut header = [0u8; COMMAND_HEADER_LEN];
        let len = len.max(MINIMUM_COMPRESSED_SIZE).min(self.payload_capacity());
        let mut out = vec![0u8; len];
        // SAFETY: see write_command.
        unsafe {
            std::ptr::copy_nonoverlapping(self.region, header.as_mut_ptr(), COMMAND_HEADER_LEN);
            std::ptr::copy_nonoverlapping(
                self.region.add(COMMAND_HEADER_LEN),
                out.as_mut_ptr(),
                len,
            );
        }
        (decode_command_header(&header).to_string(), out)
    }

    pub fn shutdown(&self) {
        debug!(shm_name = %self.shm_name, "gpu messenger shutting down");
        self.write_command(GRK_MSGR_SHUTDOWN, &[]);
        let _ = self.sem_sent.post();
        let _ = shm_unlink(self.shm_name.as_str());
    }
}

impl Drop for SharedMemoryMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl GpuMessenger for SharedMemoryMessenger {
    fn encode(&self, image: &RawImage) -> Result<Vec<u8>, EncodeError> {
        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        self.scheduled.lock().unwrap().insert(
            frame_id,
            FrameProxy {
                offset: 0,
                capacity: self.payload_capacity(),
            },
        );

        self.write_command(GRK_MSGR_COMPRESS, &image.data);
        self.sem_sent
            .post()
            .map_err(|e| EncodeError::CodecRefused {
                index: frame_id,
                reason: format!("failed to signal co-process: {e}"),
            })?;

        self.sem_ready
            .wait_timeout(std::time::Duration::from_secs(30))
            .map_err(|e| EncodeError::CodecRefused {
                index: frame_id,
                reason: format!("co-process did not respond: {e}"),
            })?;

        self.scheduled.lock().unwrap().remove(&frame_id);
        let (reply, bytes) = self.read_command(self.payload_capacity());
        if reply != GRK_MSGR_COMPRESSED {
            return Err(EncodeError::CodecRefused {
                index: frame_id,
                reason: format!("expected a '{GRK_MSGR_COMPRESSED}' reply, got '{reply}'"),
            });
        }
        Ok(bytes)
    }
}

fn open_shared_memory(name: &str, len: usize) -> nix::Result<OwnedFd> {
    let fd = shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )?;
    ftruncate(&fd, len as i64)?;
    Ok(fd)
}

/// A thin wrapper around a POSIX named semaphore (`sem_open`/`sem_post`/
/// `sem_timedwait`). `nix` doesn't wrap the named-semaphore family, so this
/// goes directly through `libc`, matching how the original talks to the same
/// API from C++.
struct NamedSemaphore {
    handle: *mut libc::sem_t,
    name: CString,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn create(name: &str) -> Result<Self, EncodeError> {
        let cname = CString::new(name).expect("semaphore name must not contain NUL");
        // SAFETY: sem_open with O_CREAT writes into process-global semaphore
        // state; `cname` stays alive for the call, and the returned handle is
        // only ever used by this struct's own methods.
        let handle = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600, 0) };
        if handle.is_null() || handle as isize == libc::SEM_FAILED as isize {
            return Err(EncodeError::CodecRefused {
                index: 0,
                reason: format!("sem_open({name}) failed"),
            });
        }
        Ok(Self { handle, name: cname })
    }

    fn post(&self) -> Result<(), EncodeError> {
        // SAFETY: `handle` was returned by a successful sem_open and is not
        // shared outside this struct's own exclusive methods.
        let rc = unsafe { libc::sem_post(self.handle) };
        if rc != 0 {
            return Err(EncodeError::CodecRefused {
                index: 0,
                reason: "sem_post failed".into(),
            });
        }
        Ok(())
    }

    fn wait_timeout(&self, timeout: std::time::Duration) -> Result<(), EncodeError> {
        // sem_timedwait wants an absolute CLOCK_REALTIME deadline, not a
        // relative one.
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: CLOCK_REALTIME is always valid; `deadline` is stack-local.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
            return Err(EncodeError::CodecRefused {
                index: 0,
                reason: "clock_gettime failed".into(),
            });
        }
        deadline.tv_sec += timeout.as_secs() as libc::time_t;
        deadline.tv_nsec += timeout.subsec_nanos() as i64;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }
        // SAFETY: see post().
        let rc = unsafe { libc::sem_timedwait(self.handle, &deadline) };
        if rc != 0 {
            return Err(EncodeError::CodecRefused {
                index: 0,
                reason: "sem_timedwait timed out".into(),
            });
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: handle came from sem_open and is dropped at most once.
        unsafe {
            libc::sem_close(self.handle);
        }
        let _ = unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

/// An in-process stand-in used by tests and local-only runs where no GPU
/// co-process is actually available. Always reports failure so the
/// scheduler's give-up policy can be exercised deterministically.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGpuMessenger;

impl GpuMessenger for UnavailableGpuMessenger {
    fn encode(&self, _image: &RawImage) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::CodecRefused {
            index: 0,
            reason: "no GPU co-process configured".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    #[test]
    fn unavailable_messenger_always_refuses() {
        let messenger = UnavailableGpuMessenger;
        let image = RawImage::new(4, 4, PixelFormat::Rgb24, vec![0u8; 48]);
        assert!(messenger.encode(&image).is_err());
    }
}
