// ABOUTME: Error kinds shared across the encoding engine (network, codec, scheduler invariants)
// ABOUTME: Provides the ExceptionStore pattern used by worker threads to defer a fault to the next poll

use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Errors raised by the socket & framing layer and anything built on it.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Checksums do not match")]
    ChecksumMismatch,

    #[error("Malformed request (too large)")]
    TooLarge,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the codec / encoder thread pool.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("codec refused frame {index} ({reason})")]
    CodecRefused { index: u64, reason: String },

    #[error("GPU acceleration is enabled but the decoder is not working. Please check your configuration and license, and ensure that you are connected to the internet.")]
    GpuGaveUp,
}

/// A violated invariant. Unrecoverable: the component that raises one
/// aborts its own thread rather than continuing in an inconsistent state.
#[derive(Debug, Error)]
#[error("programming error at {file}:{line}: {message}")]
pub struct ProgrammingError {
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

impl ProgrammingError {
    pub fn new(file: &'static str, line: u32, message: impl Into<String>) -> Self {
        Self {
            file,
            line,
            message: message.into(),
        }
    }
}

/// Top-level error type for anything that can cross a scheduler boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Programming(#[from] ProgrammingError),
}

/// Stores at most one error raised by a worker thread ("run() catches
/// everything, rethrow() re-raises it once on whichever thread polls next"),
/// mirroring `exception_store.h` in the original implementation.
pub struct ExceptionStore {
    stored: Mutex<Option<EngineError>>,
}

impl fmt::Debug for ExceptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionStore").finish_non_exhaustive()
    }
}

impl Default for ExceptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionStore {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(None),
        }
    }

    /// Record an error, overwriting anything already stored. Matches the
    /// original's "only one will be rethrown, I think" comment: we keep the
    /// first one, since the first worker to fail is usually the most useful
    /// signal and later retries would otherwise clobber it.
    pub fn store(&self, error: EngineError) {
        let mut guard = self.stored.lock().unwrap();
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    /// Re-raise and clear the stored error, if any.
    pub fn rethrow(&self) -> Result<(), EngineError> {
        if let Some(error) = self.stored.lock().unwrap().take() {
            Err(error)
        } else {
            Ok(())
        }
    }

    pub fn has_error(&self) -> bool {
        self.stored.lock().unwrap().is_some()
    }
}
