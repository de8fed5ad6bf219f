//! Request/reply exchange with the supervisor.
//!
//! [`Supervisor`] is the seam between the resolution engine and the host:
//! [`LaunchdTransport`] talks to launchd over the bootstrap port on macOS,
//! and tests drive the resolver with scripted implementations.

use thiserror::Error;
use tracing::{debug, trace};

use crate::launchd::protocol::{DEFAULT_SHMEM_SIZE, Reply, Request};

/// Failures of a single supervisor exchange.
///
/// None of these are fatal to resolution: the resolver treats every variant
/// as "no answer from this query" and moves on to its next candidate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Supervisor transport is not available on this platform")]
    Unsupported,

    #[error("Bootstrap port lookup failed: kern_return {0}")]
    PortLookup(i32),

    #[error("Failed to create pipe to the bootstrap port")]
    Pipe,

    #[error("Pipe routine failed with {code}: {message}")]
    Routine { code: i32, message: String },

    #[error("Supervisor returned error {code}: {message}")]
    Supervisor { code: i64, message: String },

    #[error("Supervisor wrote no bytes")]
    EmptyReply,

    #[error("Supervisor reported {written} bytes written into a {capacity}-byte region")]
    Oversized { written: u64, capacity: usize },

    #[error("Reply payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

impl TransportError {
    /// Whether the channel to the supervisor itself is unavailable, as
    /// opposed to the supervisor rejecting or garbling one request.
    pub const fn is_channel_failure(&self) -> bool {
        matches!(self, Self::Unsupported | Self::PortLookup(_) | Self::Pipe)
    }
}

/// One request/reply exchange with the process supervisor.
pub trait Supervisor: Send + Sync {
    /// Sends `request` and waits for the reply.
    ///
    /// There is no timeout: a supervisor that never answers blocks the
    /// calling thread.
    fn send(&self, request: &Request) -> Result<Reply, TransportError>;
}

impl<S: Supervisor + ?Sized> Supervisor for std::sync::Arc<S> {
    fn send(&self, request: &Request) -> Result<Reply, TransportError> {
        (**self).send(request)
    }
}

impl<S: Supervisor + ?Sized> Supervisor for &S {
    fn send(&self, request: &Request) -> Result<Reply, TransportError> {
        (**self).send(request)
    }
}

/// Validates the `bytes-written` count of a textual reply and copies the
/// valid prefix out of the region.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn decode_text_payload(region: &[u8], written: u64) -> Result<String, TransportError> {
    if written == 0 {
        return Err(TransportError::EmptyReply);
    }
    let len = usize::try_from(written)
        .ok()
        .filter(|len| *len <= region.len())
        .ok_or(TransportError::Oversized {
            written,
            capacity: region.len(),
        })?;
    let bytes = region.get(..len).ok_or(TransportError::Oversized {
        written,
        capacity: region.len(),
    })?;
    // The supervisor NUL-terminates its dump; the terminator is not text.
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(ToOwned::to_owned)
        .map_err(|_err| TransportError::InvalidUtf8)
}

/// Supervisor transport over the process's bootstrap port.
#[derive(Debug, Clone)]
pub struct LaunchdTransport {
    shmem_size: usize,
}

impl LaunchdTransport {
    /// Creates a transport whose textual replies use a region of `shmem_size` bytes.
    pub fn new(shmem_size: usize) -> Self {
        Self { shmem_size }
    }

    pub const fn shmem_size(&self) -> usize {
        self.shmem_size
    }
}

impl Default for LaunchdTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SHMEM_SIZE)
    }
}

impl Supervisor for LaunchdTransport {
    fn send(&self, request: &Request) -> Result<Reply, TransportError> {
        trace!(
            routine = %request.routine,
            handle = request.handle,
            domain_type = request.domain_type,
            name = ?request.name,
            "Sending supervisor request"
        );

        #[cfg(target_os = "macos")]
        let result = crate::launchd::ffi::exchange(request, self.shmem_size);

        #[cfg(not(target_os = "macos"))]
        let result = Err(TransportError::Unsupported);

        if let Err(ref e) = result {
            debug!(routine = %request.routine, name = ?request.name, error = %e, "Supervisor request failed");
        }
        result
    }
}
