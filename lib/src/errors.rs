//! Error types used by this lib.
use std::io;
use thiserror::Error;

use crate::channel::Channel;

/// Malformed or unsupported binary input from the capture device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("buffer underflow")]
    BufferUnderflow,
    #[error("unsupported format: {0}")]
    UnsupportedFormat(&'static str),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("device is down")]
    DeviceDown,
    #[error("capture read timeout exceeded")]
    ReadTimeout,
    #[error("cannot operate on closed handle")]
    Closed,
    #[error("permission denied for: {path}")]
    PermissionDenied { path: String },
    #[error("no capture device could be opened")]
    NoDeviceAvailable,
    #[error("no such device: {interface}")]
    NoSuchDevice { interface: String },
    #[error("interface is down: {interface}")]
    InterfaceDown { interface: String },
    #[error("invalid interface name: {0:?}")]
    InvalidInterfaceName(String),
    #[error("could not negotiate a read buffer size")]
    BufferNegotiation,
    #[error("invalid read buffer size {0}")]
    InvalidBufferSize(usize),
    #[error("invalid read timeout {0:?}: must be at least one microsecond")]
    InvalidReadTimeout(std::time::Duration),
    #[error("unsupported buffer size {requested} (granted {granted})")]
    UnsupportedBufferSize { requested: usize, granted: usize },
    #[error("could not use an 802.11 data-link type")]
    NoDatalink,
    #[error("capture device not configured: {0} missing")]
    NotConfigured(&'static str),
    #[error("full packet was not sent: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("{context} failed: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    /// Whether the failed operation is expected to succeed when simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::ReadTimeout)
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CaptureError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot operate on released channel controller")]
    Closed,
    #[error("channel {} is not supported by the interface", .0.number)]
    Unsupported(Channel),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} returned non-zero status {status:?}: {stderr}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("could not parse channel information from {input:?}")]
    Parse { input: String },
}
