//! Error type shared by the device binding and the stream controller.

use std::io;

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Requested format or buffer count was invalid or rejected by the device.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// Operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// Device open, mmap or control call failed outside the capture loop.
    #[error("device I/O failed during {op}: {source}")]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Submitting or retrieving a buffer during a capture cycle failed.
    #[error("capture cycle failed during {op}: {source}")]
    Capture {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Writing or flushing the sink failed.
    #[error("sink write failed: {0}")]
    Write(#[source] io::Error),
}

impl Error {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    pub(crate) fn capture(op: &'static str, source: io::Error) -> Self {
        Self::Capture { op, source }
    }
}
